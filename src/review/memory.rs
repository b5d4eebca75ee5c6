use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

use super::{ReviewQueueEntry, ReviewStatus, ReviewStore};

/// Process-local store for tests and one-shot runs.
#[derive(Default)]
pub struct InMemoryReviewStore {
    entries: RwLock<HashMap<String, ReviewQueueEntry>>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn save(&self, entry: &ReviewQueueEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ReviewQueueEntry>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn list(&self, status: Option<ReviewStatus>) -> Result<Vec<ReviewQueueEntry>> {
        let entries = self.entries.read().await;
        let mut listed: Vec<ReviewQueueEntry> = entries
            .values()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(listed)
    }
}
