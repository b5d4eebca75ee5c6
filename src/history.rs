//! Prior conversation turns for a mail thread

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::ConversationTurn;

#[async_trait]
pub trait ConversationHistory: Send + Sync {
    /// The most recent `limit` turns of a thread, oldest first.
    async fn recent_turns(&self, thread_id: &str, limit: usize) -> Result<Vec<ConversationTurn>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadFixture {
    pub thread_id: String,
    pub turns: Vec<ConversationTurn>,
}

#[derive(Default)]
pub struct InMemoryHistory {
    threads: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_fixtures(fixtures: Vec<ThreadFixture>) -> Self {
        let history = Self::new();
        for fixture in fixtures {
            for turn in fixture.turns {
                history.record(&fixture.thread_id, turn).await;
            }
        }
        history
    }

    /// Append a turn, keeping the thread ordered by send time.
    pub async fn record(&self, thread_id: &str, turn: ConversationTurn) {
        let mut threads = self.threads.write().await;
        let turns = threads.entry(thread_id.to_string()).or_default();
        let at = turns.partition_point(|t| t.sent_at <= turn.sent_at);
        turns.insert(at, turn);
    }
}

#[async_trait]
impl ConversationHistory for InMemoryHistory {
    async fn recent_turns(&self, thread_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let threads = self.threads.read().await;
        let Some(turns) = threads.get(thread_id) else {
            return Ok(Vec::new());
        };
        let skip = turns.len().saturating_sub(limit);
        Ok(turns[skip..].to_vec())
    }
}
