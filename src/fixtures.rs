//! Offline data bundle for the CLI and tests

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{InboxError, Result};
use crate::history::{InMemoryHistory, ThreadFixture};
use crate::knowledge::EmbeddingIndex;
use crate::models::KnowledgeDocument;
use crate::roster::InMemoryRoster;
use crate::roster::memory::RosterFixture;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub roster: RosterFixture,
    #[serde(default)]
    pub knowledge: Vec<KnowledgeDocument>,
    #[serde(default)]
    pub threads: Vec<ThreadFixture>,
}

impl Fixtures {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| InboxError::Config {
            message: format!("cannot read fixtures {}: {}", path.display(), e),
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn roster(&self) -> InMemoryRoster {
        InMemoryRoster::from_fixture(self.roster.clone())
    }

    pub async fn history(&self) -> InMemoryHistory {
        InMemoryHistory::from_fixtures(self.threads.clone()).await
    }

    /// Embed and index every knowledge document. Returns how many were added.
    pub async fn index_knowledge(&self, index: &EmbeddingIndex) -> Result<usize> {
        for doc in &self.knowledge {
            index.insert_document(doc.clone()).await?;
        }
        tracing::info!(documents = self.knowledge.len(), "knowledge indexed");
        Ok(self.knowledge.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_optional() {
        let fixtures: Fixtures = serde_json::from_str(
            r#"{ "knowledge": [{ "id": "kb1", "title": "Practice", "content": "Tuesdays" }] }"#,
        )
        .unwrap();
        assert!(fixtures.roster.families.is_empty());
        assert_eq!(fixtures.knowledge.len(), 1);
        assert!(fixtures.threads.is_empty());
    }
}
