//! Knowledge-base similarity search

pub mod embedder;
pub mod index;
pub mod similarity;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{KnowledgeCategory, KnowledgeHit};

pub use embedder::{Embedder, FakeEmbedder, OpenAIEmbedder, create_embedder};
pub use index::{DEFAULT_LIMIT, DEFAULT_MIN_SIMILARITY, EmbeddingIndex};

/// Semantic lookup consumed by the aggregator. An empty result means
/// "no relevant knowledge", not a failure. Empty `categories` searches
/// every category.
#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(
        &self,
        query_text: &str,
        limit: usize,
        min_similarity: f32,
        categories: &[KnowledgeCategory],
    ) -> Result<Vec<KnowledgeHit>>;
}
