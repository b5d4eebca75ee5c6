use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::KnowledgeSearch;
use super::embedder::Embedder;
use super::similarity::{cosine_with_norms, magnitude};
use crate::error::{InboxError, Result};
use crate::models::{KnowledgeCategory, KnowledgeDocument, KnowledgeHit, KnowledgeItem};
use crate::rate_limit::RateLimitedClient;

pub const DEFAULT_LIMIT: usize = 5;
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.7;

struct IndexedItem {
    item: KnowledgeItem,
    norm: f32,
    seq: u64,
}

/// In-memory cosine index over curated knowledge items.
///
/// Vectors are validated on the way in, so search never sees a vector of the
/// wrong length.
pub struct EmbeddingIndex {
    dimensions: usize,
    embedder: Arc<dyn Embedder>,
    client: Arc<RateLimitedClient>,
    items: RwLock<Vec<IndexedItem>>,
    next_seq: AtomicU64,
    query_cache: Mutex<LruCache<blake3::Hash, Arc<Vec<f32>>>>,
}

impl EmbeddingIndex {
    pub fn new(
        dimensions: usize,
        embedder: Arc<dyn Embedder>,
        client: Arc<RateLimitedClient>,
        cache_size: usize,
    ) -> Result<Self> {
        if dimensions == 0 {
            return Err(InboxError::Config {
                message: "embedding dimensions must be non-zero".to_string(),
            });
        }
        if embedder.dimensions() != dimensions {
            return Err(InboxError::Config {
                message: format!(
                    "embedder {} produces {} dimensions, index expects {}",
                    embedder.model(),
                    embedder.dimensions(),
                    dimensions
                ),
            });
        }
        Ok(Self {
            dimensions,
            embedder,
            client,
            items: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Add an already-embedded item. Wrong-length or non-finite vectors and
    /// duplicate ids are rejected.
    pub async fn insert(&self, item: KnowledgeItem) -> Result<()> {
        if item.embedding.len() != self.dimensions {
            return Err(InboxError::Validation {
                message: format!(
                    "knowledge item {} has {} dimensions, expected {}",
                    item.id,
                    item.embedding.len(),
                    self.dimensions
                ),
            });
        }
        if item.embedding.iter().any(|v| !v.is_finite()) {
            return Err(InboxError::Validation {
                message: format!("knowledge item {} has non-finite vector values", item.id),
            });
        }
        if !(0.0..=1.0).contains(&item.relevance_score) {
            return Err(InboxError::Validation {
                message: format!(
                    "knowledge item {} relevance score {} outside [0,1]",
                    item.id, item.relevance_score
                ),
            });
        }

        let mut items = self.items.write().await;
        if items.iter().any(|i| i.item.id == item.id) {
            return Err(InboxError::Validation {
                message: format!("knowledge item {} already indexed", item.id),
            });
        }
        let norm = magnitude(&item.embedding);
        if norm == 0.0 {
            debug!(id = %item.id, "zero-magnitude vector indexed; it will never match");
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        items.push(IndexedItem { item, norm, seq });
        Ok(())
    }

    /// Embed `title + content` and index the result.
    pub async fn insert_document(&self, doc: KnowledgeDocument) -> Result<()> {
        let text = doc.embedding_text();
        let embedding = self
            .client
            .execute(|| self.embedder.embed(&text))
            .await?;
        self.insert(doc.with_embedding(embedding)).await
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|i| i.item.id != id);
        items.len() != before
    }

    async fn embed_query(&self, query_text: &str) -> Result<Arc<Vec<f32>>> {
        let key = {
            let mut hasher = blake3::Hasher::new();
            hasher.update(self.embedder.model().as_bytes());
            hasher.update(&[0]);
            hasher.update(query_text.as_bytes());
            hasher.finalize()
        };
        if let Some(hit) = self.query_cache.lock().await.get(&key) {
            debug!("query embedding cache hit");
            return Ok(Arc::clone(hit));
        }

        let vector = self
            .client
            .execute(|| self.embedder.embed(query_text))
            .await?;
        if vector.len() != self.dimensions {
            return Err(InboxError::Validation {
                message: format!(
                    "embedder returned {} dimensions, expected {}",
                    vector.len(),
                    self.dimensions
                ),
            });
        }
        let vector = Arc::new(vector);
        self.query_cache.lock().await.put(key, Arc::clone(&vector));
        Ok(vector)
    }

    /// Embed `query_text` and return the closest items.
    pub async fn search(
        &self,
        query_text: &str,
        limit: usize,
        min_similarity: f32,
        categories: &[KnowledgeCategory],
    ) -> Result<Vec<KnowledgeHit>> {
        if query_text.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let query = self.embed_query(query_text).await?;
        self.search_embedding(&query, limit, min_similarity, categories)
            .await
    }

    /// Top `limit` items with similarity at least `min_similarity`, ordered by
    /// similarity, then relevance score, then insertion order. A non-empty
    /// `categories` restricts candidates before ranking.
    pub async fn search_embedding(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
        categories: &[KnowledgeCategory],
    ) -> Result<Vec<KnowledgeHit>> {
        if query.len() != self.dimensions {
            return Err(InboxError::InvalidRequest {
                dependency: "knowledge".to_string(),
                message: format!(
                    "query has {} dimensions, expected {}",
                    query.len(),
                    self.dimensions
                ),
            });
        }
        let query_norm = magnitude(query);

        let items = self.items.read().await;
        let mut scored: Vec<(f32, &IndexedItem)> = items
            .iter()
            .filter(|indexed| categories.is_empty() || categories.contains(&indexed.item.category))
            .filter_map(|indexed| {
                cosine_with_norms(query, query_norm, &indexed.item.embedding, indexed.norm)
                    .map(|sim| (sim, indexed))
            })
            .filter(|(sim, _)| *sim >= min_similarity)
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.total_cmp(sa)
                .then_with(|| b.item.relevance_score.total_cmp(&a.item.relevance_score))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        scored.truncate(limit);

        let hits: Vec<KnowledgeHit> = scored
            .into_iter()
            .map(|(similarity, indexed)| KnowledgeHit {
                id: indexed.item.id.clone(),
                title: indexed.item.title.clone(),
                content: indexed.item.content.clone(),
                category: indexed.item.category,
                relevance_score: indexed.item.relevance_score,
                similarity,
            })
            .collect();
        info!(
            candidates = items.len(),
            returned = hits.len(),
            min_similarity,
            categories = categories.len(),
            "knowledge search"
        );
        Ok(hits)
    }
}

#[async_trait]
impl KnowledgeSearch for EmbeddingIndex {
    async fn search(
        &self,
        query_text: &str,
        limit: usize,
        min_similarity: f32,
        categories: &[KnowledgeCategory],
    ) -> Result<Vec<KnowledgeHit>> {
        EmbeddingIndex::search(self, query_text, limit, min_similarity, categories).await
    }
}
