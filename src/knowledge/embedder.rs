use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{InboxError, Result};
use crate::rate_limit::CallError;

/// Turns text into a fixed-length vector. One call is one provider request;
/// retries and pacing belong to the caller's `RateLimitedClient`.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, CallError>;
    fn dimensions(&self) -> usize;
    fn model(&self) -> &str;
}

// OpenAI API implementation
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    dims: usize,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct OpenAIResponseData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIResponseData>,
}

impl OpenAIEmbedder {
    pub fn new(api_key: String, model: String, dims: Option<usize>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| InboxError::Config {
                message: format!("Failed to build reqwest client with timeout: {}", e),
            })?;

        let dims = dims.unwrap_or(match model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        });

        Ok(Self {
            client,
            api_url: "https://api.openai.com/v1/embeddings".to_string(),
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, CallError> {
        debug!(
            "Generating OpenAI embedding (model={}, chars={})",
            self.model,
            text.len()
        );

        let body = OpenAIRequest {
            model: &self.model,
            input: text,
            dimensions: self.dims,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(CallError::from_status(status.as_u16(), &error_text));
        }

        let result: OpenAIResponse = response.json().await?;
        result
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| CallError::Transient("No embedding returned from OpenAI".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// Deterministic, local FakeEmbedder for testing/dev (no network)
pub struct FakeEmbedder {
    dims: usize,
}

impl FakeEmbedder {
    pub fn new(dims: Option<usize>) -> Self {
        let d = dims.unwrap_or(1536).max(1);
        Self { dims: d }
    }

    // Stable stream of pseudo-random f32 values in [-1.0, 1.0), normalized
    fn generate(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dims);
        let mut reader = blake3::Hasher::new()
            .update(text.trim().to_lowercase().as_bytes())
            .finalize_xof();
        let mut chunk = [0u8; 4];
        while out.len() < self.dims {
            reader.fill(&mut chunk);
            let v01 = (u32::from_le_bytes(chunk) as f32) / (u32::MAX as f32 + 1.0);
            out.push(v01 * 2.0 - 1.0);
        }

        let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut out {
                *v /= norm;
            }
        }
        out
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, CallError> {
        Ok(self.generate(text))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model(&self) -> &str {
        "fake"
    }
}

/// Pick an embedder from the configured provider name.
///
/// `openai` requires a key; `fake` is deterministic and offline; anything
/// else auto-detects, preferring OpenAI when a key is present.
pub fn create_embedder(
    provider: &str,
    model: &str,
    dims: usize,
    openai_api_key: Option<&str>,
) -> Result<Arc<dyn Embedder>> {
    let is_placeholder = |s: &str| {
        let t = s.trim();
        t.is_empty() || t.contains("${") || t.eq_ignore_ascii_case("changeme")
    };
    let key = openai_api_key.filter(|k| !is_placeholder(k));

    match (provider, key) {
        ("openai", Some(key)) | ("" | "auto", Some(key)) => {
            info!("Using OpenAI embeddings (model={}, dims={})", model, dims);
            Ok(Arc::new(OpenAIEmbedder::new(
                key.to_string(),
                model.to_string(),
                Some(dims),
            )?))
        }
        ("openai", None) => Err(InboxError::Config {
            message: "embedding provider is openai but OPENAI_API_KEY is not set".to_string(),
        }),
        ("fake", _) => {
            info!("Using FakeEmbedder (deterministic) with {} dimensions", dims);
            Ok(Arc::new(FakeEmbedder::new(Some(dims))))
        }
        ("" | "auto", None) => {
            warn!("No embedding key configured; falling back to FakeEmbedder");
            Ok(Arc::new(FakeEmbedder::new(Some(dims))))
        }
        (other, _) => Err(InboxError::Config {
            message: format!("unknown embedding provider '{}'", other),
        }),
    }
}
