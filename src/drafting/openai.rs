use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::config::DraftingConfig;
use crate::error::{InboxError, Result};

use super::{Completion, CompletionProvider, CompletionRequest, FinishReason, ProviderError};

/// Chat-completions provider (OpenAI or any compatible endpoint).
pub struct OpenAiChat {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(api_key: String, model: String, api_url: String, timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(InboxError::Config {
                message: "OPENAI_API_KEY is required for drafting".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InboxError::Config {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            api_url,
            api_key,
            model,
        })
    }

    pub fn from_config(config: &DraftingConfig, api_key: Option<&str>) -> Result<Self> {
        Self::new(
            api_key.unwrap_or_default().to_string(),
            config.model.clone(),
            config.api_url.clone(),
            config.timeout(),
        )
    }
}

#[async_trait]
impl CompletionProvider for OpenAiChat {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: text.chars().take(500).collect(),
            });
        }

        let val: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        parse_chat_response(&val)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

fn parse_chat_response(val: &Value) -> std::result::Result<Completion, ProviderError> {
    let choice = val
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ProviderError::Parse("response has no choices".to_string()))?;
    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::Parse("choice has no message content".to_string()))?;
    let finish = match choice.get("finish_reason").and_then(|f| f.as_str()) {
        Some("stop") => FinishReason::Complete,
        Some("length") => FinishReason::Truncated,
        _ => FinishReason::Other,
    };
    Ok(Completion {
        text: text.trim().to_string(),
        finish,
    })
}
