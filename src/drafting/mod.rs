//! Reply drafting: prompt assembly, the completion call, and the review gate

pub mod confidence;
pub mod openai;
pub mod prompt;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregator::Clock;
use crate::config::DraftingConfig;
use crate::error::{InboxError, Result};
use crate::models::{AggregatedContext, DraftResult, InboundMessage};
use crate::pipeline::GenerateDraft;

pub use openai::OpenAiChat;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// How the provider ended the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Complete,
    Truncated,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub finish: FinishReason,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// Language-generation collaborator.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, ProviderError>;

    fn name(&self) -> &str;
}

pub struct DraftGenerator {
    provider: Arc<dyn CompletionProvider>,
    config: DraftingConfig,
    tz: Tz,
    clock: Clock,
}

impl DraftGenerator {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: DraftingConfig) -> Result<Self> {
        let tz = config.tz()?;
        Ok(Self {
            provider,
            config,
            tz,
            clock: Arc::new(Utc::now),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn review_threshold(&self) -> f32 {
        self.config.review_threshold
    }

    /// Draft a reply for `message` from an already aggregated context.
    pub async fn generate(
        &self,
        message: &InboundMessage,
        context: &AggregatedContext,
    ) -> Result<DraftResult> {
        let request = CompletionRequest {
            system: prompt::system_prompt(&self.config.signature),
            prompt: prompt::build_prompt(message, context, &self.config, self.tz),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let timeout = self.config.timeout();
        let completion =
            match tokio::time::timeout(timeout, self.provider.complete(&request)).await {
                Ok(Ok(completion)) => completion,
                Ok(Err(err)) => {
                    warn!(
                        message_id = %message.id,
                        provider = self.provider.name(),
                        error = %err,
                        "completion failed"
                    );
                    return Err(InboxError::GenerationUnavailable {
                        message: format!("{}: {}", self.provider.name(), err),
                    });
                }
                Err(_) => {
                    warn!(
                        message_id = %message.id,
                        provider = self.provider.name(),
                        timeout_ms = timeout.as_millis() as u64,
                        "completion timed out"
                    );
                    return Err(InboxError::GenerationUnavailable {
                        message: format!(
                            "{} did not answer within {}ms",
                            self.provider.name(),
                            timeout.as_millis()
                        ),
                    });
                }
            };

        let body = completion.text.trim().to_string();
        if body.is_empty() {
            return Err(InboxError::GenerationUnavailable {
                message: format!("{} returned an empty completion", self.provider.name()),
            });
        }

        let confidence = confidence::score(context, completion.finish);
        let requires_human_review =
            confidence < self.config.review_threshold || context.is_overdue();
        let tone = confidence::detect_tone(&body);
        let suggested_edits = confidence::suggest_edits(&body, confidence, context);

        info!(
            message_id = %message.id,
            provider = self.provider.name(),
            confidence,
            requires_human_review,
            overdue = context.is_overdue(),
            "draft generated"
        );

        Ok(DraftResult {
            message_id: message.id.clone(),
            thread_id: message.thread_id.clone(),
            recipient: message.sender.clone(),
            subject: reply_subject(&message.subject),
            body,
            confidence,
            context_used: context.sources.clone(),
            tone,
            suggested_edits,
            requires_human_review,
            created_at: (self.clock)(),
        })
    }
}

#[async_trait]
impl GenerateDraft for DraftGenerator {
    async fn generate(
        &self,
        message: &InboundMessage,
        context: &AggregatedContext,
    ) -> Result<DraftResult> {
        DraftGenerator::generate(self, message, context).await
    }
}

fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"))
    {
        subject.to_string()
    } else if subject.is_empty() {
        "Re: your message".to_string()
    } else {
        format!("Re: {}", subject)
    }
}
