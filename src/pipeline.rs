//! End-to-end handling of one inbound message

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::Result;
use crate::models::{AggregatedContext, DraftResult, InboundMessage};
use crate::review::{ReviewQueue, ReviewQueueEntry};

/// Gathers everything known about a message.
#[async_trait]
pub trait AggregateContext: Send + Sync {
    async fn aggregate(&self, message: &InboundMessage) -> Result<AggregatedContext>;
}

/// Turns a message and its context into a reviewable draft.
#[async_trait]
pub trait GenerateDraft: Send + Sync {
    async fn generate(
        &self,
        message: &InboundMessage,
        context: &AggregatedContext,
    ) -> Result<DraftResult>;
}

pub struct ReplyPipeline {
    aggregator: Arc<dyn AggregateContext>,
    generator: Arc<dyn GenerateDraft>,
    queue: Arc<ReviewQueue>,
}

impl ReplyPipeline {
    pub fn new(
        aggregator: Arc<dyn AggregateContext>,
        generator: Arc<dyn GenerateDraft>,
        queue: Arc<ReviewQueue>,
    ) -> Self {
        Self {
            aggregator,
            generator,
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<ReviewQueue> {
        &self.queue
    }

    /// Aggregate, draft, then enqueue. Nothing reaches the queue unless a
    /// complete draft exists.
    pub async fn process(&self, message: &InboundMessage) -> Result<ReviewQueueEntry> {
        let context = self.aggregator.aggregate(message).await?;

        let draft = match self.generator.generate(message, &context).await {
            Ok(draft) => draft,
            Err(err) => {
                error!(message_id = %message.id, stage = "generate", error = %err, "drafting failed");
                return Err(err);
            }
        };

        let entry = self.queue.enqueue(draft).await?;
        info!(
            message_id = %message.id,
            entry_id = %entry.id,
            confidence = entry.draft.confidence,
            requires_human_review = entry.draft.requires_human_review,
            "message processed"
        );
        Ok(entry)
    }
}
