//! Parallel context gathering for one inbound message
//!
//! Family lookup is the only fatal fetch. Knowledge, schedule, and history
//! degrade to empty when they fail or miss the deadline, and are then left out
//! of [`AggregatedContext::sources`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{Instant, timeout_at};
use tracing::{error, info, warn};

use crate::config::AggregationConfig;
use crate::error::{InboxError, Result};
use crate::history::ConversationHistory;
use crate::knowledge::{DEFAULT_LIMIT, DEFAULT_MIN_SIMILARITY, KnowledgeSearch};
use crate::models::{
    AggregatedContext, ContextSource, ConversationTurn, FamilyRecord, InboundMessage,
    KnowledgeCategory, KnowledgeHit, ScheduleEntry, TimeWindow,
};
use crate::pipeline::AggregateContext;
use crate::roster::FamilyContextStore;

const MAX_QUERY_CHARS: usize = 2_000;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct ContextAggregator {
    roster: Arc<FamilyContextStore>,
    knowledge: Arc<dyn KnowledgeSearch>,
    history: Option<Arc<dyn ConversationHistory>>,
    config: AggregationConfig,
    search_limit: usize,
    min_similarity: f32,
    categories: Vec<KnowledgeCategory>,
    clock: Clock,
}

impl ContextAggregator {
    pub fn new(
        roster: Arc<FamilyContextStore>,
        knowledge: Arc<dyn KnowledgeSearch>,
        config: AggregationConfig,
    ) -> Self {
        Self {
            roster,
            knowledge,
            history: None,
            config,
            search_limit: DEFAULT_LIMIT,
            min_similarity: DEFAULT_MIN_SIMILARITY,
            categories: Vec::new(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn ConversationHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_search(mut self, limit: usize, min_similarity: f32) -> Self {
        self.search_limit = limit;
        self.min_similarity = min_similarity;
        self
    }

    /// Only search these knowledge categories. Empty means all.
    pub fn with_categories(mut self, categories: Vec<KnowledgeCategory>) -> Self {
        self.categories = categories;
        self
    }

    /// Fix "now" for the schedule window.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// `[start of today, start of today + schedule_window_days)` in UTC.
    pub fn schedule_window(&self) -> TimeWindow {
        let now = (self.clock)();
        let today = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or(now);
        TimeWindow::days_from(today, self.config.schedule_window_days)
    }

    /// Aggregate with the configured deadline.
    pub async fn aggregate(&self, message: &InboundMessage) -> Result<AggregatedContext> {
        self.aggregate_with_deadline(message, self.config.deadline())
            .await
    }

    pub async fn aggregate_with_deadline(
        &self,
        message: &InboundMessage,
        deadline: Duration,
    ) -> Result<AggregatedContext> {
        let started = Instant::now();
        let deadline_at = started + deadline;

        let family_branch = self.family_and_schedule(message, deadline_at, deadline);
        let knowledge_branch = self.knowledge(message, deadline_at);
        let history_branch = self.history(message, deadline_at);

        let ((family, schedule), knowledge, history) =
            match tokio::try_join!(family_branch, knowledge_branch, history_branch) {
                Ok(joined) => joined,
                Err(err) => {
                    error!(
                        message_id = %message.id,
                        stage = "family_lookup",
                        error = %err,
                        "aggregation failed"
                    );
                    return Err(err);
                }
            };

        let mut sources = Vec::new();
        if family.is_some() {
            sources.push(ContextSource::FamilyRecord);
            if !schedule.as_deref().unwrap_or_default().is_empty() {
                sources.push(ContextSource::Schedule);
            }
            // Payment status travels on the family row
            sources.push(ContextSource::PaymentRecords);
        }
        if !knowledge.as_deref().unwrap_or_default().is_empty() {
            sources.push(ContextSource::KnowledgeBase);
        }
        if !history.as_deref().unwrap_or_default().is_empty() {
            sources.push(ContextSource::ConversationHistory);
        }

        let context = AggregatedContext {
            family,
            knowledge: knowledge.unwrap_or_default(),
            history: history.unwrap_or_default(),
            schedule: schedule.unwrap_or_default(),
            sources,
        };

        info!(
            message_id = %message.id,
            family = context.family.is_some(),
            knowledge = context.knowledge.len(),
            schedule = context.schedule.len(),
            history = context.history.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "context aggregated"
        );
        Ok(context)
    }

    /// Fatal branch. `Ok((None, None))` is an unknown sender; schedule is
    /// `None` when its fetch failed.
    async fn family_and_schedule(
        &self,
        message: &InboundMessage,
        deadline_at: Instant,
        deadline: Duration,
    ) -> Result<(Option<FamilyRecord>, Option<Vec<ScheduleEntry>>)> {
        let family = match timeout_at(deadline_at, self.roster.lookup(&message.sender)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(InboxError::Timeout {
                    operation: format!("family lookup for message {}", message.id),
                    timeout_ms: deadline.as_millis() as u64,
                });
            }
        };

        let Some(family) = family else {
            return Ok((None, None));
        };

        let window = self.schedule_window();
        let schedule = match timeout_at(
            deadline_at,
            self.roster.schedule_for(&family.family_id, window),
        )
        .await
        {
            Ok(Ok(entries)) => Some(entries),
            Ok(Err(err)) => {
                warn!(message_id = %message.id, stage = "schedule", error = %err, "continuing without schedule");
                None
            }
            Err(_) => {
                warn!(message_id = %message.id, stage = "schedule", "schedule lookup missed the deadline");
                None
            }
        };
        Ok((Some(family), schedule))
    }

    async fn knowledge(
        &self,
        message: &InboundMessage,
        deadline_at: Instant,
    ) -> Result<Option<Vec<KnowledgeHit>>> {
        let query: String = message.query_text().chars().take(MAX_QUERY_CHARS).collect();
        let search = self
            .knowledge
            .search(&query, self.search_limit, self.min_similarity, &self.categories);
        Ok(match timeout_at(deadline_at, search).await {
            Ok(Ok(hits)) => Some(hits),
            Ok(Err(err)) => {
                warn!(message_id = %message.id, stage = "knowledge", error = %err, "continuing without knowledge");
                None
            }
            Err(_) => {
                warn!(message_id = %message.id, stage = "knowledge", "knowledge search missed the deadline");
                None
            }
        })
    }

    async fn history(
        &self,
        message: &InboundMessage,
        deadline_at: Instant,
    ) -> Result<Option<Vec<ConversationTurn>>> {
        let (Some(history), Some(thread_id)) = (&self.history, &message.thread_id) else {
            return Ok(None);
        };
        // One extra turn covers the inbound message being on the thread already
        let fetch = history.recent_turns(thread_id, self.config.max_history_turns + 1);
        Ok(match timeout_at(deadline_at, fetch).await {
            Ok(Ok(mut turns)) => {
                // The inbound message itself may already be recorded on the thread
                turns.retain(|t| !(t.sent_at == message.received_at && t.body == message.body));
                let skip = turns.len().saturating_sub(self.config.max_history_turns);
                Some(turns.split_off(skip))
            }
            Ok(Err(err)) => {
                warn!(message_id = %message.id, stage = "history", error = %err, "continuing without history");
                None
            }
            Err(_) => {
                warn!(message_id = %message.id, stage = "history", "history fetch missed the deadline");
                None
            }
        })
    }
}

#[async_trait]
impl AggregateContext for ContextAggregator {
    async fn aggregate(&self, message: &InboundMessage) -> Result<AggregatedContext> {
        ContextAggregator::aggregate(self, message).await
    }
}
