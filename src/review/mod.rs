//! Human review queue for generated drafts
//!
//! ```text
//! pending -> approved -> sent
//! pending -> deferred -> pending
//! pending -> archived
//! ```
//!
//! Every transition runs under a per-entry async lock, so of two racing
//! callers exactly one wins and the other sees `AlreadyTransitioned`. A lock
//! lives in the map only while some caller holds or waits on it.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::Clock;
use crate::config::ReviewConfig;
use crate::error::{InboxError, Result};
use crate::models::DraftResult;

pub use memory::InMemoryReviewStore;
pub use sqlite::SqliteReviewStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Sent,
    Deferred,
    Archived,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Sent => "sent",
            ReviewStatus::Deferred => "deferred",
            ReviewStatus::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(ReviewStatus::Pending),
            "approved" => Some(ReviewStatus::Approved),
            "sent" => Some(ReviewStatus::Sent),
            "deferred" => Some(ReviewStatus::Deferred),
            "archived" => Some(ReviewStatus::Archived),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReviewStatus::Sent | ReviewStatus::Archived)
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = InboxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| InboxError::Validation {
            message: format!("unknown review status '{}'", s),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewQueueEntry {
    pub id: String,
    pub draft: DraftResult,
    pub status: ReviewStatus,
    /// Bumped on every stored change.
    pub revision: u32,
    /// Generated body, kept once a reviewer has edited the draft.
    #[serde(default)]
    pub original_body: Option<String>,
    #[serde(default)]
    pub deferred_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence seam behind the queue.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn save(&self, entry: &ReviewQueueEntry) -> Result<()>;

    async fn load(&self, id: &str) -> Result<Option<ReviewQueueEntry>>;

    /// Entries oldest first, optionally filtered by status.
    async fn list(&self, status: Option<ReviewStatus>) -> Result<Vec<ReviewQueueEntry>>;
}

struct Transition {
    action: &'static str,
    from: &'static [ReviewStatus],
    to: ReviewStatus,
    /// States that mean another caller already did this.
    reached: &'static [ReviewStatus],
}

const APPROVE: Transition = Transition {
    action: "approve",
    from: &[ReviewStatus::Pending],
    to: ReviewStatus::Approved,
    reached: &[ReviewStatus::Approved, ReviewStatus::Sent],
};

const DEFER: Transition = Transition {
    action: "defer",
    from: &[ReviewStatus::Pending],
    to: ReviewStatus::Deferred,
    reached: &[ReviewStatus::Deferred],
};

const REQUEUE: Transition = Transition {
    action: "requeue",
    from: &[ReviewStatus::Deferred],
    to: ReviewStatus::Pending,
    reached: &[ReviewStatus::Pending],
};

const ARCHIVE: Transition = Transition {
    action: "archive",
    from: &[ReviewStatus::Pending],
    to: ReviewStatus::Archived,
    reached: &[ReviewStatus::Archived],
};

const MARK_SENT: Transition = Transition {
    action: "mark sent",
    from: &[ReviewStatus::Approved],
    to: ReviewStatus::Sent,
    reached: &[ReviewStatus::Sent],
};

type EntryLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Held for the duration of one operation on an entry.
struct EntryGuard<'a> {
    id: String,
    locks: &'a EntryLocks,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Map and `self.lock` are the only references: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.id)
                .is_some_and(|held| Arc::ptr_eq(held, &self.lock))
        {
            locks.remove(&self.id);
        }
    }
}

pub struct ReviewQueue {
    store: Arc<dyn ReviewStore>,
    locks: EntryLocks,
    defer_for: Duration,
    clock: Clock,
}

impl ReviewQueue {
    pub fn new(store: Arc<dyn ReviewStore>, config: &ReviewConfig) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            defer_for: Duration::minutes(config.defer_minutes),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Store a finished draft as a new pending entry.
    pub async fn enqueue(&self, draft: DraftResult) -> Result<ReviewQueueEntry> {
        let now = (self.clock)();
        let entry = ReviewQueueEntry {
            id: Uuid::new_v4().to_string(),
            draft,
            status: ReviewStatus::Pending,
            revision: 1,
            original_body: None,
            deferred_until: None,
            created_at: now,
            updated_at: now,
        };
        self.store.save(&entry).await?;
        info!(
            entry_id = %entry.id,
            message_id = %entry.draft.message_id,
            requires_human_review = entry.draft.requires_human_review,
            "draft enqueued"
        );
        Ok(entry)
    }

    pub async fn get(&self, id: &str) -> Result<ReviewQueueEntry> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| InboxError::NotFound {
                what: format!("review entry {}", id),
            })
    }

    pub async fn list(&self, status: Option<ReviewStatus>) -> Result<Vec<ReviewQueueEntry>> {
        self.store.list(status).await
    }

    pub async fn approve(&self, id: &str) -> Result<ReviewQueueEntry> {
        self.transition(id, &APPROVE, |_, _| {}).await
    }

    /// Park the entry for the configured defer period.
    pub async fn defer(&self, id: &str) -> Result<ReviewQueueEntry> {
        let defer_for = self.defer_for;
        self.transition(id, &DEFER, move |entry, now| {
            entry.deferred_until = Some(now + defer_for);
        })
        .await
    }

    pub async fn requeue(&self, id: &str) -> Result<ReviewQueueEntry> {
        self.transition(id, &REQUEUE, |entry, _| entry.deferred_until = None)
            .await
    }

    pub async fn archive(&self, id: &str) -> Result<ReviewQueueEntry> {
        self.transition(id, &ARCHIVE, |_, _| {}).await
    }

    pub async fn mark_sent(&self, id: &str) -> Result<ReviewQueueEntry> {
        self.transition(id, &MARK_SENT, |_, _| {}).await
    }

    /// Replace the draft body. Only pending entries can be edited.
    pub async fn edit(&self, id: &str, new_body: &str) -> Result<ReviewQueueEntry> {
        let new_body = new_body.trim();
        if new_body.is_empty() {
            return Err(InboxError::Validation {
                message: "edited body must not be empty".to_string(),
            });
        }

        let _guard = self.lock_entry(id).await;

        let mut entry = self.get(id).await?;
        if entry.status != ReviewStatus::Pending {
            return Err(InboxError::InvalidTransition {
                action: "edit",
                from: entry.status,
            });
        }
        if entry.original_body.is_none() {
            entry.original_body = Some(entry.draft.body.clone());
        }
        entry.draft.body = new_body.to_string();
        entry.revision += 1;
        entry.updated_at = (self.clock)();
        self.store.save(&entry).await?;
        info!(entry_id = %id, revision = entry.revision, "draft edited");
        Ok(entry)
    }

    /// Return deferred entries whose defer period has passed to pending.
    pub async fn requeue_due(&self, now: DateTime<Utc>) -> Result<Vec<ReviewQueueEntry>> {
        let deferred = self.store.list(Some(ReviewStatus::Deferred)).await?;
        let mut requeued = Vec::new();
        for entry in deferred {
            if entry.deferred_until.is_some_and(|until| until > now) {
                continue;
            }
            match self.requeue(&entry.id).await {
                Ok(entry) => requeued.push(entry),
                Err(InboxError::AlreadyTransitioned { .. }) => {
                    debug!(entry_id = %entry.id, "requeued concurrently");
                }
                Err(InboxError::InvalidTransition { from, .. }) => {
                    debug!(entry_id = %entry.id, status = %from, "no longer deferred");
                }
                Err(err) => return Err(err),
            }
        }
        if !requeued.is_empty() {
            info!(count = requeued.len(), "deferred drafts requeued");
        }
        Ok(requeued)
    }

    async fn transition<F>(&self, id: &str, rule: &Transition, apply: F) -> Result<ReviewQueueEntry>
    where
        F: FnOnce(&mut ReviewQueueEntry, DateTime<Utc>),
    {
        let _guard = self.lock_entry(id).await;

        let mut entry = self.get(id).await?;
        if rule.reached.contains(&entry.status) {
            warn!(entry_id = %id, action = rule.action, status = %entry.status, "lost transition race");
            return Err(InboxError::AlreadyTransitioned {
                id: id.to_string(),
                status: entry.status,
            });
        }
        if !rule.from.contains(&entry.status) {
            return Err(InboxError::InvalidTransition {
                action: rule.action,
                from: entry.status,
            });
        }

        let from = entry.status;
        let now = (self.clock)();
        entry.status = rule.to;
        entry.revision += 1;
        entry.updated_at = now;
        apply(&mut entry, now);
        self.store.save(&entry).await?;

        info!(entry_id = %id, from = %from, to = %entry.status, "review transition");
        Ok(entry)
    }

    async fn lock_entry(&self, id: &str) -> EntryGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(id.to_string()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        EntryGuard {
            id: id.to_string(),
            locks: &self.locks,
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
