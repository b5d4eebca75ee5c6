//! Family, payment, and schedule context from the external roster system

pub mod airtable;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{InboxError, Result};
use crate::models::{Child, FamilyRecord, ScheduleEntry, TimeWindow};
use crate::rate_limit::{CallError, RateLimitedClient};

pub use airtable::{AirtableConfig, AirtableRoster};
pub use memory::InMemoryRoster;

/// A family row as the roster returns it. Children may still be references
/// into a separate table that needs a second request to resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyRow {
    pub record: FamilyRecord,
    pub child_refs: Vec<String>,
}

/// One page of schedule rows and the cursor for the next page, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulePage {
    pub entries: Vec<ScheduleEntry>,
    pub next: Option<String>,
}

/// One request per method. [`FamilyContextStore`] puts each call behind the
/// roster's rate limiter, so implementations must not retry on their own.
#[async_trait]
pub trait RosterBackend: Send + Sync {
    /// `email` is already trimmed and lowercased.
    async fn find_family(&self, email: &str) -> std::result::Result<Option<FamilyRow>, CallError>;

    async fn children(&self, child_refs: &[String]) -> std::result::Result<Vec<Child>, CallError>;

    /// Rows for `family_id` inside `window`, earliest first. `cursor` is the
    /// `next` value of the previous page.
    async fn schedule(
        &self,
        family_id: &str,
        window: TimeWindow,
        cursor: Option<&str>,
    ) -> std::result::Result<SchedulePage, CallError>;
}

/// Read-only accessor resolving senders to family records.
pub struct FamilyContextStore {
    backend: Arc<dyn RosterBackend>,
    client: Arc<RateLimitedClient>,
}

impl FamilyContextStore {
    pub fn new(backend: Arc<dyn RosterBackend>, client: Arc<RateLimitedClient>) -> Self {
        Self { backend, client }
    }

    /// Resolve a sender address. `Ok(None)` means no roster entry, including
    /// senders that are not addresses at all; backend outages surface as
    /// `DependencyUnavailable`.
    pub async fn lookup(&self, email: &str) -> Result<Option<FamilyRecord>> {
        let email = normalize_email(email)?;
        if !email.contains('@') {
            info!(sender = %email, "sender is not an email address, treating as unknown");
            return Ok(None);
        }

        let row = self
            .client
            .execute(|| self.backend.find_family(&email))
            .await?;

        let Some(FamilyRow {
            mut record,
            child_refs,
        }) = row
        else {
            info!(email = %email, "no family found for sender");
            return Ok(None);
        };

        if !child_refs.is_empty() {
            let children = self
                .client
                .execute(|| self.backend.children(&child_refs))
                .await?;
            record.children.extend(children);
        }

        debug!(
            family_id = %record.family_id,
            children = record.children.len(),
            payment_status = %record.payment_status,
            "family resolved"
        );
        Ok(Some(record))
    }

    /// Entries starting inside `window`, earliest first. Every page is a
    /// separate rate-limited request.
    pub async fn schedule_for(
        &self,
        family_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<ScheduleEntry>> {
        if family_id.trim().is_empty() {
            return Err(InboxError::InvalidRequest {
                dependency: self.client.name().to_string(),
                message: "family id must not be empty".to_string(),
            });
        }
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .client
                .execute(|| self.backend.schedule(family_id, window, cursor.as_deref()))
                .await?;
            entries.extend(page.entries);
            match page.next {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }
        entries.retain(|e| window.contains(e.starts_at));
        entries.sort_by(|a, b| a.starts_at.cmp(&b.starts_at));
        Ok(entries)
    }
}

/// Trim, lowercase, and unwrap display-name form. Only an empty sender is
/// rejected; anything else is left for the roster to not find.
pub fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    // Display-name form: "Jane Doe <jane@example.com>"
    let email = match (email.rfind('<'), email.rfind('>')) {
        (Some(open), Some(close)) if open < close => email[open + 1..close].trim().to_string(),
        _ => email,
    };
    if email.is_empty() {
        return Err(InboxError::InvalidRequest {
            dependency: "roster".to_string(),
            message: format!("empty sender address: {:?}", raw),
        });
    }
    Ok(email)
}
