//! In-process roster used by tests and fixture-driven runs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{FamilyRow, RosterBackend, SchedulePage};
use crate::models::{Child, FamilyRecord, ScheduleEntry, TimeWindow};
use crate::rate_limit::CallError;

/// Serialized shape of a roster snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterFixture {
    #[serde(default)]
    pub families: Vec<FamilyRecord>,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

#[derive(Default)]
pub struct InMemoryRoster {
    by_email: HashMap<String, FamilyRow>,
    children: HashMap<String, Child>,
    schedule: Vec<ScheduleEntry>,
    page_size: Option<usize>,
    outage: AtomicBool,
    schedule_outage: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU32,
}

impl InMemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: RosterFixture) -> Self {
        let mut roster = Self::new();
        for family in fixture.families {
            roster.add_family(family);
        }
        for entry in fixture.schedule {
            roster.add_schedule(entry);
        }
        roster
    }

    /// Index the family under both contact addresses.
    pub fn add_family(&mut self, record: FamilyRecord) {
        self.insert_row(FamilyRow {
            record,
            child_refs: Vec::new(),
        });
    }

    /// Store children in a separate table, the way the hosted roster links them.
    pub fn add_family_with_linked_children(&mut self, record: FamilyRecord, children: Vec<Child>) {
        let mut child_refs = Vec::with_capacity(children.len());
        for (i, child) in children.into_iter().enumerate() {
            let child_ref = format!("{}-child-{}", record.family_id, i);
            self.children.insert(child_ref.clone(), child);
            child_refs.push(child_ref);
        }
        self.insert_row(FamilyRow { record, child_refs });
    }

    fn insert_row(&mut self, row: FamilyRow) {
        let mut emails = vec![row.record.primary_contact.email.clone()];
        if let Some(secondary) = &row.record.secondary_contact {
            emails.push(secondary.email.clone());
        }
        for email in emails {
            self.by_email
                .insert(email.trim().to_lowercase(), row.clone());
        }
    }

    pub fn add_schedule(&mut self, entry: ScheduleEntry) {
        self.schedule.push(entry);
    }

    /// Split schedule listings into pages of `size` rows.
    pub fn set_page_size(&mut self, size: usize) {
        self.page_size = Some(size.max(1));
    }

    /// While set, schedule requests fail transiently; family lookups still answer.
    pub fn set_schedule_outage(&self, down: bool) {
        self.schedule_outage.store(down, Ordering::SeqCst);
    }

    /// While set, every request fails transiently.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Delay applied to every request before it answers.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Requests received so far, including failed ones.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn begin_request(&self) -> Result<(), CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.outage.load(Ordering::SeqCst) {
            return Err(CallError::Transient("roster unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RosterBackend for InMemoryRoster {
    async fn find_family(&self, email: &str) -> Result<Option<FamilyRow>, CallError> {
        self.begin_request().await?;
        Ok(self.by_email.get(email).cloned())
    }

    async fn children(&self, child_refs: &[String]) -> Result<Vec<Child>, CallError> {
        self.begin_request().await?;
        Ok(child_refs
            .iter()
            .filter_map(|r| self.children.get(r).cloned())
            .collect())
    }

    async fn schedule(
        &self,
        family_id: &str,
        window: TimeWindow,
        cursor: Option<&str>,
    ) -> Result<SchedulePage, CallError> {
        self.begin_request().await?;
        if self.schedule_outage.load(Ordering::SeqCst) {
            return Err(CallError::Transient("schedule unavailable".to_string()));
        }

        let mut matching: Vec<&ScheduleEntry> = self
            .schedule
            .iter()
            .filter(|e| e.family_id == family_id && window.contains(e.starts_at))
            .collect();
        matching.sort_by_key(|e| e.starts_at);

        let skip = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let take = self.page_size.unwrap_or(matching.len());
        let entries: Vec<ScheduleEntry> =
            matching.iter().skip(skip).take(take).map(|e| (*e).clone()).collect();
        let consumed = skip + entries.len();
        Ok(SchedulePage {
            next: (consumed < matching.len()).then(|| consumed.to_string()),
            entries,
        })
    }
}
