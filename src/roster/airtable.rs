//! Airtable REST backend for the roster
//!
//! Tables and field names follow the program's roster base: `Families`
//! (linked to `Children`), and `Schedule`. Every method issues exactly one
//! HTTP request; schedule listings are paged with Airtable's `offset` cursor.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{FamilyRow, RosterBackend, SchedulePage};
use crate::error::{InboxError, Result};
use crate::models::{
    Child, Contact, EventKind, FamilyRecord, PaymentStatus, ScheduleEntry, TimeWindow,
};
use crate::rate_limit::CallError;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AirtableConfig {
    pub api_url: String,
    pub base_id: String,
    /// Loaded from `AIRTABLE_API_KEY`; never written back to disk.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub families_table: String,
    pub children_table: String,
    pub schedule_table: String,
    pub request_timeout_ms: u64,
    /// Rows per schedule page; Airtable caps this at 100.
    pub schedule_page_size: u32,
}

impl Default for AirtableConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.airtable.com/v0".to_string(),
            base_id: String::new(),
            api_key: None,
            families_table: "Families".to_string(),
            children_table: "Children".to_string(),
            schedule_table: "Schedule".to_string(),
            request_timeout_ms: 30_000,
            schedule_page_size: 100,
        }
    }
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    records: Vec<AirtableRecord>,
    /// Present while more pages remain.
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Deserialize)]
struct AirtableRecord {
    id: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

pub struct AirtableRoster {
    client: reqwest::Client,
    config: AirtableConfig,
    api_key: String,
}

impl AirtableRoster {
    pub fn new(config: AirtableConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| InboxError::Config {
                message: "AIRTABLE_API_KEY is not set".to_string(),
            })?;
        if config.base_id.trim().is_empty() {
            return Err(InboxError::Config {
                message: "roster base_id is not set (AIRTABLE_BASE_ID)".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| InboxError::Config {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.base_id,
            table
        )
    }

    async fn list(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<ListResponse, CallError> {
        debug!(table, ?query, "airtable query");
        let response = self
            .client
            .get(self.table_url(table))
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            return Err(CallError::from_status(status.as_u16(), &body));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl RosterBackend for AirtableRoster {
    async fn find_family(
        &self,
        email: &str,
    ) -> std::result::Result<Option<FamilyRow>, CallError> {
        let formula = format!(
            "OR(LOWER({{Email}}) = '{0}', LOWER({{Secondary Email}}) = '{0}')",
            escape_formula(email)
        );
        let query = [
            ("filterByFormula", formula),
            ("maxRecords", "1".to_string()),
        ];
        let listed = self.list(&self.config.families_table, &query).await?;
        Ok(listed.records.into_iter().next().map(family_from_record))
    }

    async fn children(&self, child_refs: &[String]) -> std::result::Result<Vec<Child>, CallError> {
        if child_refs.is_empty() {
            return Ok(Vec::new());
        }
        let clauses: Vec<String> = child_refs
            .iter()
            .map(|id| format!("RECORD_ID() = '{}'", escape_formula(id)))
            .collect();
        let formula = format!("OR({})", clauses.join(", "));
        let query = [
            ("filterByFormula", formula),
            ("maxRecords", child_refs.len().to_string()),
        ];
        let listed = self.list(&self.config.children_table, &query).await?;
        Ok(listed.records.into_iter().map(child_from_record).collect())
    }

    async fn schedule(
        &self,
        family_id: &str,
        window: TimeWindow,
        cursor: Option<&str>,
    ) -> std::result::Result<SchedulePage, CallError> {
        let query = schedule_query(family_id, &window, self.config.schedule_page_size, cursor);
        let listed = self.list(&self.config.schedule_table, &query).await?;
        Ok(schedule_page(family_id, listed))
    }
}

fn formula_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Rows for one family whose `Start` falls in `[window.start, window.end)`.
pub fn schedule_formula(family_id: &str, window: &TimeWindow) -> String {
    format!(
        "AND({{Family}} = '{}', NOT(IS_BEFORE({{Start}}, DATETIME_PARSE('{}'))), IS_BEFORE({{Start}}, DATETIME_PARSE('{}')))",
        escape_formula(family_id),
        formula_time(&window.start),
        formula_time(&window.end)
    )
}

fn schedule_query(
    family_id: &str,
    window: &TimeWindow,
    page_size: u32,
    cursor: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("filterByFormula", schedule_formula(family_id, window)),
        ("pageSize", page_size.clamp(1, 100).to_string()),
        ("sort[0][field]", "Start".to_string()),
        ("sort[0][direction]", "asc".to_string()),
    ];
    if let Some(cursor) = cursor {
        query.push(("offset", cursor.to_string()));
    }
    query
}

fn schedule_page(family_id: &str, listed: ListResponse) -> SchedulePage {
    SchedulePage {
        entries: listed
            .records
            .into_iter()
            .filter_map(|r| schedule_from_record(family_id, r))
            .collect(),
        next: listed.offset,
    }
}

/// Escape a value for use inside a single-quoted Airtable formula string.
pub fn escape_formula(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        // Lookup fields come back as single-element arrays
        Value::Array(items) => items
            .iter()
            .find_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    match fields.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('$').parse().ok(),
        _ => None,
    }
}

fn links(fields: &Map<String, Value>, key: &str) -> Vec<String> {
    fields
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn family_from_record(record: AirtableRecord) -> FamilyRow {
    let f = &record.fields;
    let balance = number(f, "Balance");
    let payment_status = text(f, "Payment Status")
        .and_then(|s| PaymentStatus::parse_loose(&s))
        .or_else(|| balance.map(PaymentStatus::from_balance))
        .unwrap_or(PaymentStatus::Pending);

    let secondary_contact = text(f, "Secondary Email").map(|email| Contact {
        name: text(f, "Secondary Contact").unwrap_or_default(),
        email,
        phone: text(f, "Secondary Phone"),
    });

    FamilyRow {
        record: FamilyRecord {
            family_id: record.id,
            family_name: text(f, "Family Name"),
            primary_contact: Contact {
                name: text(f, "Primary Contact").unwrap_or_default(),
                email: text(f, "Email").unwrap_or_default(),
                phone: text(f, "Phone"),
            },
            secondary_contact,
            children: Vec::new(),
            payment_status,
            balance,
            notes: text(f, "Notes").unwrap_or_default(),
        },
        child_refs: links(f, "Children"),
    }
}

fn child_from_record(record: AirtableRecord) -> Child {
    let f = &record.fields;
    Child {
        name: text(f, "Name").unwrap_or_default(),
        birth_date: text(f, "Birth Date")
            .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        skill_level: text(f, "Skill Level"),
        medical_notes: text(f, "Medical Notes"),
        team: text(f, "Team"),
    }
}

fn timestamp(fields: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    let raw = text(fields, key)?;
    DateTime::parse_from_rfc3339(&raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn schedule_from_record(family_id: &str, record: AirtableRecord) -> Option<ScheduleEntry> {
    let f = &record.fields;
    let Some(starts_at) = timestamp(f, "Start") else {
        warn!(record = %record.id, "schedule record without a parseable Start, skipping");
        return None;
    };
    Some(ScheduleEntry {
        family_id: family_id.to_string(),
        child_name: text(f, "Child"),
        title: text(f, "Title").unwrap_or_else(|| "Scheduled event".to_string()),
        kind: text(f, "Event Type")
            .map(|s| EventKind::parse_loose(&s))
            .unwrap_or_default(),
        starts_at,
        ends_at: timestamp(f, "End"),
        venue: text(f, "Venue"),
        notes: text(f, "Notes"),
        id: record.id,
    })
}
