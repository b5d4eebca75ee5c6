//! Records exchanged between the roster, knowledge base, drafting, and review stages

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// An email delivered by the mail-ingestion collaborator. Never mutated after receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Text used as the knowledge-base query.
    pub fn query_text(&self) -> String {
        format!("{} {}", self.subject.trim(), self.body.trim())
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub name: String,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub skill_level: Option<String>,
    #[serde(default)]
    pub medical_notes: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Current,
    Pending,
    Overdue,
    Cancelled,
}

impl PaymentStatus {
    /// Parse the free-form status strings found in roster spreadsheets.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "current" | "paid" | "paid in full" | "paid_ahead" | "paid ahead" => {
                Some(PaymentStatus::Current)
            }
            "pending" | "partial" | "processing" => Some(PaymentStatus::Pending),
            "overdue" | "late" | "past due" | "past_due" => Some(PaymentStatus::Overdue),
            "cancelled" | "canceled" | "refunded" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }

    /// Status implied by an outstanding balance when no explicit status is recorded.
    pub fn from_balance(balance: f64) -> Self {
        if balance > 0.0 {
            PaymentStatus::Overdue
        } else {
            PaymentStatus::Current
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Current => "current",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Overdue => "overdue",
            PaymentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One household from the roster system, borrowed for a single aggregation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyRecord {
    pub family_id: String,
    #[serde(default)]
    pub family_name: Option<String>,
    pub primary_contact: Contact,
    #[serde(default)]
    pub secondary_contact: Option<Contact>,
    #[serde(default)]
    pub children: Vec<Child>,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub balance: Option<f64>,
    #[serde(default)]
    pub notes: String,
}

impl FamilyRecord {
    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Practice,
    Game,
    Tournament,
    Meeting,
    #[default]
    Other,
}

impl EventKind {
    pub fn parse_loose(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "practice" | "training" => EventKind::Practice,
            "game" | "match" => EventKind::Game,
            "tournament" => EventKind::Tournament,
            "meeting" => EventKind::Meeting,
            _ => EventKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub family_id: String,
    #[serde(default)]
    pub child_name: Option<String>,
    pub title: String,
    #[serde(default)]
    pub kind: EventKind,
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// `[start, start + days)`
    pub fn days_from(start: DateTime<Utc>, days: i64) -> Self {
        Self {
            start,
            end: start + Duration::days(days),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCategory {
    CoachingBestPractices,
    YouthDevelopment,
    ParentCommunication,
    ScheduleManagement,
    SafetyProtocols,
    TeamBuilding,
    TechnicalSkills,
    Administrative,
    PoliciesProcedures,
    Faq,
    Troubleshooting,
    #[default]
    Other,
}

/// A curated knowledge-base passage with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: KnowledgeCategory,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub relevance_score: f32,
}

/// A knowledge passage before it has been embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: KnowledgeCategory,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub relevance_score: f32,
}

impl KnowledgeDocument {
    pub fn embedding_text(&self) -> String {
        format!("{}\n{}", self.title, self.content)
    }

    pub fn with_embedding(self, embedding: Vec<f32>) -> KnowledgeItem {
        KnowledgeItem {
            id: self.id,
            title: self.title,
            content: self.content,
            category: self.category,
            tags: self.tags,
            embedding,
            relevance_score: self.relevance_score,
        }
    }
}

/// Search result projection; vectors stay in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: KnowledgeCategory,
    pub relevance_score: f32,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub sender: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Where a piece of drafting context came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    FamilyRecord,
    Schedule,
    PaymentRecords,
    KnowledgeBase,
    ConversationHistory,
}

impl ContextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextSource::FamilyRecord => "family_record",
            ContextSource::Schedule => "schedule",
            ContextSource::PaymentRecords => "payment_records",
            ContextSource::KnowledgeBase => "knowledge_base",
            ContextSource::ConversationHistory => "conversation_history",
        }
    }
}

impl fmt::Display for ContextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-scoped bundle of everything known about an inbound message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregatedContext {
    /// `None` means the sender is not on the roster.
    pub family: Option<FamilyRecord>,
    pub knowledge: Vec<KnowledgeHit>,
    pub history: Vec<ConversationTurn>,
    pub schedule: Vec<ScheduleEntry>,
    /// Sources that contributed data, in a fixed order. Failed sources never appear.
    pub sources: Vec<ContextSource>,
}

impl AggregatedContext {
    pub fn payment_status(&self) -> Option<PaymentStatus> {
        self.family.as_ref().map(|f| f.payment_status)
    }

    pub fn is_overdue(&self) -> bool {
        self.payment_status() == Some(PaymentStatus::Overdue)
    }

    pub fn used(&self, source: ContextSource) -> bool {
        self.sources.contains(&source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Apologetic,
    Enthusiastic,
    Urgent,
    Appreciative,
    #[default]
    Professional,
}

/// A generated reply awaiting human disposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftResult {
    pub message_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub confidence: f32,
    pub context_used: Vec<ContextSource>,
    #[serde(default)]
    pub tone: Tone,
    #[serde(default)]
    pub suggested_edits: Vec<String>,
    pub requires_human_review: bool,
    pub created_at: DateTime<Utc>,
}
