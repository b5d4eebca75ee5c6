use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};

use coach_inbox::config::{AggregationConfig, DraftingConfig, ReviewConfig};
use coach_inbox::drafting::{
    Completion, CompletionProvider, CompletionRequest, FinishReason, ProviderError,
};
use coach_inbox::history::{ConversationHistory, InMemoryHistory};
use coach_inbox::knowledge::{Embedder, EmbeddingIndex, KnowledgeSearch};
use coach_inbox::models::{
    Child, Contact, ContextSource, ConversationTurn, EventKind, FamilyRecord, InboundMessage,
    KnowledgeCategory, KnowledgeHit, KnowledgeItem, PaymentStatus, ScheduleEntry,
};
use coach_inbox::rate_limit::{CallError, RateLimitedClient};
use coach_inbox::review::{InMemoryReviewStore, ReviewQueue, ReviewStatus};
use coach_inbox::roster::{FamilyContextStore, InMemoryRoster};
use coach_inbox::{ContextAggregator, DraftGenerator, InboxError, ReplyPipeline};

fn now() -> DateTime<Utc> {
    // Monday
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Every query lands on the first axis.
struct AxisEmbedder;

#[async_trait]
impl Embedder for AxisEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, CallError> {
        Ok(vec![1.0, 0.0, 0.0])
    }

    fn dimensions(&self) -> usize {
        3
    }

    fn model(&self) -> &str {
        "axis"
    }
}

struct StalledKnowledge;

#[async_trait]
impl KnowledgeSearch for StalledKnowledge {
    async fn search(
        &self,
        _q: &str,
        _l: usize,
        _m: f32,
        _c: &[KnowledgeCategory],
    ) -> coach_inbox::Result<Vec<KnowledgeHit>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
}

struct BrokenHistory;

#[async_trait]
impl ConversationHistory for BrokenHistory {
    async fn recent_turns(&self, _t: &str, _l: usize) -> coach_inbox::Result<Vec<ConversationTurn>> {
        Err(InboxError::Storage {
            message: "thread store offline".into(),
        })
    }
}

struct StalledHistory;

#[async_trait]
impl ConversationHistory for StalledHistory {
    async fn recent_turns(&self, _t: &str, _l: usize) -> coach_inbox::Result<Vec<ConversationTurn>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
}

/// Replies with the schedule lines it was given.
#[derive(Default)]
struct EchoScheduleProvider {
    requests: Mutex<Vec<CompletionRequest>>,
}

#[async_trait]
impl CompletionProvider for EchoScheduleProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let schedule: Vec<&str> = request
            .prompt
            .lines()
            .skip_while(|l| !l.contains("Upcoming schedule"))
            .skip(1)
            .take_while(|l| l.starts_with("- "))
            .collect();
        let text = if schedule.is_empty() {
            "Hello,\n\nI will look into this and follow up shortly.\n\nYouth Soccer Program Director"
                .to_string()
        } else {
            format!(
                "Hi Pat,\n\nThanks for checking in. Here is what is coming up:\n{}\n\nYouth Soccer Program Director",
                schedule.join("\n")
            )
        };
        Ok(Completion {
            text,
            finish: FinishReason::Complete,
        })
    }

    fn name(&self) -> &str {
        "echo"
    }
}

fn family(id: &str, email: &str, status: PaymentStatus) -> FamilyRecord {
    FamilyRecord {
        family_id: id.to_string(),
        family_name: Some("Parent".into()),
        primary_contact: Contact {
            name: "Pat Parent".into(),
            email: email.to_string(),
            phone: None,
        },
        secondary_contact: None,
        children: vec![Child {
            name: "Johnny".into(),
            birth_date: None,
            skill_level: Some("intermediate".into()),
            medical_notes: None,
            team: Some("U10 Blue".into()),
        }],
        payment_status: status,
        balance: None,
        notes: String::new(),
    }
}

fn tuesday_practice(family_id: &str) -> ScheduleEntry {
    ScheduleEntry {
        id: format!("practice-{family_id}"),
        family_id: family_id.to_string(),
        child_name: Some("Johnny".into()),
        title: "Practice".into(),
        kind: EventKind::Practice,
        starts_at: Utc.with_ymd_and_hms(2026, 3, 3, 18, 0, 0).unwrap(),
        ends_at: Some(Utc.with_ymd_and_hms(2026, 3, 3, 19, 30, 0).unwrap()),
        venue: Some("North Field".into()),
        notes: None,
    }
}

fn threaded(sender: &str, body: &str) -> InboundMessage {
    InboundMessage {
        thread_id: Some("thread-1".into()),
        ..message(sender, body)
    }
}

/// `earlier` prior turns on "thread-1", then the inbound message itself.
async fn thread_with_inbound(earlier: i64, inbound: &InboundMessage) -> Arc<InMemoryHistory> {
    let history = InMemoryHistory::new();
    for i in 1..=earlier {
        history
            .record(
                "thread-1",
                ConversationTurn {
                    sender: (if i % 2 == 0 { "coach@example.org" } else { "parent@example.com" })
                        .to_string(),
                    body: format!("turn {i}"),
                    sent_at: now() - TimeDelta::hours(earlier + 1 - i),
                },
            )
            .await;
    }
    history
        .record(
            "thread-1",
            ConversationTurn {
                sender: inbound.sender.clone(),
                body: inbound.body.clone(),
                sent_at: inbound.received_at,
            },
        )
        .await;
    Arc::new(history)
}

fn message(sender: &str, body: &str) -> InboundMessage {
    InboundMessage {
        id: format!("msg-{sender}"),
        thread_id: None,
        sender: sender.to_string(),
        sender_name: None,
        subject: "Question".into(),
        body: body.to_string(),
        received_at: now(),
    }
}

async fn practice_index() -> Arc<EmbeddingIndex> {
    let index = EmbeddingIndex::new(
        3,
        Arc::new(AxisEmbedder),
        Arc::new(RateLimitedClient::unlimited("embeddings")),
        16,
    )
    .unwrap();
    let off_axis = (1.0f32 - 0.82 * 0.82).sqrt();
    index
        .insert(KnowledgeItem {
            id: "kb-practice".into(),
            title: "Practice policy".into(),
            content: "Practices run rain or shine unless lightning is reported.".into(),
            category: KnowledgeCategory::PoliciesProcedures,
            tags: BTreeSet::from(["practice".to_string()]),
            embedding: vec![0.82, off_axis, 0.0],
            relevance_score: 0.9,
        })
        .await
        .unwrap();
    index
        .insert(KnowledgeItem {
            id: "kb-uniforms".into(),
            title: "Uniform sizing".into(),
            content: "Uniforms run large.".into(),
            category: KnowledgeCategory::Faq,
            tags: BTreeSet::new(),
            embedding: vec![0.0, 0.0, 1.0],
            relevance_score: 0.5,
        })
        .await
        .unwrap();
    Arc::new(index)
}

struct Harness {
    roster: Arc<InMemoryRoster>,
    store: Arc<InMemoryReviewStore>,
    aggregator: Arc<ContextAggregator>,
    generator: Arc<DraftGenerator>,
    pipeline: ReplyPipeline,
}

async fn harness_with(knowledge: Arc<dyn KnowledgeSearch>) -> Harness {
    build(knowledge, None).await
}

async fn harness_with_history(history: Arc<dyn ConversationHistory>) -> Harness {
    build(practice_index().await, Some(history)).await
}

async fn build(
    knowledge: Arc<dyn KnowledgeSearch>,
    history: Option<Arc<dyn ConversationHistory>>,
) -> Harness {
    let mut roster = InMemoryRoster::new();
    roster.add_family(family("fam-1", "parent@example.com", PaymentStatus::Current));
    roster.add_family(family("fam-2", "late@example.com", PaymentStatus::Overdue));
    roster.add_schedule(tuesday_practice("fam-1"));
    roster.add_schedule(tuesday_practice("fam-2"));
    let roster = Arc::new(roster);

    let store = FamilyContextStore::new(
        roster.clone(),
        Arc::new(RateLimitedClient::unlimited("roster")),
    );
    let mut aggregator =
        ContextAggregator::new(Arc::new(store), knowledge, AggregationConfig::default())
            .with_clock(Arc::new(now));
    if let Some(history) = history {
        aggregator = aggregator.with_history(history);
    }
    let aggregator = Arc::new(aggregator);
    let generator = Arc::new(
        DraftGenerator::new(
            Arc::new(EchoScheduleProvider::default()),
            DraftingConfig::default(),
        )
        .unwrap()
        .with_clock(Arc::new(now)),
    );
    let review_store = Arc::new(InMemoryReviewStore::new());
    let queue = Arc::new(ReviewQueue::new(review_store.clone(), &ReviewConfig::default()));
    let pipeline = ReplyPipeline::new(aggregator.clone(), generator.clone(), queue);

    Harness {
        roster,
        store: review_store,
        aggregator,
        generator,
        pipeline,
    }
}

async fn harness() -> Harness {
    harness_with(practice_index().await).await
}

#[tokio::test]
async fn known_parent_asking_about_practice_skips_review() {
    let h = harness().await;
    let msg = message("Parent@Example.com", "when is practice");

    let context = h.aggregator.aggregate(&msg).await.unwrap();
    let family = context.family.as_ref().expect("family found");
    assert_eq!(family.child_names(), vec!["Johnny"]);
    assert_eq!(context.schedule.len(), 1);
    assert_eq!(context.knowledge.len(), 1);
    assert_eq!(context.knowledge[0].id, "kb-practice");
    assert!((context.knowledge[0].similarity - 0.82).abs() < 1e-3);

    let entry = h.pipeline.process(&msg).await.unwrap();
    let draft = &entry.draft;
    assert!(draft.body.contains("Johnny"), "body: {}", draft.body);
    assert!(draft.body.contains("Tuesday"), "body: {}", draft.body);
    assert!(draft.confidence >= 0.8, "confidence {}", draft.confidence);
    assert!(!draft.requires_human_review);
    assert_eq!(
        draft.context_used,
        vec![
            ContextSource::FamilyRecord,
            ContextSource::Schedule,
            ContextSource::PaymentRecords,
            ContextSource::KnowledgeBase,
        ]
    );
    assert_eq!(entry.status, ReviewStatus::Pending);
}

#[tokio::test]
async fn unknown_sender_asking_about_fees_needs_review() {
    let h = harness().await;
    let msg = message("stranger@example.com", "how much do I owe");

    let context = h.aggregator.aggregate(&msg).await.unwrap();
    assert!(context.family.is_none());
    assert!(!context.used(ContextSource::FamilyRecord));

    let entry = h.pipeline.process(&msg).await.unwrap();
    assert!(entry.draft.confidence < 0.8);
    assert!(entry.draft.requires_human_review);
}

#[tokio::test]
async fn missing_family_lowers_confidence_with_same_knowledge() {
    let h = harness().await;
    let known = message("parent@example.com", "when is practice");
    let unknown = message("stranger@example.com", "when is practice");

    let known_ctx = h.aggregator.aggregate(&known).await.unwrap();
    let unknown_ctx = h.aggregator.aggregate(&unknown).await.unwrap();
    assert_eq!(known_ctx.knowledge, unknown_ctx.knowledge);

    let known_draft = h.generator.generate(&known, &known_ctx).await.unwrap();
    let unknown_draft = h.generator.generate(&unknown, &unknown_ctx).await.unwrap();
    assert!(unknown_draft.confidence < known_draft.confidence);
}

#[tokio::test]
async fn overdue_family_is_always_reviewed() {
    let h = harness().await;
    let entry = h
        .pipeline
        .process(&message("late@example.com", "when is practice"))
        .await
        .unwrap();
    assert!(entry.draft.confidence >= 0.8);
    assert!(entry.draft.requires_human_review);
    assert!(
        entry
            .draft
            .suggested_edits
            .iter()
            .any(|e| e.contains("balance"))
    );
}

#[tokio::test(start_paused = true)]
async fn roster_outage_produces_no_draft_and_no_entry() {
    let h = harness().await;
    h.roster.set_outage(true);

    let err = h
        .pipeline
        .process(&message("parent@example.com", "when is practice"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, InboxError::DependencyUnavailable { attempts: 3, .. }),
        "got {err:?}"
    );
    assert_eq!(h.roster.calls(), 3);
    assert!(h.store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn stalled_knowledge_search_degrades_to_empty() {
    let h = harness_with(Arc::new(StalledKnowledge)).await;
    let msg = message("parent@example.com", "when is practice");

    let context = h.aggregator.aggregate(&msg).await.unwrap();
    assert!(context.family.is_some());
    assert!(context.knowledge.is_empty());
    assert!(!context.used(ContextSource::KnowledgeBase));

    let entry = h.pipeline.process(&msg).await.unwrap();
    assert!(
        !entry
            .draft
            .context_used
            .contains(&ContextSource::KnowledgeBase)
    );
    assert!(entry.draft.context_used.contains(&ContextSource::FamilyRecord));
}

#[tokio::test(start_paused = true)]
async fn slow_roster_misses_the_deadline() {
    let h = harness().await;
    h.roster.set_latency(Duration::from_secs(30));

    let err = h
        .aggregator
        .aggregate_with_deadline(
            &message("parent@example.com", "when is practice"),
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, InboxError::Timeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn aggregation_is_idempotent() {
    let h = harness().await;
    let msg = message("parent@example.com", "when is practice");
    let first = h.aggregator.aggregate(&msg).await.unwrap();
    let second = h.aggregator.aggregate(&msg).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn thread_history_is_used_without_the_inbound_message() {
    let msg = threaded("parent@example.com", "when is practice");
    let h = harness_with_history(thread_with_inbound(11, &msg).await).await;
    let max_turns = AggregationConfig::default().max_history_turns;

    let context = h.aggregator.aggregate(&msg).await.unwrap();
    assert_eq!(context.history.len(), max_turns);
    assert!(context.history.iter().all(|t| t.body != msg.body));
    assert_eq!(context.history[0].body, "turn 2");
    assert_eq!(context.history[max_turns - 1].body, "turn 11");

    let entry = h.pipeline.process(&msg).await.unwrap();
    assert_eq!(
        entry.draft.context_used,
        vec![
            ContextSource::FamilyRecord,
            ContextSource::Schedule,
            ContextSource::PaymentRecords,
            ContextSource::KnowledgeBase,
            ContextSource::ConversationHistory,
        ]
    );

    let unthreaded = message("parent@example.com", "when is practice");
    let plain_ctx = h.aggregator.aggregate(&unthreaded).await.unwrap();
    assert!(plain_ctx.history.is_empty());
    let plain = h.generator.generate(&unthreaded, &plain_ctx).await.unwrap();
    assert!(
        entry.draft.confidence > plain.confidence,
        "{} vs {}",
        entry.draft.confidence,
        plain.confidence
    );
}

#[tokio::test]
async fn failing_history_store_is_not_fatal() {
    let h = harness_with_history(Arc::new(BrokenHistory)).await;
    let msg = threaded("parent@example.com", "when is practice");

    let context = h.aggregator.aggregate(&msg).await.unwrap();
    assert!(context.family.is_some());
    assert!(context.history.is_empty());
    assert!(!context.used(ContextSource::ConversationHistory));

    let entry = h.pipeline.process(&msg).await.unwrap();
    assert!(!entry.draft.context_used.contains(&ContextSource::ConversationHistory));
}

#[tokio::test(start_paused = true)]
async fn stalled_history_store_misses_deadline_quietly() {
    let h = harness_with_history(Arc::new(StalledHistory)).await;
    let context = h
        .aggregator
        .aggregate(&threaded("parent@example.com", "when is practice"))
        .await
        .unwrap();
    assert!(context.family.is_some());
    assert!(context.history.is_empty());
    assert!(context.used(ContextSource::Schedule));
}

#[tokio::test(start_paused = true)]
async fn schedule_outage_drops_only_the_schedule() {
    let h = harness().await;
    h.roster.set_schedule_outage(true);
    let msg = message("parent@example.com", "when is practice");

    let context = h.aggregator.aggregate(&msg).await.unwrap();
    assert!(context.family.is_some());
    assert!(context.schedule.is_empty());
    assert_eq!(
        context.sources,
        vec![
            ContextSource::FamilyRecord,
            ContextSource::PaymentRecords,
            ContextSource::KnowledgeBase,
        ]
    );
    // one family lookup, then three schedule attempts
    assert_eq!(h.roster.calls(), 4);

    let entry = h.pipeline.process(&msg).await.unwrap();
    assert!(!entry.draft.context_used.contains(&ContextSource::Schedule));
}
