//! coach-inbox: draft replies to parent email and work the review queue.
//!
//! Usage:
//!   coach-inbox draft --message msg.json --fixtures fixtures.json
//!   coach-inbox draft --message msg.json --airtable
//!   coach-inbox queue list --status pending
//!   coach-inbox queue approve <id>

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use coach_inbox::config::Config;
use coach_inbox::drafting::{DraftGenerator, OpenAiChat};
use coach_inbox::fixtures::Fixtures;
use coach_inbox::knowledge::{EmbeddingIndex, create_embedder};
use coach_inbox::models::InboundMessage;
use coach_inbox::pipeline::ReplyPipeline;
use coach_inbox::rate_limit::client_for;
use coach_inbox::review::{ReviewQueue, ReviewQueueEntry, ReviewStatus, SqliteReviewStore};
use coach_inbox::roster::{AirtableRoster, FamilyContextStore, RosterBackend};
use coach_inbox::ContextAggregator;

#[derive(Parser)]
#[command(name = "coach-inbox")]
#[command(about = "Draft and review replies to parent email", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Draft a reply for one inbound message and queue it for review
    Draft {
        /// JSON file holding the inbound message
        #[arg(long)]
        message: PathBuf,
        /// JSON bundle of roster, knowledge documents, and thread history
        #[arg(long, required_unless_present = "airtable")]
        fixtures: Option<PathBuf>,
        /// Look families up in Airtable instead of the fixture roster
        #[arg(long)]
        airtable: bool,
    },
    /// Inspect and act on queued drafts
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List entries, oldest first
    List {
        #[arg(long)]
        status: Option<ReviewStatus>,
    },
    /// Print one entry as JSON
    Show { id: String },
    Approve { id: String },
    Defer { id: String },
    Requeue { id: String },
    Archive { id: String },
    /// Record that an approved draft was sent
    Sent { id: String },
    /// Replace the body of a pending draft
    Edit {
        id: String,
        #[arg(long)]
        body: String,
    },
    /// Return deferred entries whose defer period has passed
    RequeueDue,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.runtime.log_level))
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Draft {
            message,
            fixtures,
            airtable,
        } => draft(&config, &message, fixtures.as_deref(), airtable).await,
        Commands::Queue { action } => queue(&config, action).await,
    }
}

fn open_queue(config: &Config) -> Result<ReviewQueue> {
    let store = SqliteReviewStore::open(&config.review.database_path).with_context(|| {
        format!(
            "opening review database {}",
            config.review.database_path
        )
    })?;
    Ok(ReviewQueue::new(Arc::new(store), &config.review))
}

async fn draft(
    config: &Config,
    message_path: &Path,
    fixtures_path: Option<&Path>,
    use_airtable: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(message_path)
        .with_context(|| format!("reading message {}", message_path.display()))?;
    let message: InboundMessage = serde_json::from_str(&raw).context("parsing message JSON")?;

    let fixtures = match fixtures_path {
        Some(path) => Fixtures::load(path)?,
        None => Fixtures::default(),
    };

    let backend: Arc<dyn RosterBackend> = if use_airtable {
        Arc::new(AirtableRoster::new(config.roster.airtable.clone())?)
    } else {
        Arc::new(fixtures.roster())
    };
    let roster_client = client_for(
        "roster",
        config.roster.requests_per_second,
        config.roster.retry_attempts,
        config.roster.retry_base_delay_ms,
    )?;
    let roster = Arc::new(FamilyContextStore::new(backend, Arc::new(roster_client)));

    let knowledge = &config.knowledge;
    let embedder = create_embedder(
        &knowledge.embedding_provider,
        &knowledge.embedding_model,
        knowledge.embedding_dimensions,
        config.runtime.openai_api_key.as_deref(),
    )?;
    let embed_client = client_for(
        "embeddings",
        knowledge.requests_per_second,
        knowledge.retry_attempts,
        knowledge.retry_base_delay_ms,
    )?;
    let index = EmbeddingIndex::new(
        embedder.dimensions(),
        embedder,
        Arc::new(embed_client),
        knowledge.query_cache_size,
    )?;
    fixtures.index_knowledge(&index).await?;

    let aggregator = ContextAggregator::new(roster, Arc::new(index), config.aggregation.clone())
        .with_history(Arc::new(fixtures.history().await))
        .with_search(knowledge.search_limit, knowledge.min_similarity)
        .with_categories(knowledge.categories.clone());

    let provider = OpenAiChat::from_config(
        &config.drafting,
        config.runtime.openai_api_key.as_deref(),
    )?;
    let generator = DraftGenerator::new(Arc::new(provider), config.drafting.clone())?;

    let pipeline = ReplyPipeline::new(
        Arc::new(aggregator),
        Arc::new(generator),
        Arc::new(open_queue(config)?),
    );
    let entry = pipeline.process(&message).await?;
    info!(entry_id = %entry.id, "draft queued");
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

async fn queue(config: &Config, action: QueueAction) -> Result<()> {
    let queue = open_queue(config)?;
    match action {
        QueueAction::List { status } => {
            let entries = queue.list(status).await?;
            if entries.is_empty() {
                println!("No entries");
            }
            for entry in &entries {
                print_summary(entry);
            }
        }
        QueueAction::Show { id } => {
            println!("{}", serde_json::to_string_pretty(&queue.get(&id).await?)?);
        }
        QueueAction::Approve { id } => print_summary(&queue.approve(&id).await?),
        QueueAction::Defer { id } => print_summary(&queue.defer(&id).await?),
        QueueAction::Requeue { id } => print_summary(&queue.requeue(&id).await?),
        QueueAction::Archive { id } => print_summary(&queue.archive(&id).await?),
        QueueAction::Sent { id } => print_summary(&queue.mark_sent(&id).await?),
        QueueAction::Edit { id, body } => print_summary(&queue.edit(&id, &body).await?),
        QueueAction::RequeueDue => {
            let requeued = queue.requeue_due(Utc::now()).await?;
            println!("Requeued {} deferred entries", requeued.len());
            for entry in &requeued {
                print_summary(entry);
            }
        }
    }
    Ok(())
}

fn print_summary(entry: &ReviewQueueEntry) {
    println!(
        "{}  {:<8}  confidence={:.2}  review={}  to={}  {}",
        entry.id,
        entry.status.as_str(),
        entry.draft.confidence,
        if entry.draft.requires_human_review { "required" } else { "optional" },
        entry.draft.recipient,
        entry.draft.subject
    );
}
