pub mod aggregator;
pub mod config;
pub mod drafting;
pub mod error;
pub mod fixtures;
pub mod history;
pub mod knowledge;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod review;
pub mod roster;

pub use aggregator::ContextAggregator;
pub use config::Config;
pub use drafting::{CompletionProvider, DraftGenerator};
pub use error::{InboxError, Result};
pub use pipeline::{AggregateContext, GenerateDraft, ReplyPipeline};
pub use rate_limit::RateLimitedClient;
pub use review::{ReviewQueue, ReviewQueueEntry, ReviewStatus};
pub use roster::FamilyContextStore;
