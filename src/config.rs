use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{InboxError, Result};
use crate::models::KnowledgeCategory;
use crate::roster::AirtableConfig;

/// Main configuration structure loaded from coach_inbox.toml and environment variables
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub roster: RosterConfig,
    pub knowledge: KnowledgeConfig,
    pub aggregation: AggregationConfig,
    pub drafting: DraftingConfig,
    pub review: ReviewConfig,
    /// Runtime configuration loaded from environment variables
    #[serde(skip)]
    pub runtime: RuntimeConfig,
}

/// Roster system access and its request budget
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RosterConfig {
    pub requests_per_second: u32,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    #[serde(flatten)]
    pub airtable: AirtableConfig,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
            airtable: AirtableConfig::default(),
        }
    }
}

/// Embedding provider and similarity search defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub embedding_provider: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub requests_per_second: u32,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub search_limit: usize,
    pub min_similarity: f32,
    pub query_cache_size: usize,
    /// Restrict drafting context to these categories; empty searches all.
    pub categories: Vec<KnowledgeCategory>,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            embedding_provider: "auto".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
            // 3000 requests per minute
            requests_per_second: 50,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
            search_limit: 5,
            min_similarity: 0.7,
            query_cache_size: 256,
            categories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub deadline_ms: u64,
    pub schedule_window_days: i64,
    pub max_history_turns: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 5_000,
            schedule_window_days: 14,
            max_history_turns: 10,
        }
    }
}

impl AggregationConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Language-generation provider and the review gate
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DraftingConfig {
    pub model: String,
    pub api_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_ms: u64,
    pub review_threshold: f32,
    pub max_knowledge_items: usize,
    pub max_history_turns: usize,
    pub max_schedule_entries: usize,
    pub signature: String,
    /// IANA name used when rendering schedule times, e.g. "America/Chicago"
    pub timezone: String,
}

impl Default for DraftingConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            timeout_ms: 10_000,
            review_threshold: 0.8,
            max_knowledge_items: 3,
            max_history_turns: 5,
            max_schedule_entries: 5,
            signature: "Youth Soccer Program Director".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl DraftingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| InboxError::Config {
                message: format!("unknown timezone '{}': {}", self.timezone, e),
            })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub database_path: String,
    pub defer_minutes: i64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            database_path: "coach_inbox.db".to_string(),
            defer_minutes: 60,
        }
    }
}

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub openai_api_key: Option<String>,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            log_level: "coach_inbox=info".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn load_from_env() -> Self {
        let mut runtime = Self::default();
        runtime.openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        if let Ok(level) = std::env::var("COACH_LOG")
            && !level.trim().is_empty()
        {
            runtime.log_level = level;
        }
        runtime
    }
}

impl Config {
    /// Load configuration from TOML file and environment variables
    /// Uses COACH_INBOX_CONFIG environment variable or defaults to "coach_inbox.toml"
    pub fn load() -> Result<Self> {
        if let Ok(env_path) = std::env::var("COACH_ENV_FILE") {
            let _ = dotenvy::from_path(env_path);
        } else {
            let _ = dotenvy::from_path(".env");
        }

        let config_path = std::env::var("COACH_INBOX_CONFIG")
            .unwrap_or_else(|_| "coach_inbox.toml".to_string());

        let mut config = match std::fs::read_to_string(&config_path) {
            Ok(content) => Self::from_toml_str(&content)?,
            Err(_) => {
                tracing::warn!("Config file {} not found, using defaults", config_path);
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.runtime = RuntimeConfig::load_from_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("AIRTABLE_API_KEY") {
            self.roster.airtable.api_key = Some(key);
        }
        if let Ok(base) = std::env::var("AIRTABLE_BASE_ID") {
            self.roster.airtable.base_id = base;
        }
        if let Ok(model) = std::env::var("COACH_LLM_MODEL") {
            self.drafting.model = model;
        }
        if let Ok(path) = std::env::var("COACH_REVIEW_DB") {
            self.review.database_path = path;
        }
        if let Some(dim) = std::env::var("COACH_EMBED_DIM")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.knowledge.embedding_dimensions = dim;
        }
    }

    /// Clamp soft limits and reject values the pipeline cannot run with.
    pub fn validate(&mut self) -> Result<()> {
        for (name, attempts) in [
            ("roster", &mut self.roster.retry_attempts),
            ("knowledge", &mut self.knowledge.retry_attempts),
        ] {
            if *attempts == 0 {
                *attempts = 1;
            } else if *attempts > 10 {
                tracing::warn!("{} retry_attempts {} exceeds max 10, clamping", name, attempts);
                *attempts = 10;
            }
        }

        if self.roster.requests_per_second == 0 || self.knowledge.requests_per_second == 0 {
            return Err(config_error("requests_per_second must be at least 1"));
        }
        if self.knowledge.embedding_dimensions == 0 {
            return Err(config_error("embedding_dimensions must be non-zero"));
        }
        if !(-1.0..=1.0).contains(&self.knowledge.min_similarity) {
            return Err(config_error("min_similarity must be between -1.0 and 1.0"));
        }
        if !(0.0..=1.0).contains(&self.drafting.review_threshold) {
            return Err(config_error("review_threshold must be between 0.0 and 1.0"));
        }
        if self.aggregation.deadline_ms == 0 || self.drafting.timeout_ms == 0 {
            return Err(config_error("deadlines must be non-zero"));
        }
        if self.aggregation.schedule_window_days <= 0 {
            return Err(config_error("schedule_window_days must be positive"));
        }
        self.drafting.tz()?;
        if self.review.defer_minutes <= 0 {
            return Err(config_error("defer_minutes must be positive"));
        }
        if self.knowledge.embedding_model == "text-embedding-3-small"
            && self.knowledge.embedding_dimensions > 1536
        {
            tracing::warn!(
                "text-embedding-3-small supports at most 1536 dimensions, got {}",
                self.knowledge.embedding_dimensions
            );
        }
        Ok(())
    }
}

fn config_error(message: &str) -> InboxError {
    InboxError::Config {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_contract() {
        let config = Config::default();
        assert_eq!(config.roster.requests_per_second, 5);
        assert_eq!(config.roster.retry_attempts, 3);
        assert_eq!(config.knowledge.embedding_dimensions, 1536);
        assert_eq!(config.knowledge.search_limit, 5);
        assert!((config.knowledge.min_similarity - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.aggregation.deadline(), Duration::from_secs(5));
        assert_eq!(config.aggregation.schedule_window_days, 14);
        assert_eq!(config.drafting.timeout(), Duration::from_secs(10));
        assert!((config.drafting.review_threshold - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let mut config = Config::from_toml_str(
            r#"
            [roster]
            base_id = "appRoster"
            families_table = "Households"
            retry_attempts = 0

            [drafting]
            review_threshold = 0.9
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.roster.airtable.base_id, "appRoster");
        assert_eq!(config.roster.airtable.families_table, "Households");
        assert_eq!(config.roster.airtable.children_table, "Children");
        assert_eq!(config.roster.retry_attempts, 1);
        assert!((config.drafting.review_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.aggregation.deadline_ms, 5_000);
    }

    #[test]
    fn knowledge_categories_parse_from_snake_case() {
        let config = Config::from_toml_str(
            r#"
            [knowledge]
            categories = ["schedule_management", "faq"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.knowledge.categories,
            vec![KnowledgeCategory::ScheduleManagement, KnowledgeCategory::Faq]
        );
        assert!(Config::default().knowledge.categories.is_empty());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = Config::default();
        config.drafting.review_threshold = 1.5;
        assert!(matches!(config.validate(), Err(InboxError::Config { .. })));
    }
}
