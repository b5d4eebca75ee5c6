//! Domain-specific error types for coach-inbox

use thiserror::Error;

use crate::review::ReviewStatus;

/// Main error type for the reply-drafting pipeline
#[derive(Error, Debug)]
pub enum InboxError {
    #[error("Dependency unavailable: {dependency} failed after {attempts} attempt(s): {message}")]
    DependencyUnavailable {
        dependency: String,
        attempts: u32,
        message: String,
    },

    #[error("Invalid request to {dependency}: {message}")]
    InvalidRequest { dependency: String, message: String },

    #[error("Timeout error: {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Generation unavailable: {message}")]
    GenerationUnavailable { message: String },

    #[error("Invalid transition: cannot {action} an entry that is {from}")]
    InvalidTransition {
        action: &'static str,
        from: ReviewStatus,
    },

    #[error("Already transitioned: entry {id} is already {status}")]
    AlreadyTransitioned { id: String, status: ReviewStatus },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl From<serde_json::Error> for InboxError {
    fn from(err: serde_json::Error) -> Self {
        InboxError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for InboxError {
    fn from(err: rusqlite::Error) -> Self {
        InboxError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for InboxError {
    fn from(err: toml::de::Error) -> Self {
        InboxError::Config {
            message: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for InboxError {
    fn from(err: chrono::ParseError) -> Self {
        InboxError::Validation {
            message: format!("Date parsing error: {}", err),
        }
    }
}

/// Result type alias for coach-inbox operations
pub type Result<T> = std::result::Result<T, InboxError>;
