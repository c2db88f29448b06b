//! Error handling for the warning-workflow engine
//!
//! Only run-terminal failures surface here. Per-source failures travel as
//! data (`models::SourceError`) through the collection results and never
//! abort a run.

use thiserror::Error;

/// Engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A run already holds the single-flight lock.
    #[error("a warning workflow run is already in progress")]
    AlreadyRunning,

    #[error("resource not found: {0}")]
    NotFound(String),

    // Database errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("internal error")]
    InternalError(#[from] anyhow::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
