//! Unified error types for the sync pipeline.
//!
//! Per-record problems (validation, referential) are recovered locally and
//! surfaced through the run summary; the variants here are the run-level
//! failures that terminate a run.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient extraction failure after retries: {0}")]
    Transient(String),

    #[error("permanent upstream rejection: {0}")]
    Fatal(String),

    #[error("run already in progress")]
    AlreadyRunning,

    #[error("watermark regression: {attempted} is older than {current}")]
    WatermarkRegression {
        current: chrono::DateTime<chrono::Utc>,
        attempted: chrono::DateTime<chrono::Utc>,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A single raw record that could not be normalized. Carries the field
/// path so malformed payloads surface here, not inside storage code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid field `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
