//! Error types for TaskSync
//!
//! Defines the error taxonomy shared by adapters, the ledger and the sync
//! orchestrator. Uses thiserror for ergonomic error handling.

use crate::integrations::retry::{RetryDecision, RetryableError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for TaskSync operations
pub type Result<T> = std::result::Result<T, TaskSyncError>;

/// Comprehensive error type for TaskSync operations
#[derive(Error, Debug)]
pub enum TaskSyncError {
    /// Invalid or missing credentials. Fatal for a run, never retried.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Network hiccup, timeout or backend 5xx. Retried with backoff.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Backend rejected a write because the revision moved underneath us
    #[error("Revision conflict on {native_id}: {message}")]
    Conflict { native_id: String, message: String },

    /// Malformed task data coming from a source
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another apply run currently holds the ledger
    #[error("A sync run is already applying changes")]
    RunInProgress,

    /// Run was cancelled cooperatively
    #[error("Run cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ledger/storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Task, link or change set not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rate limited (with retry-after duration in seconds)
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl TaskSyncError {
    /// Create a conflict error for a native id
    pub fn conflict(native_id: impl Into<String>, message: impl Into<String>) -> Self {
        TaskSyncError::Conflict {
            native_id: native_id.into(),
            message: message.into(),
        }
    }

    /// Errors that abort a whole run instead of a single item
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TaskSyncError::Auth(_) | TaskSyncError::Storage(_) | TaskSyncError::Database(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, TaskSyncError::Conflict { .. })
    }

    /// Short machine-readable kind, used for metrics labels and reports
    pub fn kind(&self) -> &'static str {
        match self {
            TaskSyncError::Auth(_) => "auth",
            TaskSyncError::Transient(_) | TaskSyncError::RateLimited(_) => "transient",
            TaskSyncError::Http(_) => "http",
            TaskSyncError::Conflict { .. } => "conflict",
            TaskSyncError::Validation(_) => "validation",
            TaskSyncError::RunInProgress => "run_in_progress",
            TaskSyncError::Cancelled => "cancelled",
            TaskSyncError::Config(_) => "config",
            TaskSyncError::Storage(_) | TaskSyncError::Database(_) => "storage",
            TaskSyncError::NotFound(_) => "not_found",
            TaskSyncError::Io(_) => "io",
            TaskSyncError::Json(_) | TaskSyncError::Yaml(_) => "parse",
            TaskSyncError::Other(_) | TaskSyncError::Anyhow(_) => "other",
        }
    }
}

impl RetryableError for TaskSyncError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            TaskSyncError::Transient(_) => RetryDecision::Retry,
            TaskSyncError::RateLimited(secs) => {
                RetryDecision::RetryAfter(Duration::from_secs(*secs))
            }
            TaskSyncError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else if let Some(status) = e.status() {
                    match status.as_u16() {
                        429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                        500..=599 => RetryDecision::Retry,
                        _ => RetryDecision::NoRetry,
                    }
                } else if e.is_decode() || e.is_builder() {
                    RetryDecision::NoRetry
                } else {
                    RetryDecision::Retry
                }
            }
            TaskSyncError::Auth(_)
            | TaskSyncError::Conflict { .. }
            | TaskSyncError::Validation(_)
            | TaskSyncError::RunInProgress
            | TaskSyncError::Cancelled
            | TaskSyncError::Config(_)
            | TaskSyncError::Storage(_)
            | TaskSyncError::NotFound(_)
            | TaskSyncError::Io(_)
            | TaskSyncError::Json(_)
            | TaskSyncError::Yaml(_)
            | TaskSyncError::Database(_)
            | TaskSyncError::Other(_)
            | TaskSyncError::Anyhow(_) => RetryDecision::NoRetry,
        }
    }
}
