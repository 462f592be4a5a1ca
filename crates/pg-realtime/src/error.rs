//! Error types for live-query operations
//!
//! One variant per failure kind, with error classification for
//! metrics and alerting.

use std::sync::Arc;
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Database-level errors (connection, query, protocol)
    Database,
    /// Query analysis errors (invalid SQL, unknown relations)
    Analysis,
    /// Notification decoding errors (malformed envelope, unknown OID)
    Decode,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Runtime errors (trigger failures, handler failures)
    Runtime,
}

/// Live-query specific errors
#[derive(Error, Debug)]
pub enum LiveQueryError {
    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The query could not be analyzed; nothing was registered
    #[error("query analysis failed: {0}")]
    Analysis(String),

    /// Trigger DDL failed for a table
    #[error("trigger installation failed on {table}: {message}")]
    TriggerInstall {
        /// Rendered table name
        table: String,
        /// Underlying failure
        message: String,
    },

    /// The trigger body itself failed and reported an error envelope
    #[error("trigger failed on {table} during {operation}: {message}")]
    TriggerRuntime {
        /// Rendered table name from the envelope
        table: String,
        /// INSERT, UPDATE or DELETE
        operation: String,
        /// SQLERRM captured by the trigger
        message: String,
    },

    /// Malformed notification payload or undecodable cell
    #[error("notification decode failed: {0}")]
    Decode(String),

    /// A subscription's refresh run failed
    #[error("query execution failed: {0}")]
    QueryExecution(String),

    /// Listener connection or poll failure
    #[error("listener error: {0}")]
    Listener(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl LiveQueryError {
    /// Create a new analysis error
    pub fn analysis(msg: impl Into<String>) -> Self {
        Self::Analysis(msg.into())
    }

    /// Create a new trigger-install error
    pub fn trigger_install(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TriggerInstall {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a new decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new query-execution error
    pub fn query_execution(msg: impl Into<String>) -> Self {
        Self::QueryExecution(msg.into())
    }

    /// Create a new listener error
    pub fn listener(msg: impl Into<String>) -> Self {
        Self::Listener(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Postgres(_) | Self::QueryExecution(_) | Self::Listener(_) => {
                ErrorCategory::Database
            }
            Self::Analysis(_) => ErrorCategory::Analysis,
            Self::Decode(_) | Self::Json(_) => ErrorCategory::Decode,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::TriggerInstall { .. } | Self::TriggerRuntime { .. } | Self::InvalidState(_) => {
                ErrorCategory::Runtime
            }
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres_error",
            Self::Json(_) => "json_error",
            Self::Analysis(_) => "analysis_error",
            Self::TriggerInstall { .. } => "trigger_install_error",
            Self::TriggerRuntime { .. } => "trigger_runtime_error",
            Self::Decode(_) => "decode_error",
            Self::QueryExecution(_) => "query_execution_error",
            Self::Listener(_) => "listener_error",
            Self::Config(_) => "config_error",
            Self::InvalidState(_) => "invalid_state",
        }
    }
}

/// Result type for live-query operations
pub type Result<T> = std::result::Result<T, LiveQueryError>;

/// System-wide error handler invoked for failures that have no caller to
/// propagate to (decode failures, trigger-reported errors, predicate
/// failures). Handlers must not panic; errors they report are swallowed
/// after logging.
pub type ErrorHandler = Arc<dyn Fn(&LiveQueryError) + Send + Sync>;

/// Per-subscription handler for refresh-run failures, called with the
/// error and the subscription's SQL text.
pub type QueryErrorHandler = Arc<dyn Fn(&LiveQueryError, &str) + Send + Sync>;
