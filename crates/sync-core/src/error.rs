//! Error types shared by every chunk-sync component.

use thiserror::Error;

/// Errors raised while splitting, assigning, reading or reconciling splits.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid setup: unreadable table, unsupported offset construction,
    /// bad options. Never retried.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A read against the source failed in a way that may succeed on retry.
    #[error("Transient read error: {0}")]
    TransientRead(String),

    /// A participant broke the coordination protocol. Fatal to the session
    /// that sent the offending message; coordinator state is left untouched.
    #[error("Protocol violation for split '{split_id}': {message}")]
    ProtocolViolation { split_id: String, message: String },

    /// The source schema changed incompatibly under the stream reader.
    #[error("Schema drift on table '{table}': {message}")]
    SchemaDrift { table: String, message: String },

    /// The enumerator actor is gone or was closed.
    #[error("Split enumerator is closed")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Configuration(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        SyncError::TransientRead(message.into())
    }

    pub fn protocol(split_id: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::ProtocolViolation {
            split_id: split_id.into(),
            message: message.into(),
        }
    }

    pub fn schema_drift(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::SchemaDrift {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Only transient read failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientRead(_))
    }
}

/// Result type for chunk-sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
