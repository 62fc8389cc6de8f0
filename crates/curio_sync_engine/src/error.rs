//! Error types for the sync engine.

use curio_storage::{StoreError, TxnError};
use curio_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Invalid change or malformed protocol message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Server answered with an error status.
    #[error("server error: {0}")]
    ServerError(String),

    /// The request was aborted.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A row the operation needs does not exist.
    #[error("no row {key} in table {table}")]
    NotFound {
        /// Table searched.
        table: String,
        /// Key that was not found.
        key: String,
    },

    /// The resource does not support the operation.
    #[error("table {table} does not support {operation}")]
    Unsupported {
        /// Table of the resource.
        table: String,
        /// Operation attempted.
        operation: String,
    },

    /// Misuse of a change tracker.
    #[error("change tracker: {0}")]
    Tracker(String),

    /// A fetch delegated to another tab failed there.
    #[error("cross-tab request failed: {0}")]
    CrossTab(String),

    /// Engine assembled without a required collaborator.
    #[error("configuration error: {0}")]
    Config(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a not-found error.
    pub fn not_found(table: impl Into<String>, key: impl ToString) -> Self {
        Self::NotFound {
            table: table.into(),
            key: key.to_string(),
        }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(table: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            table: table.into(),
            operation: operation.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }
}

impl TxnError for SyncError {
    fn as_store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}
