//! Error types for the table store.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Why a transaction was deliberately aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The unit of work was reverted by its owner.
    ///
    /// [`crate::Database::transaction_outcome`] reports this as
    /// [`crate::TxnOutcome::Reverted`] instead of an error.
    Revert,
    /// Any other caller-requested abort.
    Other(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revert => f.write_str("reverted"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// Errors that can occur in the table store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a backend.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The journal is corrupted.
    #[error("journal corrupted: {0}")]
    Corrupted(String),

    /// A row or journal record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A schema definition string could not be parsed.
    #[error("invalid schema for table '{table}': {reason}")]
    InvalidSchema {
        /// Table being defined.
        table: String,
        /// What was wrong.
        reason: String,
    },

    /// The table was never registered.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The table is not part of the transaction's declared scope.
    #[error("table '{0}' is not in the transaction scope")]
    NotInScope(String),

    /// A write was attempted inside a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// An insert collided with an existing primary key.
    #[error("key {key} already exists in table '{table}'")]
    KeyExists {
        /// Table written to.
        table: String,
        /// The colliding key.
        key: String,
    },

    /// A row did not carry a usable primary key.
    #[error("invalid key for table '{table}': {reason}")]
    InvalidKey {
        /// Table written to.
        table: String,
        /// What was wrong.
        reason: String,
    },

    /// The transaction was aborted by its closure.
    #[error("transaction aborted: {0}")]
    Aborted(AbortReason),
}

impl StoreError {
    /// Creates an invalid-key error.
    pub fn invalid_key(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid-schema error.
    pub fn invalid_schema(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchema {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for a deliberate revert abort.
    #[must_use]
    pub fn is_revert(&self) -> bool {
        matches!(self, Self::Aborted(AbortReason::Revert))
    }
}
