//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building, decoding or merging changes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A required field was absent or null.
    #[error("missing required field '{0}'")]
    MissingField(String),

    /// A field had the wrong shape or value.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The offending field.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The table is not a registered syncable table.
    #[error("table '{0}' is not a syncable table")]
    UnknownTable(String),

    /// A persisted or received change had a type code this build does not know.
    #[error("unknown change type {0}")]
    UnknownChangeType(u64),

    /// A change handed to the merge engine had no `rev`.
    #[error("change is missing a rev")]
    MissingRev,

    /// Changes handed to the merge engine were not in ascending `rev` order.
    #[error("changes out of order: rev {rev} after {previous}")]
    OutOfOrder {
        /// Rev of the change seen before.
        previous: i64,
        /// The offending rev.
        rev: i64,
    },

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates a missing-field error.
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    /// Creates an invalid-field error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
