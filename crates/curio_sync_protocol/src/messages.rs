//! Wire messages.
//!
//! The sync request body is a JSON array of trimmed changes
//! ([`crate::Change::to_wire`]); the server answers with a
//! [`SyncResponse`]. Cross-tab coordination uses [`TabMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A rev the server refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevRef {
    /// Local rev of the change.
    pub rev: i64,
}

/// A rev acknowledged by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevAck {
    /// Local rev of the change.
    pub rev: i64,
    /// Server revision assigned to it.
    #[serde(default)]
    pub server_rev: Option<i64>,
}

/// A change the server failed to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFailure {
    /// Local rev of the change.
    pub rev: i64,
    /// Server revision, if one was assigned.
    #[serde(default)]
    pub server_rev: Option<i64>,
    /// Set by the server on failures.
    #[serde(default)]
    pub errored: bool,
    /// Error details.
    #[serde(default)]
    pub errors: Vec<Value>,
}

/// Highest server revision of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRev {
    /// Channel id.
    pub channel_id: String,
    /// Highest server revision seen for the channel.
    #[serde(alias = "max_rev")]
    pub rev: i64,
}

/// Status of a background job on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Job id.
    pub task_id: String,
    /// Progress, usually 0 to 100.
    #[serde(default)]
    pub progress: Option<f64>,
    /// Job status text.
    #[serde(default)]
    pub status: String,
    /// Channel the job works on.
    #[serde(default)]
    pub channel_id: Option<String>,
}

/// Server reply to a sync POST. Every list may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Changes refused outright.
    #[serde(default)]
    pub disallowed: Vec<RevRef>,
    /// Changes accepted but not yet fully resolved.
    #[serde(default)]
    pub allowed: Vec<RevAck>,
    /// Changes the server pushes back to the client.
    #[serde(default)]
    pub returned: Vec<Value>,
    /// Changes that failed with errors.
    #[serde(default)]
    pub errors: Vec<ChangeFailure>,
    /// Changes durably applied.
    #[serde(default)]
    pub successes: Vec<RevAck>,
    /// Highest server revision per channel.
    #[serde(default, rename = "maxRevs")]
    pub max_revs: Vec<ChannelRev>,
    /// Background job status updates.
    #[serde(default)]
    pub tasks: Vec<TaskStatus>,
}

impl SyncResponse {
    /// True if the response carries nothing to reconcile.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.disallowed.is_empty()
            && self.allowed.is_empty()
            && self.returned.is_empty()
            && self.errors.is_empty()
            && self.successes.is_empty()
            && self.max_revs.is_empty()
            && self.tasks.is_empty()
    }
}

/// Outcome carried by a [`TabMessage::RequestResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    /// The fetch succeeded; `data` holds the result.
    Success,
    /// The fetch failed; `err` holds the message.
    Error,
}

/// Message exchanged between tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabMessage {
    /// Ask the fetcher tab to load a collection.
    #[serde(rename_all = "camelCase")]
    FetchCollection {
        /// Table to fetch.
        table_name: String,
        /// Query parameters.
        params: Value,
        /// Correlation id.
        message_id: String,
    },
    /// Ask the fetcher tab to load a single row.
    #[serde(rename_all = "camelCase")]
    FetchModel {
        /// Table to fetch.
        table_name: String,
        /// Id of the row.
        id: Value,
        /// Correlation id.
        message_id: String,
    },
    /// Answer to a fetch request.
    #[serde(rename_all = "camelCase")]
    RequestResponse {
        /// Correlation id of the request.
        message_id: String,
        /// Outcome.
        status: ResponseStatus,
        /// Result on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        /// Error message on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
    },
}

impl TabMessage {
    /// Correlation id of the message.
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::FetchCollection { message_id, .. }
            | Self::FetchModel { message_id, .. }
            | Self::RequestResponse { message_id, .. } => message_id,
        }
    }
}
