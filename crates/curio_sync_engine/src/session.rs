//! Session state shared with the sync client.

use parking_lot::RwLock;
use std::collections::BTreeMap;

/// The current channel scope and the last known server revision per channel.
#[derive(Debug, Default)]
pub struct Session {
    channel_id: RwLock<Option<String>>,
    max_revs: RwLock<BTreeMap<String, i64>>,
}

impl Session {
    /// Creates a session without a channel scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session scoped to `channel_id`.
    pub fn with_channel(channel_id: impl Into<String>) -> Self {
        let session = Self::new();
        session.set_channel(Some(channel_id.into()));
        session
    }

    /// Channel new changes are scoped to.
    pub fn channel_id(&self) -> Option<String> {
        self.channel_id.read().clone()
    }

    /// Changes the channel scope.
    pub fn set_channel(&self, channel_id: Option<String>) {
        *self.channel_id.write() = channel_id;
    }

    /// Last known server revision of `channel_id`.
    pub fn max_rev(&self, channel_id: &str) -> Option<i64> {
        self.max_revs.read().get(channel_id).copied()
    }

    /// Records a server revision. Revisions never move backwards; returns
    /// true if the stored value changed.
    pub fn record_max_rev(&self, channel_id: &str, rev: i64) -> bool {
        let mut revs = self.max_revs.write();
        match revs.get(channel_id) {
            Some(&current) if current >= rev => false,
            _ => {
                revs.insert(channel_id.to_string(), rev);
                true
            }
        }
    }

    /// Every known channel revision.
    pub fn max_revs(&self) -> BTreeMap<String, i64> {
        self.max_revs.read().clone()
    }
}
