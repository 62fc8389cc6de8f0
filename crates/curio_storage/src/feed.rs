//! Commit feed for observing committed writes.
//!
//! Events are emitted only after a transaction commits and after the store
//! has released its locks, so listeners may read from the database.
//!
//! Listeners come in two shapes, fixed when they are registered:
//!
//! - [`Listener::Commit`] receives every [`CommitEvent`] over a channel
//! - [`Listener::Callback`] is invoked inline on the committing thread

use crate::key::Key;
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// One row written by a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    /// Table written to.
    pub table: String,
    /// Primary key of the row.
    pub key: Key,
    /// New row, `None` for a delete.
    pub value: Option<Value>,
    /// Row before the commit, `None` if it did not exist.
    pub previous: Option<Value>,
}

impl RowChange {
    /// True if the row did not exist before.
    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.previous.is_none() && self.value.is_some()
    }

    /// True if the row was removed.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// Everything one committed transaction wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    /// Commit sequence number.
    pub sequence: u64,
    /// Source tag the transaction was opened with.
    pub source: Option<String>,
    /// Row writes in key order per table.
    pub changes: Vec<RowChange>,
}

impl CommitEvent {
    /// True if any row of `table` was written.
    #[must_use]
    pub fn touches(&self, table: &str) -> bool {
        self.changes.iter().any(|c| c.table == table)
    }

    /// Rows newly inserted into `table`.
    pub fn inserts_into<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a RowChange> + 'a {
        self.changes
            .iter()
            .filter(move |c| c.table == table && c.is_insert())
    }
}

/// Identifier returned by [`CommitFeed::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A registered commit listener.
#[derive(Clone)]
pub enum Listener {
    /// Receives events over a channel. Dropped once the receiver is gone.
    Commit(Sender<CommitEvent>),
    /// Called synchronously for each event.
    Callback(Arc<dyn Fn(&CommitEvent) + Send + Sync>),
}

impl Listener {
    /// Wraps a closure as a callback listener.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&CommitEvent) + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }

    /// Delivers `event`; returns false if the listener is disconnected.
    fn deliver(&self, event: &CommitEvent) -> bool {
        match self {
            Self::Commit(tx) => tx.send(event.clone()).is_ok(),
            Self::Callback(f) => {
                f(event);
                true
            }
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit(_) => f.write_str("Listener::Commit"),
            Self::Callback(_) => f.write_str("Listener::Callback"),
        }
    }
}

/// Distributes commit events to listeners in commit order.
#[derive(Debug, Default)]
pub struct CommitFeed {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl CommitFeed {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Delivers `event` to every listener.
    ///
    /// Listeners are snapshotted first so a callback may subscribe or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, event: &CommitEvent) {
        let snapshot: Vec<(ListenerId, Listener)> = self.listeners.read().clone();
        let dead: Vec<ListenerId> = snapshot
            .iter()
            .filter(|(_, listener)| !listener.deliver(event))
            .map(|(id, _)| *id)
            .collect();
        if !dead.is_empty() {
            self.listeners.write().retain(|(id, _)| !dead.contains(id));
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn event(sequence: u64) -> CommitEvent {
        CommitEvent {
            sequence,
            source: None,
            changes: vec![RowChange {
                table: "t".into(),
                key: Key::Int(1),
                value: Some(json!({"id": 1})),
                previous: None,
            }],
        }
    }

    #[test]
    fn commit_listener_receives_events() {
        let feed = CommitFeed::new();
        let (tx, rx) = mpsc::channel();
        feed.subscribe(Listener::Commit(tx));
        feed.emit(&event(1));
        assert_eq!(rx.recv().unwrap(), event(1));
    }

    #[test]
    fn disconnected_commit_listener_is_dropped() {
        let feed = CommitFeed::new();
        let (tx, rx) = mpsc::channel();
        feed.subscribe(Listener::Commit(tx));
        drop(rx);
        feed.emit(&event(1));
        assert_eq!(feed.listener_count(), 0);
    }

    #[test]
    fn callback_can_be_unsubscribed() {
        let feed = CommitFeed::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = feed.subscribe(Listener::callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        feed.emit(&event(1));
        assert!(feed.unsubscribe(id));
        feed.emit(&event(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!feed.unsubscribe(id));
    }

    #[test]
    fn insert_detection() {
        let e = event(1);
        assert!(e.touches("t"));
        assert_eq!(e.inserts_into("t").count(), 1);
        assert_eq!(e.inserts_into("other").count(), 0);
    }
}
