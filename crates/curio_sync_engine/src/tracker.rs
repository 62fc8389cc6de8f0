//! Scoped change tracking with revert.
//!
//! A [`ChangeTracker`] brackets a higher level operation: `start()` marks
//! the log, `stop()` collects what the operation logged, and `revert()`
//! undoes exactly those changes.
//!
//! ```text
//! Idle --start--> Tracking --stop--> Stopped --revert--> Reverted
//! ```

use crate::changes::{ChangeLog, CHANGES_TABLE};
use crate::error::{SyncError, SyncResult};
use crate::registry::row_key;
use curio_storage::{AbortReason, Database, Key, StoreError, Transaction, TransactionOptions};
use curio_sync_protocol::{is_ignored_source, Change, ChangeKind, REVERT_SOURCE};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// Not started.
    Idle,
    /// Recording changes.
    Tracking,
    /// Changes collected, ready to revert.
    Stopped,
    /// Collected changes were undone.
    Reverted,
}

/// Brackets a group of writes so they can be undone as one unit.
pub struct ChangeTracker {
    log: ChangeLog,
    state: TrackerState,
    starting_rev: i64,
    changes: Vec<Change>,
}

impl ChangeTracker {
    /// Creates an idle tracker over the log of `db`.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            log: ChangeLog::new(db),
            state: TrackerState::Idle,
            starting_rev: 0,
            changes: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// High-water mark recorded by `start()`.
    pub fn starting_rev(&self) -> i64 {
        self.starting_rev
    }

    /// Changes collected by `stop()`.
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// Starts tracking from the current log high-water mark.
    ///
    /// The mark is the last rev ever assigned, so it is known even when
    /// every earlier change has already been synced away.
    pub fn start(&mut self) -> SyncResult<()> {
        if self.state == TrackerState::Tracking {
            return Err(self.transition_error("tracking"));
        }
        self.starting_rev = self.log.high_water_mark()?;
        self.changes.clear();
        self.state = TrackerState::Tracking;
        debug!(starting_rev = self.starting_rev, "tracking started");
        Ok(())
    }

    /// Stops tracking and collects the changes logged since `start()`,
    /// leaving out writes from sync and apply.
    pub fn stop(&mut self) -> SyncResult<&[Change]> {
        if self.state != TrackerState::Tracking {
            return Err(self.transition_error("stopped"));
        }
        self.changes = self
            .log
            .since(self.starting_rev)?
            .into_iter()
            .filter(|c| !c.source.as_deref().is_some_and(is_ignored_source))
            .collect();
        self.state = TrackerState::Stopped;
        debug!(count = self.changes.len(), "tracking stopped");
        Ok(&self.changes)
    }

    /// Undoes the collected changes, newest first. Returns how many were
    /// undone.
    ///
    /// Reverting while still tracking, or a second time, does nothing.
    ///
    /// # Errors
    ///
    /// [`SyncError::Tracker`] if the tracker was never started, or stopped
    /// without collecting a change.
    pub fn revert(&mut self) -> SyncResult<usize> {
        match self.state {
            TrackerState::Idle => {
                return Err(SyncError::Tracker("revert called before start and stop".into()))
            }
            TrackerState::Tracking | TrackerState::Reverted => return Ok(0),
            TrackerState::Stopped if self.changes.is_empty() => {
                return Err(SyncError::Tracker("no changes to revert".into()))
            }
            TrackerState::Stopped => {}
        }

        let db = self.log.database().clone();
        for change in self.changes.iter().rev() {
            undo(&db, change)?;
        }
        self.state = TrackerState::Reverted;
        debug!(count = self.changes.len(), "changes reverted");
        Ok(self.changes.len())
    }

    /// Aborts the open transaction `txn` instead of undoing row by row.
    ///
    /// Pair with [`Database::transaction_outcome`], which reports the abort
    /// as [`curio_storage::TxnOutcome::Reverted`].
    pub fn revert_in(txn: &Transaction<'_>) -> StoreError {
        txn.abort(AbortReason::Revert)
    }

    fn transition_error(&self, to: &str) -> SyncError {
        SyncError::InvalidStateTransition {
            from: format!("{:?}", self.state),
            to: to.into(),
        }
    }
}

fn undo(db: &Database, change: &Change) -> SyncResult<()> {
    let options = TransactionOptions::new()
        .with_tables([change.table.as_str(), CHANGES_TABLE])
        .with_source(REVERT_SOURCE);
    db.transaction(options, |txn| -> SyncResult<()> {
        let key = row_key(&change.table, &change.key)?;
        match (&change.kind, change.old_obj()) {
            (ChangeKind::Created { .. } | ChangeKind::Copied { .. }, _)
            | (ChangeKind::Moved { .. }, None) => {
                txn.delete(&change.table, &key)?;
            }
            (ChangeKind::Updated { .. } | ChangeKind::Deleted { .. } | ChangeKind::Moved { .. }, Some(old)) => {
                txn.put(&change.table, old.clone())?;
            }
            _ => {
                warn!(rev = ?change.rev, change_type = ?change.change_type(), "change cannot be undone locally");
            }
        }
        if let Some(rev) = change.rev {
            txn.delete(CHANGES_TABLE, &Key::Int(rev))?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ResourceRegistry, CONTENTNODE};
    use curio_sync_protocol::{ChangeBuilder, IGNORED_SOURCE};
    use serde_json::{json, Value};

    struct Fixture {
        db: Arc<Database>,
        registry: ResourceRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = ResourceRegistry::standard();
            let db = Arc::new(registry.open_in_memory().unwrap());
            Self { db, registry }
        }

        fn put_node(&self, row: Value) {
            self.db
                .transaction(TransactionOptions::new(), |txn| txn.put(CONTENTNODE, row))
                .unwrap();
        }

        fn node(&self, id: &str) -> Option<Value> {
            self.db.get(CONTENTNODE, &id.into()).unwrap()
        }

        fn update(&self, id: &str, changes: Value, source: &str) {
            let old = self.node(id).unwrap();
            let change = ChangeBuilder::new(&self.registry)
                .with_source(source)
                .updated(CONTENTNODE, json!(id), old, changes)
                .unwrap();
            let row = change.obj().cloned().unwrap();
            self.db
                .transaction(TransactionOptions::new(), |txn| -> SyncResult<_> {
                    txn.put(CONTENTNODE, row)?;
                    ChangeLog::save_in(txn, &change)?;
                    Ok(())
                })
                .unwrap();
        }

        fn create(&self, id: &str) {
            let row = json!({"id": id, "title": id});
            let change = ChangeBuilder::new(&self.registry)
                .with_source("tab")
                .created(CONTENTNODE, json!(id), row.clone())
                .unwrap();
            self.db
                .transaction(TransactionOptions::new(), |txn| -> SyncResult<_> {
                    txn.put(CONTENTNODE, row)?;
                    ChangeLog::save_in(txn, &change)?;
                    Ok(())
                })
                .unwrap();
        }
    }

    #[test]
    fn revert_restores_snapshot() {
        let fx = Fixture::new();
        let original = json!({"id": "n1", "title": "a", "extra": {"m": 1}});
        fx.put_node(original.clone());

        let mut tracker = ChangeTracker::new(fx.db.clone());
        tracker.start().unwrap();
        fx.update("n1", json!({"title": "b"}), "tab");
        fx.update("n1", json!({"extra": {"m": 2, "n": 3}}), "tab");
        fx.update("n1", json!({"title": "c"}), "tab");
        assert_eq!(tracker.stop().unwrap().len(), 3);

        assert_eq!(tracker.revert().unwrap(), 3);
        assert_eq!(fx.node("n1").unwrap(), original);
        assert_eq!(tracker.state(), TrackerState::Reverted);
        assert_eq!(ChangeLog::new(fx.db.clone()).max_rev().unwrap(), 0);
        assert_eq!(tracker.revert().unwrap(), 0);
    }

    #[test]
    fn revert_deletes_created_rows() {
        let fx = Fixture::new();
        let mut tracker = ChangeTracker::new(fx.db.clone());
        tracker.start().unwrap();
        fx.create("n2");
        tracker.stop().unwrap();
        tracker.revert().unwrap();
        assert!(fx.node("n2").is_none());
    }

    #[test]
    fn ignored_sources_are_not_collected() {
        let fx = Fixture::new();
        fx.put_node(json!({"id": "n1", "title": "a"}));
        let mut tracker = ChangeTracker::new(fx.db.clone());
        tracker.start().unwrap();
        fx.update("n1", json!({"title": "remote"}), IGNORED_SOURCE);
        fx.update("n1", json!({"title": "local"}), "tab");
        let collected = tracker.stop().unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].source.as_deref(), Some("tab"));
    }

    #[test]
    fn start_uses_high_water_mark_after_sync() {
        let fx = Fixture::new();
        fx.create("old");
        ChangeLog::new(fx.db.clone()).delete(&[1]).unwrap();

        let mut tracker = ChangeTracker::new(fx.db.clone());
        tracker.start().unwrap();
        assert_eq!(tracker.starting_rev(), 1);
        fx.create("new");
        assert_eq!(tracker.stop().unwrap()[0].rev, Some(2));
    }

    #[test]
    fn state_rules() {
        let fx = Fixture::new();
        let mut tracker = ChangeTracker::new(fx.db.clone());
        assert!(matches!(tracker.revert(), Err(SyncError::Tracker(_))));
        assert!(tracker.stop().is_err());
        tracker.start().unwrap();
        assert!(tracker.start().is_err());
        assert_eq!(tracker.revert().unwrap(), 0);
        assert_eq!(tracker.state(), TrackerState::Tracking);
    }

    #[test]
    fn revert_without_changes_errors() {
        let fx = Fixture::new();
        let mut tracker = ChangeTracker::new(fx.db.clone());
        tracker.start().unwrap();
        assert!(tracker.stop().unwrap().is_empty());
        assert!(matches!(tracker.revert(), Err(SyncError::Tracker(_))));
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }

    #[test]
    fn revert_in_open_transaction_discards_writes() {
        let fx = Fixture::new();
        let outcome = fx
            .db
            .transaction_outcome(TransactionOptions::new(), |txn| -> SyncResult<()> {
                txn.put(CONTENTNODE, json!({"id": "tmp"}))?;
                Err(ChangeTracker::revert_in(txn).into())
            })
            .unwrap();
        assert!(outcome.is_reverted());
        assert!(fx.node("tmp").is_none());
    }
}
