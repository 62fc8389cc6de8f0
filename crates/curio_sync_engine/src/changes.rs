//! The persisted change log.
//!
//! Saved changes live in [`CHANGES_TABLE`] keyed by an auto-increment `rev`.
//! Rows stay until the server reports them durable, or stay flagged when
//! the server rejects them.

use crate::error::SyncResult;
use curio_storage::{
    Database, Key, Listener, ListenerId, StoreResult, TableSchema, Transaction, TransactionOptions,
};
use curio_sync_protocol::{Change, ChangeType, ProtocolError};
use serde_json::Value;
use std::ops::Bound;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Table holding changes waiting to be synced.
pub const CHANGES_TABLE: &str = "__changesForSyncing";

/// Table holding server-side job status.
pub const TASKS_TABLE: &str = "__tasks";

/// Schemas of the log and task tables.
pub fn log_schemas() -> StoreResult<Vec<TableSchema>> {
    Ok(vec![
        TableSchema::parse(CHANGES_TABLE, "++rev,[table+key],server_rev,type")?,
        TableSchema::parse(TASKS_TABLE, "task_id,channel_id")?,
    ])
}

/// One page of log rows.
#[derive(Debug, Clone, Default)]
pub struct LogPage {
    /// Decoded changes in rev order.
    pub changes: Vec<Change>,
    /// Rev to continue after, `None` once the range is exhausted.
    pub next_after: Option<i64>,
}

/// Access to the change log of a database.
#[derive(Clone)]
pub struct ChangeLog {
    db: Arc<Database>,
}

impl ChangeLog {
    /// Wraps `db`, which must contain the log tables.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// The underlying database.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Saves `change` in its own transaction tagged with the change's source.
    ///
    /// Returns the assigned rev, or `None` for a no-op update.
    pub fn save(&self, change: &Change) -> SyncResult<Option<i64>> {
        if change.is_noop() {
            return Ok(None);
        }
        let mut options = TransactionOptions::new().with_tables([CHANGES_TABLE]);
        if let Some(source) = &change.source {
            options = options.with_source(source.clone());
        }
        Ok(self.db.transaction(options, |txn| Self::save_in(txn, change))?)
    }

    /// Saves `change` inside an open transaction.
    pub fn save_in(txn: &mut Transaction<'_>, change: &Change) -> StoreResult<Option<i64>> {
        if change.is_noop() {
            return Ok(None);
        }
        let mut entry = change.to_entry();
        if let Some(map) = entry.as_object_mut() {
            map.remove("rev");
        }
        let rev = txn.add(CHANGES_TABLE, entry)?.as_int();
        debug!(rev = ?rev, table = %change.table, change_type = ?change.change_type(), "change saved");
        Ok(rev)
    }

    /// One change by rev.
    pub fn get(&self, rev: i64) -> SyncResult<Option<Change>> {
        match self.db.get(CHANGES_TABLE, &Key::Int(rev))? {
            Some(entry) => Ok(decode(&entry)?),
            None => Ok(None),
        }
    }

    /// Largest rev currently in the log, 0 when it is empty.
    pub fn max_rev(&self) -> SyncResult<i64> {
        let last = self.db.read(|txn| txn.last_key(CHANGES_TABLE))?;
        Ok(last.and_then(|k| k.as_int()).unwrap_or(0))
    }

    /// Last rev ever assigned, even if that row was deleted since.
    pub fn high_water_mark(&self) -> SyncResult<i64> {
        Ok(self.db.last_auto_key(CHANGES_TABLE)?)
    }

    /// Up to `limit` rows with `after < rev <= up_to`.
    pub fn page(&self, after: i64, up_to: i64, limit: usize) -> SyncResult<LogPage> {
        let rows = self.db.read(|txn| {
            txn.range(
                CHANGES_TABLE,
                Bound::Excluded(Key::Int(after)),
                Bound::Included(Key::Int(up_to)),
                Some(limit),
            )
        })?;
        let next_after = match rows.last() {
            Some((key, _)) if rows.len() == limit => key.as_int(),
            _ => None,
        };
        let mut changes = Vec::with_capacity(rows.len());
        for (_, entry) in &rows {
            if let Some(change) = decode(entry)? {
                changes.push(change);
            }
        }
        Ok(LogPage { changes, next_after })
    }

    /// Every change with rev above `after`.
    pub fn since(&self, after: i64) -> SyncResult<Vec<Change>> {
        let rows = self.db.read(|txn| {
            txn.range(CHANGES_TABLE, Bound::Excluded(Key::Int(after)), Bound::Unbounded, None)
        })?;
        decode_all(rows.iter().map(|(_, entry)| entry))
    }

    /// Changes still waiting for the server that address `(table, key)`.
    pub fn pending_for(&self, table: &str, key: &Value) -> SyncResult<Vec<Change>> {
        self.db.read(|txn| Self::pending_for_in(txn, table, key))
    }

    /// Like [`ChangeLog::pending_for`], inside an open transaction.
    pub fn pending_for_in(txn: &Transaction<'_>, table: &str, key: &Value) -> SyncResult<Vec<Change>> {
        let table = Value::from(table);
        let rows = txn.filter(CHANGES_TABLE, |entry| {
            entry.get("table") == Some(&table) && entry.get("key") == Some(key)
        })?;
        let changes = decode_all(rows.iter().map(|(_, entry)| entry))?;
        Ok(changes.into_iter().filter(|c| !c.is_rejected()).collect())
    }

    /// Pending changes of one type in `table`.
    pub fn pending_of_type(&self, table: &str, change_type: ChangeType) -> SyncResult<Vec<Change>> {
        let table = Value::from(table);
        let code = Value::from(change_type.to_code());
        let rows = self.db.read(|txn| {
            txn.filter(CHANGES_TABLE, |entry| {
                entry.get("table") == Some(&table) && entry.get("type") == Some(&code)
            })
        })?;
        let changes = decode_all(rows.iter().map(|(_, entry)| entry))?;
        Ok(changes.into_iter().filter(|c| !c.is_rejected()).collect())
    }

    /// Deletes the rows with the given revs; returns how many existed.
    pub fn delete(&self, revs: &[i64]) -> SyncResult<usize> {
        if revs.is_empty() {
            return Ok(0);
        }
        let options = TransactionOptions::new().with_tables([CHANGES_TABLE]);
        let deleted = self.db.transaction(options, |txn| -> StoreResult<usize> {
            let mut deleted = 0;
            for rev in revs {
                if txn.delete(CHANGES_TABLE, &Key::Int(*rev))? {
                    deleted += 1;
                }
            }
            Ok(deleted)
        })?;
        debug!(count = deleted, "log rows deleted");
        Ok(deleted)
    }

    /// True while any row still needs the server. Rows the server already
    /// acknowledged or rejected do not count.
    pub fn has_unsynced(&self) -> SyncResult<bool> {
        Ok(self.db.read(|txn| unsynced_in(txn))?)
    }

    /// A live view of [`ChangeLog::has_unsynced`].
    pub fn watch_unsynced(&self) -> SyncResult<UnsyncedWatch> {
        let (tx, rx) = watch::channel(self.has_unsynced()?);
        let weak: Weak<Database> = Arc::downgrade(&self.db);
        let id = self.db.subscribe(Listener::callback(move |event| {
            if !event.touches(CHANGES_TABLE) {
                return;
            }
            let Some(db) = weak.upgrade() else {
                return;
            };
            match db.read(|txn| unsynced_in(txn)) {
                Ok(value) => {
                    tx.send_if_modified(|current| {
                        let changed = *current != value;
                        *current = value;
                        changed
                    });
                }
                Err(e) => warn!(error = %e, "failed to refresh unsynced state"),
            }
        }));
        Ok(UnsyncedWatch {
            rx,
            db: Arc::downgrade(&self.db),
            id,
        })
    }
}

/// Receiver side of [`ChangeLog::watch_unsynced`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct UnsyncedWatch {
    rx: watch::Receiver<bool>,
    db: Weak<Database>,
    id: ListenerId,
}

impl UnsyncedWatch {
    /// Current value.
    pub fn get(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the value to change and returns it.
    pub async fn changed(&mut self) -> bool {
        // The sender lives in the listener, which this watch owns.
        let _ = self.rx.changed().await;
        *self.rx.borrow_and_update()
    }
}

impl Drop for UnsyncedWatch {
    fn drop(&mut self) {
        if let Some(db) = self.db.upgrade() {
            db.unsubscribe(self.id);
        }
    }
}

fn unsynced_in(txn: &Transaction<'_>) -> StoreResult<bool> {
    let rejected = |entry: &Value| {
        ["disallowed", "errored"]
            .iter()
            .any(|flag| entry.get(*flag).and_then(Value::as_bool).unwrap_or(false))
            || entry
                .get("errors")
                .and_then(Value::as_array)
                .is_some_and(|errors| !errors.is_empty())
    };
    let acknowledged = |entry: &Value| entry.get("server_rev").is_some_and(|rev| !rev.is_null());
    Ok(!txn
        .filter(CHANGES_TABLE, |entry| !rejected(entry) && !acknowledged(entry))?
        .is_empty())
}

/// Decodes one log entry. Entries of an unknown type are skipped.
fn decode(entry: &Value) -> SyncResult<Option<Change>> {
    match Change::from_entry(entry) {
        Ok(change) => Ok(Some(change)),
        Err(ProtocolError::UnknownChangeType(code)) => {
            warn!(code, "skipping log entry of unknown type");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn decode_all<'a, I>(entries: I) -> SyncResult<Vec<Change>>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut changes = Vec::new();
    for entry in entries {
        if let Some(change) = decode(entry)? {
            changes.push(change);
        }
    }
    Ok(changes)
}
