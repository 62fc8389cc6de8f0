//! Applying changes to the local store.
//!
//! Changes the server sends back are replayed here. Every write runs with
//! [`IGNORED_SOURCE`] so it is never logged as a new outgoing change.

use crate::error::{SyncError, SyncResult};
use crate::registry::{row_key, ResourceRegistry, CONTENTNODE};
use crate::stream::{ChangeDispatcher, ChangeStream};
use crate::tree::TreeResource;
use async_trait::async_trait;
use curio_storage::{Database, TransactionOptions};
use curio_sync_protocol::{apply_mods, Change, ChangeKind, ProtocolError, IGNORED_SOURCE};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// A change that altered the local store, with its result.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    /// The change.
    pub change: Change,
    /// What the dispatcher reported, usually the written row.
    pub result: Value,
}

/// Dispatcher writing changes straight into the store.
pub struct StoreDispatcher {
    db: Arc<Database>,
    registry: Arc<ResourceRegistry>,
}

impl StoreDispatcher {
    /// Creates a dispatcher over `db`.
    pub fn new(db: Arc<Database>, registry: Arc<ResourceRegistry>) -> Self {
        Self { db, registry }
    }

    fn options(&self, table: &str) -> TransactionOptions {
        TransactionOptions::new()
            .with_tables([table])
            .with_source(IGNORED_SOURCE)
    }

    fn stores(&self, change: &Change) -> bool {
        let known = self.db.schema(&change.table).is_some();
        if !known {
            debug!(table = %change.table, "table not stored locally, skipping");
        }
        known
    }

    fn tree(&self, change: &Change) -> Option<&Arc<dyn TreeResource>> {
        let tree = self.registry.get(&change.table).and_then(|d| d.tree());
        if tree.is_none() {
            debug!(table = %change.table, "table has no tree hooks, skipping");
        }
        tree
    }
}

/// Treats a missing move target or copy source as "not applied": the local
/// cache may simply not hold that part of the tree.
fn tolerate_missing(result: SyncResult<Option<Value>>) -> SyncResult<Option<Value>> {
    match result {
        Err(SyncError::NotFound { table, key }) => {
            debug!(%table, %key, "tree anchor not stored locally");
            Ok(None)
        }
        other => other,
    }
}

#[async_trait]
impl ChangeDispatcher for StoreDispatcher {
    async fn apply_created(&self, change: &Change) -> SyncResult<Option<Value>> {
        let Some(mut obj) = change.obj().cloned().filter(|_| self.stores(change)) else {
            return Ok(None);
        };
        if let (Some(descriptor), Some(map)) = (self.registry.get(&change.table), obj.as_object_mut()) {
            map.entry(descriptor.id_field().to_string())
                .or_insert_with(|| change.key.clone());
        }
        self.db
            .transaction(self.options(&change.table), |txn| -> SyncResult<_> {
                txn.put(&change.table, obj.clone())?;
                Ok(Some(obj))
            })
    }

    async fn apply_updated(&self, change: &Change) -> SyncResult<Option<Value>> {
        let ChangeKind::Updated { mods, .. } = &change.kind else {
            return Ok(None);
        };
        if !self.stores(change) {
            return Ok(None);
        }
        self.db
            .transaction(self.options(&change.table), |txn| -> SyncResult<_> {
                let key = row_key(&change.table, &change.key)?;
                let mut updated = None;
                txn.update(&change.table, &key, |row| {
                    apply_mods(row, mods);
                    updated = Some(row.clone());
                })?;
                Ok(updated)
            })
    }

    async fn apply_deleted(&self, change: &Change) -> SyncResult<Option<Value>> {
        if !self.stores(change) {
            return Ok(None);
        }
        self.db
            .transaction(self.options(&change.table), |txn| -> SyncResult<_> {
                let key = row_key(&change.table, &change.key)?;
                let existed = txn.delete(&change.table, &key)?;
                Ok(existed.then(|| change.key.clone()))
            })
    }

    async fn apply_moved(&self, change: &Change) -> SyncResult<Option<Value>> {
        let ChangeKind::Moved { target, position, .. } = &change.kind else {
            return Ok(None);
        };
        let Some(tree) = self.tree(change).filter(|_| self.stores(change)) else {
            return Ok(None);
        };
        tolerate_missing(self.db.transaction(
            self.options(&change.table),
            |txn| -> SyncResult<_> {
                let insert = tree.resolve_tree_insert(txn, &change.table, target, *position)?;
                tree.table_move(txn, &change.table, &change.key, &insert)
            },
        ))
    }

    async fn apply_copied(&self, change: &Change) -> SyncResult<Option<Value>> {
        let ChangeKind::Copied {
            from_key,
            mods,
            target,
            position,
            ..
        } = &change.kind
        else {
            return Ok(None);
        };
        let Some(tree) = self.tree(change).filter(|_| self.stores(change)) else {
            return Ok(None);
        };
        tolerate_missing(self.db.transaction(
            self.options(&change.table),
            |txn| -> SyncResult<_> {
                let insert = tree.resolve_tree_insert(txn, &change.table, target, *position)?;
                tree.table_copy(txn, &change.table, from_key, &change.key, mods, &insert)
            },
        ))
    }

    async fn apply_published(&self, change: &Change) -> SyncResult<Option<Value>> {
        let channel = change
            .channel_id
            .clone()
            .map(Value::String)
            .unwrap_or_else(|| change.key.clone());
        if self.db.schema(CONTENTNODE).is_none() {
            return Ok(None);
        }
        let count = self.db.transaction(self.options(CONTENTNODE), |txn| {
            txn.modify_where(
                CONTENTNODE,
                |row| row.get("channel_id") == Some(&channel),
                |row| {
                    if let Some(map) = row.as_object_mut() {
                        map.insert("changed".into(), Value::Bool(false));
                        map.insert("published".into(), Value::Bool(true));
                    }
                },
            )
        })?;
        debug!(channel = %channel, count, "nodes marked published");
        Ok(Some(json!(count)))
    }
}

/// Applies batches of changes in causal order.
pub struct ApplyEngine {
    stream: ChangeStream,
}

impl ApplyEngine {
    /// Creates an engine writing through `stream`.
    pub fn new(stream: ChangeStream) -> Self {
        Self { stream }
    }

    /// Creates an engine with a single [`StoreDispatcher`].
    pub fn with_store(db: Arc<Database>, registry: Arc<ResourceRegistry>) -> Self {
        let dispatcher: Arc<dyn ChangeDispatcher> = Arc::new(StoreDispatcher::new(db, registry));
        Self::new(ChangeStream::new(vec![dispatcher]))
    }

    /// Applies `changes` ordered by `(server_rev, rev)`, missing values
    /// last. Returns the changes that altered the store.
    pub async fn apply_changes(&self, mut changes: Vec<Change>) -> SyncResult<Vec<AppliedChange>> {
        changes.sort_by_key(|c| {
            (
                c.server_rev.unwrap_or(i64::MAX),
                c.rev.unwrap_or(i64::MAX),
            )
        });
        let mut applied = Vec::new();
        for change in changes {
            if let Some(result) = self.stream.write(&change).await? {
                applied.push(AppliedChange { change, result });
            }
        }
        debug!(count = applied.len(), "changes applied");
        Ok(applied)
    }

    /// Decodes server-sent entries and applies them.
    ///
    /// Entries of unknown types are skipped, as are entries too malformed
    /// to decode.
    pub async fn apply_entries(&self, entries: &[Value]) -> SyncResult<Vec<AppliedChange>> {
        let mut changes = Vec::with_capacity(entries.len());
        for entry in entries {
            match Change::from_entry(entry) {
                Ok(change) => changes.push(change),
                Err(ProtocolError::UnknownChangeType(code)) => {
                    debug!(code, "skipping change of unknown type");
                }
                Err(e) => warn!(error = %e, "skipping malformed change"),
            }
        }
        self.apply_changes(changes).await
    }
}
