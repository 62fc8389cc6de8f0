//! The resource facade.
//!
//! A [`Resource`] is how application code reads and writes one table. Every
//! write stores the row and logs the matching change in one transaction;
//! reads serve the local store and refresh stale rows from the server.

use crate::changes::{ChangeLog, CHANGES_TABLE};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::fetch::{is_stale, Fetcher};
use crate::registry::{row_key, ResourceDescriptor};
use crate::tree::TreeResource;
use curio_storage::{Transaction, TransactionOptions};
use curio_sync_protocol::{
    apply_mods, diff_mods, Change, ChangeBuilder, ChangeKind, CopySpec, ProtocolError,
    ProtocolResult, RelativePosition, SyncOptions,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix marking a membership filter in [`Resource::where_`].
const IN_SUFFIX: &str = "__in";

/// Logs changes built inside a write transaction.
///
/// Writes to tables that do not sync go through without a log entry.
struct Recorder<'a> {
    ctx: Option<&'a SyncContext>,
}

impl Recorder<'_> {
    fn record<F>(&self, txn: &mut Transaction<'_>, make: F) -> SyncResult<Option<i64>>
    where
        F: FnOnce(&ChangeBuilder<'_>) -> ProtocolResult<Change>,
    {
        match self.ctx {
            Some(ctx) => {
                let change = ctx.build(|b| make(&b))?;
                self.save(txn, &change)
            }
            None => Ok(None),
        }
    }

    /// Logs a change built before the transaction opened.
    fn save(&self, txn: &mut Transaction<'_>, change: &Change) -> SyncResult<Option<i64>> {
        match self.ctx {
            Some(_) => Ok(ChangeLog::save_in(txn, change)?),
            None => Ok(None),
        }
    }
}

/// Reads and writes of one registered table.
#[derive(Clone)]
pub struct Resource {
    ctx: SyncContext,
    descriptor: ResourceDescriptor,
    fetcher: Option<Arc<dyn Fetcher>>,
}

impl Resource {
    /// Creates the facade of `descriptor`. Without a fetcher, reads only
    /// ever see the local store.
    pub fn new(ctx: SyncContext, descriptor: ResourceDescriptor, fetcher: Option<Arc<dyn Fetcher>>) -> Self {
        Self {
            ctx,
            descriptor,
            fetcher,
        }
    }

    /// Table name.
    pub fn table_name(&self) -> &str {
        self.descriptor.table_name()
    }

    /// The descriptor this facade was built from.
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    fn tree(&self, operation: &str) -> SyncResult<&Arc<dyn TreeResource>> {
        self.descriptor
            .tree()
            .ok_or_else(|| SyncError::unsupported(self.table_name(), operation))
    }

    fn fetcher(&self) -> SyncResult<&Arc<dyn Fetcher>> {
        self.fetcher
            .as_ref()
            .ok_or_else(|| SyncError::unsupported(self.table_name(), "fetch"))
    }

    /// One row, refreshed from the server when missing locally or older
    /// than the cache TTL.
    ///
    /// A failed refresh falls back to the local row.
    pub async fn get(&self, id: &Value) -> SyncResult<Option<Value>> {
        let local = self.get_local(id)?;
        let Some(fetcher) = &self.fetcher else {
            return Ok(local);
        };
        let ttl = self.ctx.config().cache_ttl;
        if local.as_ref().is_some_and(|row| !is_stale(row, ttl)) {
            return Ok(local);
        }
        match fetcher.fetch_model(self.table_name(), id).await {
            Ok(_) => self.get_local(id),
            Err(e) => {
                warn!(table = self.table_name(), error = %e, "refresh failed, serving local row");
                Ok(local)
            }
        }
    }

    /// One row from the local store only.
    pub fn get_local(&self, id: &Value) -> SyncResult<Option<Value>> {
        let table = self.table_name();
        self.ctx.db().read(|txn| -> SyncResult<Option<Value>> {
            let Some(mut row) = txn.get(table, &row_key(table, id)?)? else {
                return Ok(None);
            };
            self.inherit(txn, id, &mut row)?;
            Ok(Some(row))
        })
    }

    /// Rows matching `params`, an object of field equalities. A key ending
    /// in `__in` matches rows whose field is one of the listed values.
    ///
    /// Refreshes from the server when nothing matches locally or any match
    /// is stale; a failed refresh falls back to the local rows.
    pub async fn where_(&self, params: &Value) -> SyncResult<Vec<Value>> {
        let local = self.where_local(params)?;
        let Some(fetcher) = &self.fetcher else {
            return Ok(local);
        };
        let ttl = self.ctx.config().cache_ttl;
        if !local.is_empty() && local.iter().all(|row| !is_stale(row, ttl)) {
            return Ok(local);
        }
        match fetcher.fetch_collection(self.table_name(), params).await {
            Ok(_) => self.where_local(params),
            Err(e) => {
                warn!(table = self.table_name(), error = %e, "refresh failed, serving local rows");
                Ok(local)
            }
        }
    }

    /// Rows matching `params` from the local store only.
    pub fn where_local(&self, params: &Value) -> SyncResult<Vec<Value>> {
        let empty = serde_json::Map::new();
        let filters = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return Err(ProtocolError::invalid("params", "must be an object").into());
            }
        };
        let table = self.table_name();
        let id_field = self.descriptor.id_field();
        self.ctx.db().read(|txn| -> SyncResult<Vec<Value>> {
            let matching = txn.filter(table, |row| matches_filters(row, filters))?;
            let mut rows = Vec::with_capacity(matching.len());
            for (_, mut row) in matching {
                if let Some(id) = row.get(id_field).cloned() {
                    self.inherit(txn, &id, &mut row)?;
                }
                rows.push(row);
            }
            Ok(rows)
        })
    }

    /// Applies pending descendant patches of every ancestor of `id`,
    /// oldest first.
    fn inherit(&self, txn: &Transaction<'_>, id: &Value, row: &mut Value) -> SyncResult<()> {
        let Some(tree) = self.descriptor.tree() else {
            return Ok(());
        };
        let table = self.table_name();
        let mut inherited = Vec::new();
        for ancestor in tree.ancestors(txn, table, id)? {
            inherited.extend(
                ChangeLog::pending_for_in(txn, table, &ancestor)?
                    .into_iter()
                    .filter(|c| matches!(c.kind, ChangeKind::UpdatedDescendants { .. })),
            );
        }
        inherited.sort_by_key(|c| c.rev);
        for change in inherited {
            if let ChangeKind::UpdatedDescendants { mods } = &change.kind {
                apply_mods(row, mods);
            }
        }
        Ok(())
    }

    /// Loads one row from the server into the local store.
    pub async fn fetch_model(&self, id: &Value) -> SyncResult<Option<Value>> {
        self.fetcher()?.fetch_model(self.table_name(), id).await
    }

    /// Loads the rows matching `params` from the server into the local store.
    pub async fn fetch_collection(&self, params: &Value) -> SyncResult<Vec<Value>> {
        self.fetcher()?.fetch_collection(self.table_name(), params).await
    }

    /// Runs `f` in one transaction over this table and the log, tagged with
    /// the client id.
    fn commit<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut Transaction<'_>, &Recorder<'_>) -> SyncResult<T>,
    {
        let recorder = Recorder {
            ctx: self.descriptor.syncable().then_some(&self.ctx),
        };
        let options = TransactionOptions::new()
            .with_tables([self.table_name(), CHANGES_TABLE])
            .with_source(self.ctx.client_id());
        self.ctx.db().transaction(options, |txn| f(txn, &recorder))
    }

    fn require(&self, txn: &Transaction<'_>, id: &Value) -> SyncResult<Value> {
        let table = self.table_name();
        txn.get(table, &row_key(table, id)?)?
            .ok_or_else(|| SyncError::not_found(table, id))
    }

    /// Creates a row and returns its id.
    ///
    /// Tables with client-generated ids get a fresh uuid unless `obj`
    /// carries one; other tables take the next auto-increment key.
    pub fn add(&self, obj: Value) -> SyncResult<Value> {
        let Value::Object(mut map) = obj else {
            return Err(ProtocolError::invalid("obj", "must be an object").into());
        };
        let table = self.table_name();
        let id_field = self.descriptor.id_field().to_string();
        if self.descriptor.uuid() {
            map.entry(id_field.clone())
                .or_insert_with(|| Value::String(Uuid::new_v4().simple().to_string()));
        }
        self.commit(|txn, recorder| {
            let mut obj = Value::Object(map);
            let id = txn.add(table, obj.clone())?.to_value();
            if let Some(map) = obj.as_object_mut() {
                map.insert(id_field, id.clone());
            }
            recorder.record(txn, |b| b.created(table, id.clone(), obj))?;
            debug!(%table, %id, "row added");
            Ok(id)
        })
    }

    /// Applies `changes` to a row. Returns false, writing nothing, when the
    /// changes leave the row as it was.
    pub fn update(&self, id: &Value, changes: Value) -> SyncResult<bool> {
        let table = self.table_name();
        self.commit(|txn, recorder| {
            let old = self.require(txn, id)?;
            let mods = diff_mods(&old, &changes);
            if mods.is_empty() {
                return Ok(false);
            }
            let mut row = old.clone();
            apply_mods(&mut row, &mods);
            txn.put(table, row)?;
            recorder.record(txn, |b| b.updated(table, id.clone(), old, changes))?;
            Ok(true)
        })
    }

    /// Deletes a row. Returns false if it did not exist.
    pub fn delete(&self, id: &Value) -> SyncResult<bool> {
        let table = self.table_name();
        self.commit(|txn, recorder| {
            let key = row_key(table, id)?;
            let Some(old) = txn.get(table, &key)? else {
                return Ok(false);
            };
            txn.delete(table, &key)?;
            recorder.record(txn, |b| b.deleted(table, id.clone(), Some(old)))?;
            Ok(true)
        })
    }

    /// Moves a node to `position` relative to `target`; returns the moved row.
    pub fn move_node(&self, id: &Value, target: &Value, position: RelativePosition) -> SyncResult<Value> {
        let table = self.table_name();
        let tree = self.tree("move")?;
        self.commit(|txn, recorder| {
            let old = self.require(txn, id)?;
            let insert = tree.resolve_tree_insert(txn, table, target, position)?;
            let moved = tree
                .table_move(txn, table, id, &insert)?
                .ok_or_else(|| SyncError::not_found(table, id))?;
            recorder.record(txn, |b| {
                b.moved(table, id.clone(), target.clone(), position, insert.parent.clone(), Some(old))
            })?;
            Ok(moved)
        })
    }

    /// Copies a node to `position` relative to `target`, patched with
    /// `mods`; returns the copy.
    ///
    /// Only the copied node itself is materialised locally, flagged as
    /// still copying; the server copies the subtree.
    pub fn copy_node(
        &self,
        id: &Value,
        target: &Value,
        position: RelativePosition,
        mods: Value,
        excluded_descendants: Option<Value>,
    ) -> SyncResult<Value> {
        let table = self.table_name();
        let tree = self.tree("copy")?;
        let new_key = Value::String(Uuid::new_v4().simple().to_string());
        let patch = mods.as_object().cloned().unwrap_or_default();
        self.commit(|txn, recorder| {
            let insert = tree.resolve_tree_insert(txn, table, target, position)?;
            let copy = tree
                .table_copy(txn, table, id, &new_key, &patch, &insert)?
                .ok_or_else(|| SyncError::not_found(table, id))?;
            recorder.record(txn, |b| {
                b.copied(
                    table,
                    new_key.clone(),
                    CopySpec {
                        from_key: id.clone(),
                        mods,
                        target: target.clone(),
                        position,
                        excluded_descendants,
                        parent: insert.parent.clone(),
                    },
                )
            })?;
            Ok(copy)
        })
    }

    /// Applies `changes` to a node and, once synced, to all of its
    /// descendants. Local descendants see the patch on read until then.
    ///
    /// Client-local fields are dropped from the patch. Returns false,
    /// writing nothing, when no other field is left.
    pub fn update_descendants(&self, id: &Value, changes: Value) -> SyncResult<bool> {
        let table = self.table_name();
        self.tree("update descendants")?;
        let patch = self
            .ctx
            .build(|b| b.updated_descendants(table, id.clone(), changes))?;
        let ChangeKind::UpdatedDescendants { mods } = &patch.kind else {
            return Ok(false);
        };
        if patch.is_noop() {
            return Ok(false);
        }
        let changes = Value::Object(mods.clone());
        self.commit(|txn, recorder| {
            let mut row = self.require(txn, id)?;
            let mods = diff_mods(&row, &changes);
            apply_mods(&mut row, &mods);
            txn.put(table, row)?;
            recorder.save(txn, &patch)?;
            Ok(true)
        })
    }

    /// Requests publication of channel `id`.
    pub fn publish(&self, id: &Value, version_notes: &str, language: &str) -> SyncResult<()> {
        let table = self.table_name();
        self.commit(|txn, recorder| {
            recorder.record(txn, |b| b.published(table, id.clone(), version_notes, language))?;
            Ok(())
        })
    }

    /// Requests a refresh of channel `id` from its imported sources.
    pub fn sync_channel(&self, id: &Value, options: SyncOptions) -> SyncResult<()> {
        let table = self.table_name();
        self.commit(|txn, recorder| {
            recorder.record(txn, |b| b.synced(table, id.clone(), options))?;
            Ok(())
        })
    }

    /// Requests deployment of channel `id`'s staged tree.
    pub fn deploy(&self, id: &Value) -> SyncResult<()> {
        let table = self.table_name();
        self.commit(|txn, recorder| {
            recorder.record(txn, |b| b.deployed(table, id.clone()))?;
            Ok(())
        })
    }
}

fn matches_filters(row: &Value, filters: &serde_json::Map<String, Value>) -> bool {
    filters.iter().all(|(field, expected)| match field.strip_suffix(IN_SUFFIX) {
        Some(base) => expected
            .as_array()
            .is_some_and(|options| row.get(base).is_some_and(|v| options.contains(v))),
        None => row.get(field) == Some(expected),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::fetch::{now_millis, LAST_FETCH_FIELD};
    use crate::registry::{ResourceRegistry, CHANNEL, CONTENTNODE};
    use async_trait::async_trait;
    use curio_sync_protocol::ChangeType;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Fetcher that writes canned rows into the store.
    struct Server {
        ctx: SyncContext,
        rows: Vec<Value>,
        calls: Mutex<usize>,
        offline: bool,
    }

    #[async_trait]
    impl Fetcher for Server {
        async fn fetch_model(&self, table: &str, id: &Value) -> SyncResult<Option<Value>> {
            let rows = self.fetch_collection(table, &json!({})).await?;
            Ok(rows.into_iter().find(|r| r.get("id") == Some(id)))
        }

        async fn fetch_collection(&self, table: &str, _params: &Value) -> SyncResult<Vec<Value>> {
            *self.calls.lock() += 1;
            if self.offline {
                return Err(SyncError::transport_retryable("offline"));
            }
            let mut stored = Vec::new();
            for row in &self.rows {
                let mut row = row.clone();
                row[LAST_FETCH_FIELD] = json!(now_millis());
                self.ctx
                    .db()
                    .transaction(TransactionOptions::new(), |txn| txn.put(table, row.clone()))?;
                stored.push(row);
            }
            Ok(stored)
        }
    }

    fn context() -> SyncContext {
        let registry = Arc::new(ResourceRegistry::standard());
        let db = Arc::new(registry.open_in_memory().unwrap());
        SyncContext::new(db, registry, SyncConfig::default()).with_client_id("tab-a")
    }

    fn resource(ctx: &SyncContext, table: &str, fetcher: Option<Arc<dyn Fetcher>>) -> Resource {
        let descriptor = ctx.registry().get(table).cloned().unwrap();
        Resource::new(ctx.clone(), descriptor, fetcher)
    }

    fn logged(ctx: &SyncContext) -> Vec<Change> {
        ChangeLog::new(ctx.db().clone()).since(0).unwrap()
    }

    #[test]
    fn writes_are_logged_with_client_source() {
        let ctx = context();
        ctx.session().set_channel(Some("ch1".into()));
        let nodes = resource(&ctx, CONTENTNODE, None);

        let id = nodes.add(json!({"title": "a", "parent": "root", "lft": 1})).unwrap();
        assert!(nodes.update(&id, json!({"title": "b"})).unwrap());
        assert!(!nodes.update(&id, json!({"title": "b"})).unwrap());
        assert!(nodes.delete(&id).unwrap());
        assert!(!nodes.delete(&id).unwrap());

        let changes = logged(&ctx);
        let types: Vec<_> = changes.iter().map(Change::change_type).collect();
        assert_eq!(types, vec![ChangeType::Created, ChangeType::Updated, ChangeType::Deleted]);
        assert!(changes.iter().all(|c| c.source.as_deref() == Some("tab-a")));
        assert!(changes.iter().all(|c| c.channel_id.as_deref() == Some("ch1")));
        assert_eq!(changes[0].obj().unwrap()["id"], id);
    }

    #[test]
    fn where_supports_membership() {
        let ctx = context();
        let nodes = resource(&ctx, CONTENTNODE, None);
        for (id, parent) in [("a", "p1"), ("b", "p2"), ("c", "p3")] {
            nodes.add(json!({"id": id, "parent": parent, "lft": 1})).unwrap();
        }
        let rows = nodes.where_local(&json!({"parent__in": ["p1", "p3"]})).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("c")]);
        assert_eq!(nodes.where_local(&json!({"parent": "p2"})).unwrap().len(), 1);
        assert!(nodes.where_local(&json!([1])).is_err());
    }

    #[test]
    fn tree_operations_are_logged() {
        let ctx = context();
        let nodes = resource(&ctx, CONTENTNODE, None);
        nodes.add(json!({"id": "root", "parent": null, "lft": 1})).unwrap();
        nodes.add(json!({"id": "x", "parent": "root", "lft": 1})).unwrap();
        nodes.add(json!({"id": "y", "parent": "root", "lft": 2})).unwrap();

        let moved = nodes.move_node(&json!("x"), &json!("y"), RelativePosition::Right).unwrap();
        assert!(moved["lft"].as_f64().unwrap() > 2.0);

        let copy = nodes
            .copy_node(&json!("y"), &json!("root"), RelativePosition::LastChild, json!({"title": "copy"}), None)
            .unwrap();
        assert_eq!(copy["__COPYING"], json!(true));
        assert_eq!(copy["title"], json!("copy"));

        let changes = logged(&ctx);
        assert_eq!(changes[3].change_type(), ChangeType::Moved);
        assert_eq!(changes[4].change_type(), ChangeType::Copied);
        assert_eq!(changes[4].key, copy["id"]);
    }

    #[test]
    fn tree_operations_need_tree_hooks() {
        let ctx = context();
        let channels = resource(&ctx, CHANNEL, None);
        let err = channels
            .move_node(&json!("c"), &json!("d"), RelativePosition::FirstChild)
            .unwrap_err();
        assert!(matches!(err, SyncError::Unsupported { .. }));
    }

    #[test]
    fn descendants_inherit_pending_patch() {
        let ctx = context();
        let nodes = resource(&ctx, CONTENTNODE, None);
        nodes.add(json!({"id": "root", "parent": null, "lft": 1})).unwrap();
        nodes.add(json!({"id": "mid", "parent": "root", "lft": 1})).unwrap();
        nodes.add(json!({"id": "leaf", "parent": "mid", "lft": 1})).unwrap();

        assert!(nodes
            .update_descendants(&json!("root"), json!({"license": "CC BY"}))
            .unwrap());
        assert_eq!(nodes.get_local(&json!("root")).unwrap().unwrap()["license"], json!("CC BY"));
        assert_eq!(nodes.get_local(&json!("leaf")).unwrap().unwrap()["license"], json!("CC BY"));
        // Stored rows are untouched.
        let stored = ctx.db().get(CONTENTNODE, &"leaf".into()).unwrap().unwrap();
        assert!(stored.get("license").is_none());
    }

    #[test]
    fn descendant_patches_skip_local_fields() {
        let ctx = context();
        let nodes = resource(&ctx, CONTENTNODE, None);
        nodes.add(json!({"id": "root", "parent": null, "lft": 1})).unwrap();
        let before = logged(&ctx).len();

        assert!(!nodes
            .update_descendants(&json!("root"), json!({"__COPYING": true}))
            .unwrap());
        assert_eq!(logged(&ctx).len(), before);
        let root = ctx.db().get(CONTENTNODE, &"root".into()).unwrap().unwrap();
        assert!(root.get("__COPYING").is_none());

        assert!(nodes
            .update_descendants(&json!("root"), json!({"role": "coach", "__last_fetch": 9}))
            .unwrap());
        let log = logged(&ctx);
        assert_eq!(log.len(), before + 1);
        match &log[before].kind {
            ChangeKind::UpdatedDescendants { mods } => {
                assert_eq!(Value::Object(mods.clone()), json!({"role": "coach"}));
            }
            other => panic!("unexpected change {other:?}"),
        }
        let root = ctx.db().get(CONTENTNODE, &"root".into()).unwrap().unwrap();
        assert!(root.get("__last_fetch").is_none());
    }

    #[test]
    fn channel_operations_are_logged() {
        let ctx = context();
        let channels = resource(&ctx, CHANNEL, None);
        channels.publish(&json!("ch1"), "first", "en").unwrap();
        channels.sync_channel(&json!("ch1"), SyncOptions::default()).unwrap();
        channels.deploy(&json!("ch1")).unwrap();
        let types: Vec<_> = logged(&ctx).iter().map(Change::change_type).collect();
        assert_eq!(types, vec![ChangeType::Published, ChangeType::Synced, ChangeType::Deployed]);
    }

    #[tokio::test]
    async fn stale_reads_are_refreshed() {
        let ctx = context();
        let server = Arc::new(Server {
            ctx: ctx.clone(),
            rows: vec![json!({"id": "ch1", "name": "server"})],
            calls: Mutex::new(0),
            offline: false,
        });
        let fetcher: Arc<dyn Fetcher> = server.clone();
        let channels = resource(&ctx, CHANNEL, Some(fetcher));

        let row = channels.get(&json!("ch1")).await.unwrap().unwrap();
        assert_eq!(row["name"], json!("server"));
        // Fresh now: served locally.
        channels.get(&json!("ch1")).await.unwrap();
        assert_eq!(*server.calls.lock(), 1);
    }

    #[tokio::test]
    async fn offline_reads_fall_back_to_local_rows() {
        let ctx = context();
        let server = Arc::new(Server {
            ctx: ctx.clone(),
            rows: Vec::new(),
            calls: Mutex::new(0),
            offline: true,
        });
        let fetcher: Arc<dyn Fetcher> = server.clone();
        let channels = resource(&ctx, CHANNEL, Some(fetcher));
        channels.add(json!({"id": "mine", "name": "local"})).unwrap();

        let row = channels.get(&json!("mine")).await.unwrap().unwrap();
        assert_eq!(row["name"], json!("local"));
        let rows = channels.where_(&json!({"name": "local"})).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(*server.calls.lock(), 2);
    }

    #[tokio::test]
    async fn explicit_fetch_needs_a_fetcher() {
        let ctx = context();
        let channels = resource(&ctx, CHANNEL, None);
        assert!(matches!(
            channels.fetch_model(&json!("x")).await,
            Err(SyncError::Unsupported { .. })
        ));
    }
}
