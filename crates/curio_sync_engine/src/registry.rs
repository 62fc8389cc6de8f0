//! Resource descriptors.
//!
//! Every business entity is registered once, at startup, with a
//! [`ResourceDescriptor`]. The registry is immutable afterwards; it derives
//! the local table schemas and tells the change model which tables sync.

use crate::changes::log_schemas;
use crate::error::{SyncError, SyncResult};
use crate::tree::{ContentTree, TreeResource};
use curio_storage::{Database, Key, StoreError, StoreResult, TableSchema};
use curio_sync_protocol::TableCatalog;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Table of content nodes.
pub const CONTENTNODE: &str = "contentnode";

/// Table of channels.
pub const CHANNEL: &str = "channel";

/// Description of one synced entity.
#[derive(Clone)]
pub struct ResourceDescriptor {
    table_name: String,
    id_field: String,
    uuid: bool,
    index_fields: Vec<String>,
    syncable: bool,
    tree: Option<Arc<dyn TreeResource>>,
}

impl ResourceDescriptor {
    /// A syncable resource with client-generated `id` keys.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            id_field: "id".into(),
            uuid: true,
            index_fields: Vec::new(),
            syncable: true,
            tree: None,
        }
    }

    /// Sets the primary key field.
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    /// Chooses between client-generated ids (`true`) and auto-increment keys.
    pub fn with_uuid(mut self, uuid: bool) -> Self {
        self.uuid = uuid;
        self
    }

    /// Sets the fields that support equality queries.
    pub fn with_index_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Marks whether writes to this table are logged and synced.
    pub fn with_syncable(mut self, syncable: bool) -> Self {
        self.syncable = syncable;
        self
    }

    /// Attaches tree hooks.
    pub fn with_tree(mut self, tree: Arc<dyn TreeResource>) -> Self {
        self.tree = Some(tree);
        self
    }

    /// Table name.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Primary key field.
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// True if ids are generated on the client.
    pub fn uuid(&self) -> bool {
        self.uuid
    }

    /// Fields that support equality queries.
    pub fn index_fields(&self) -> &[String] {
        &self.index_fields
    }

    /// True if writes are logged and synced.
    pub fn syncable(&self) -> bool {
        self.syncable
    }

    /// Tree hooks, for hierarchical resources.
    pub fn tree(&self) -> Option<&Arc<dyn TreeResource>> {
        self.tree.as_ref()
    }

    /// Local table schema: the id field (`++` for auto-increment ids)
    /// followed by the index fields.
    pub fn schema(&self) -> StoreResult<TableSchema> {
        let mut definition = if self.uuid {
            self.id_field.clone()
        } else {
            format!("++{}", self.id_field)
        };
        for field in &self.index_fields {
            definition.push(',');
            definition.push_str(field);
        }
        TableSchema::parse(self.table_name.clone(), &definition)
    }
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("table_name", &self.table_name)
            .field("id_field", &self.id_field)
            .field("uuid", &self.uuid)
            .field("index_fields", &self.index_fields)
            .field("syncable", &self.syncable)
            .field("tree", &self.tree.is_some())
            .finish()
    }
}

/// Every registered resource, keyed by table name.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    resources: BTreeMap<String, ResourceDescriptor>,
}

impl ResourceRegistry {
    /// Builds a registry.
    ///
    /// # Errors
    ///
    /// Fails if two descriptors share a table name.
    pub fn new<I>(descriptors: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = ResourceDescriptor>,
    {
        let mut resources = BTreeMap::new();
        for descriptor in descriptors {
            let name = descriptor.table_name.clone();
            if resources.insert(name.clone(), descriptor).is_some() {
                return Err(SyncError::Config(format!("resource {name} registered twice")));
            }
        }
        Ok(Self { resources })
    }

    /// The channel and content node resources.
    pub fn standard() -> Self {
        let channel = ResourceDescriptor::new(CHANNEL).with_index_fields(["name"]);
        let contentnode = ResourceDescriptor::new(CONTENTNODE)
            .with_index_fields(["parent", "channel_id"])
            .with_tree(Arc::new(ContentTree::default()));
        Self {
            resources: [channel, contentnode]
                .into_iter()
                .map(|d| (d.table_name.clone(), d))
                .collect(),
        }
    }

    /// Descriptor of `table`.
    pub fn get(&self, table: &str) -> Option<&ResourceDescriptor> {
        self.resources.get(table)
    }

    /// Descriptor of `table`, or an error naming it.
    pub fn descriptor(&self, table: &str) -> SyncResult<&ResourceDescriptor> {
        self.get(table)
            .ok_or_else(|| SyncError::Config(format!("no resource registered for table {table}")))
    }

    /// Registered table names.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Schemas of every resource table plus the change log tables.
    pub fn schemas(&self) -> StoreResult<Vec<TableSchema>> {
        let mut schemas = log_schemas()?;
        for descriptor in self.resources.values() {
            schemas.push(descriptor.schema()?);
        }
        Ok(schemas)
    }

    /// Opens a volatile store with every registered table.
    pub fn open_in_memory(&self) -> SyncResult<Database> {
        Ok(Database::open_in_memory(self.schemas()?)?)
    }

    /// Opens a durable store with every registered table.
    pub fn open_path(&self, path: &Path) -> SyncResult<Database> {
        Ok(Database::open_path(path, self.schemas()?)?)
    }
}

impl TableCatalog for ResourceRegistry {
    fn is_syncable(&self, table: &str) -> bool {
        self.get(table).is_some_and(ResourceDescriptor::syncable)
    }
}

/// Converts a JSON key into a store key.
pub(crate) fn row_key(table: &str, key: &Value) -> StoreResult<Key> {
    Key::from_value(key).ok_or_else(|| StoreError::invalid_key(table, format!("{key} is not a valid key")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::CHANGES_TABLE;

    #[test]
    fn schema_follows_id_policy() {
        let uuid = ResourceDescriptor::new("channel").with_index_fields(["name"]);
        let schema = uuid.schema().unwrap();
        assert!(!schema.auto_increment());
        assert!(schema.is_indexed("name"));

        let auto = ResourceDescriptor::new("invitation").with_uuid(false);
        assert!(auto.schema().unwrap().auto_increment());
    }

    #[test]
    fn catalog_honours_syncable_flag() {
        let registry = ResourceRegistry::new([
            ResourceDescriptor::new("channel"),
            ResourceDescriptor::new("session").with_syncable(false),
        ])
        .unwrap();
        assert!(registry.is_syncable("channel"));
        assert!(!registry.is_syncable("session"));
        assert!(!registry.is_syncable("unknown"));
    }

    #[test]
    fn duplicate_tables_rejected() {
        let result = ResourceRegistry::new([ResourceDescriptor::new("a"), ResourceDescriptor::new("a")]);
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn standard_registry_opens_with_log_tables() {
        let registry = ResourceRegistry::standard();
        assert!(registry.get(CONTENTNODE).and_then(ResourceDescriptor::tree).is_some());
        let db = registry.open_in_memory().unwrap();
        assert!(db.schema(CHANGES_TABLE).is_some());
        assert!(db.schema(CHANNEL).is_some());
    }

    #[test]
    fn row_keys_from_json() {
        assert_eq!(row_key("t", &serde_json::json!(4)).unwrap(), Key::Int(4));
        assert!(row_key("t", &Value::Null).is_err());
    }
}
