//! Typed change records.
//!
//! A [`Change`] describes one logical mutation of one row. Changes are built
//! through a [`ChangeBuilder`], which validates every field up front, and
//! are persisted through their log-entry projection ([`Change::to_entry`]).
//! What goes over the wire is a narrower projection ([`Change::to_wire`]).

use crate::error::{ProtocolError, ProtocolResult};
use crate::mods::{diff_mods, Mods, EXCLUDED_FIELDS};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeType {
    /// A row was created.
    Created,
    /// Fields of a row were modified.
    Updated,
    /// A row was deleted.
    Deleted,
    /// A tree node was moved.
    Moved,
    /// A tree node was copied.
    Copied,
    /// A channel was published.
    Published,
    /// A channel was synced with its imported sources.
    Synced,
    /// A channel's staged tree was deployed.
    Deployed,
    /// A patch applying to every descendant of a tree node.
    UpdatedDescendants,
}

impl ChangeType {
    /// Numeric code used in log entries and on the wire.
    #[must_use]
    pub const fn to_code(self) -> u64 {
        match self {
            Self::Created => 1,
            Self::Updated => 2,
            Self::Deleted => 3,
            Self::Moved => 4,
            Self::Copied => 5,
            Self::Published => 6,
            Self::Synced => 7,
            Self::Deployed => 8,
            Self::UpdatedDescendants => 9,
        }
    }

    /// Converts from a numeric code.
    #[must_use]
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => Self::Created,
            2 => Self::Updated,
            3 => Self::Deleted,
            4 => Self::Moved,
            5 => Self::Copied,
            6 => Self::Published,
            7 => Self::Synced,
            8 => Self::Deployed,
            9 => Self::UpdatedDescendants,
            _ => return None,
        })
    }

    /// Only created, updated and deleted changes describe cumulative row
    /// state and may be coalesced.
    #[must_use]
    pub const fn is_mergeable(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }
}

/// Where a moved or copied node lands relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelativePosition {
    /// First child of the target.
    FirstChild,
    /// Last child of the target.
    LastChild,
    /// Sibling immediately before the target.
    Left,
    /// Sibling immediately after the target.
    Right,
}

impl RelativePosition {
    /// Wire name of the position.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FirstChild => "first-child",
            Self::LastChild => "last-child",
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

impl fmt::Display for RelativePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelativePosition {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-child" => Ok(Self::FirstChild),
            "last-child" => Ok(Self::LastChild),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(ProtocolError::invalid(
                "position",
                format!("'{other}' is not one of first-child, last-child, left, right"),
            )),
        }
    }
}

/// Options carried by a [`ChangeType::Synced`] change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Refresh titles and descriptions.
    pub titles_and_descriptions: bool,
    /// Refresh resource details.
    pub resource_details: bool,
    /// Refresh files.
    pub files: bool,
    /// Refresh assessment items.
    pub assessment_items: bool,
}

/// Arguments of a copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CopySpec {
    /// Id of the node being copied.
    pub from_key: Value,
    /// Patch applied to the new copy.
    pub mods: Value,
    /// Node the copy is placed relative to.
    pub target: Value,
    /// Placement relative to `target`.
    pub position: RelativePosition,
    /// Descendants left out of the copy, if any.
    pub excluded_descendants: Option<Value>,
    /// Parent of the copy.
    pub parent: Value,
}

/// Variant-specific payload of a change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    /// Row created with the full object.
    Created {
        /// The new row.
        obj: Value,
    },
    /// Row modified.
    Updated {
        /// Key-path patch.
        mods: Mods,
        /// Row before the update.
        old_obj: Option<Value>,
        /// Row after the update.
        obj: Option<Value>,
    },
    /// Row deleted.
    Deleted {
        /// Row before the delete.
        old_obj: Option<Value>,
    },
    /// Node moved.
    Moved {
        /// Node the move is relative to.
        target: Value,
        /// Placement relative to `target`.
        position: RelativePosition,
        /// New parent.
        parent: Value,
        /// Node before the move.
        old_obj: Option<Value>,
    },
    /// Node copied. The change's key is the id of the copy.
    Copied {
        /// Id of the node being copied.
        from_key: Value,
        /// Patch applied to the copy.
        mods: Mods,
        /// Node the copy is placed relative to.
        target: Value,
        /// Placement relative to `target`.
        position: RelativePosition,
        /// Descendants left out of the copy.
        excluded_descendants: Option<Value>,
        /// Parent of the copy.
        parent: Value,
    },
    /// Channel published.
    Published {
        /// Release notes.
        version_notes: String,
        /// Language of the published version.
        language: String,
    },
    /// Channel synced.
    Synced(SyncOptions),
    /// Channel deployed.
    Deployed,
    /// Patch inherited by every descendant.
    UpdatedDescendants {
        /// Key-path patch.
        mods: Mods,
    },
}

impl ChangeKind {
    /// The change type of this payload.
    #[must_use]
    pub fn change_type(&self) -> ChangeType {
        match self {
            Self::Created { .. } => ChangeType::Created,
            Self::Updated { .. } => ChangeType::Updated,
            Self::Deleted { .. } => ChangeType::Deleted,
            Self::Moved { .. } => ChangeType::Moved,
            Self::Copied { .. } => ChangeType::Copied,
            Self::Published { .. } => ChangeType::Published,
            Self::Synced(_) => ChangeType::Synced,
            Self::Deployed => ChangeType::Deployed,
            Self::UpdatedDescendants { .. } => ChangeType::UpdatedDescendants,
        }
    }
}

/// A change record.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Local revision, assigned when the change is saved.
    pub rev: Option<i64>,
    /// Revision assigned by the server once it accepted the change.
    pub server_rev: Option<i64>,
    /// Table of the affected row.
    pub table: String,
    /// Primary key of the affected row.
    pub key: Value,
    /// Channel the change is scoped to.
    pub channel_id: Option<String>,
    /// Writer that produced the change.
    pub source: Option<String>,
    /// Rejected by the server as not permitted.
    pub disallowed: bool,
    /// Rejected by the server with errors.
    pub errored: bool,
    /// Error details reported by the server.
    pub errors: Vec<Value>,
    /// Variant payload.
    pub kind: ChangeKind,
}

/// Tables that accept changes.
pub trait TableCatalog {
    /// Returns true if changes to `table` are synced.
    fn is_syncable(&self, table: &str) -> bool;
}

impl TableCatalog for BTreeSet<String> {
    fn is_syncable(&self, table: &str) -> bool {
        self.contains(table)
    }
}

impl<const N: usize> TableCatalog for [&str; N] {
    fn is_syncable(&self, table: &str) -> bool {
        self.contains(&table)
    }
}

/// Builds validated changes.
///
/// The builder carries the session's channel scope and the writer's source
/// so callers never supply them per change.
///
/// ```rust
/// use curio_sync_protocol::{ChangeBuilder, ChangeType};
/// use serde_json::json;
///
/// let tables = ["contentnode"];
/// let builder = ChangeBuilder::new(&tables).with_channel("ch1").with_source("tab-1");
/// let change = builder
///     .updated("contentnode", json!("n1"), json!({"title": "a"}), json!({"title": "b"}))
///     .unwrap();
/// assert_eq!(change.change_type(), ChangeType::Updated);
/// assert_eq!(change.channel_id.as_deref(), Some("ch1"));
/// ```
#[derive(Clone, Copy)]
pub struct ChangeBuilder<'a> {
    catalog: &'a dyn TableCatalog,
    channel_id: Option<&'a str>,
    source: Option<&'a str>,
}

impl<'a> ChangeBuilder<'a> {
    /// Creates a builder validating tables against `catalog`.
    pub fn new(catalog: &'a dyn TableCatalog) -> Self {
        Self {
            catalog,
            channel_id: None,
            source: None,
        }
    }

    /// Scopes built changes to `channel_id`.
    #[must_use]
    pub fn with_channel(mut self, channel_id: &'a str) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    /// Scopes built changes to an optional channel.
    #[must_use]
    pub fn with_channel_opt(mut self, channel_id: Option<&'a str>) -> Self {
        self.channel_id = channel_id;
        self
    }

    /// Tags built changes with `source`.
    #[must_use]
    pub fn with_source(mut self, source: &'a str) -> Self {
        self.source = Some(source);
        self
    }

    fn build(&self, table: &str, key: Value, kind: ChangeKind) -> ProtocolResult<Change> {
        if !self.catalog.is_syncable(table) {
            return Err(ProtocolError::UnknownTable(table.to_string()));
        }
        if key.is_null() {
            return Err(ProtocolError::missing("key"));
        }
        Ok(Change {
            rev: None,
            server_rev: None,
            table: table.to_string(),
            key,
            channel_id: self.channel_id.map(str::to_string),
            source: self.source.map(str::to_string),
            disallowed: false,
            errored: false,
            errors: Vec::new(),
            kind,
        })
    }

    /// A created row.
    pub fn created(&self, table: &str, key: Value, obj: Value) -> ProtocolResult<Change> {
        let obj = require_object("obj", obj)?;
        self.build(table, key, ChangeKind::Created { obj })
    }

    /// An update, with mods computed by diffing `changes` against `old_obj`.
    ///
    /// The resulting change is a no-op ([`Change::is_noop`]) when only
    /// client-local fields differ.
    pub fn updated(
        &self,
        table: &str,
        key: Value,
        old_obj: Value,
        changes: Value,
    ) -> ProtocolResult<Change> {
        let old_obj = require_object("oldObj", old_obj)?;
        let changes = require_object("changes", changes)?;
        let mods = diff_mods(&old_obj, &changes);
        let mut obj = old_obj.clone();
        if let (Some(target), Some(source)) = (obj.as_object_mut(), changes.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        self.build(
            table,
            key,
            ChangeKind::Updated {
                mods,
                old_obj: Some(old_obj),
                obj: Some(obj),
            },
        )
    }

    /// A deleted row.
    pub fn deleted(&self, table: &str, key: Value, old_obj: Option<Value>) -> ProtocolResult<Change> {
        let old_obj = old_obj.map(|o| require_object("oldObj", o)).transpose()?;
        self.build(table, key, ChangeKind::Deleted { old_obj })
    }

    /// A moved node.
    pub fn moved(
        &self,
        table: &str,
        key: Value,
        target: Value,
        position: RelativePosition,
        parent: Value,
        old_obj: Option<Value>,
    ) -> ProtocolResult<Change> {
        let target = require_present("target", target)?;
        let parent = require_present("parent", parent)?;
        let old_obj = old_obj.map(|o| require_object("oldObj", o)).transpose()?;
        self.build(
            table,
            key,
            ChangeKind::Moved {
                target,
                position,
                parent,
                old_obj,
            },
        )
    }

    /// A copied node; `key` is the id the copy materialises as.
    pub fn copied(&self, table: &str, key: Value, spec: CopySpec) -> ProtocolResult<Change> {
        let from_key = require_present("from_key", spec.from_key)?;
        let mods = match require_object("mods", spec.mods)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let target = require_present("target", spec.target)?;
        let parent = require_present("parent", spec.parent)?;
        let excluded_descendants = match spec.excluded_descendants {
            None | Some(Value::Null) => None,
            Some(v @ Value::Object(_)) => Some(v),
            Some(_) => {
                return Err(ProtocolError::invalid(
                    "excluded_descendants",
                    "must be null or an object",
                ))
            }
        };
        self.build(
            table,
            key,
            ChangeKind::Copied {
                from_key,
                mods,
                target,
                position: spec.position,
                excluded_descendants,
                parent,
            },
        )
    }

    /// A published channel. The change is scoped to its own key.
    pub fn published(
        &self,
        table: &str,
        key: Value,
        version_notes: impl Into<String>,
        language: impl Into<String>,
    ) -> ProtocolResult<Change> {
        let version_notes = version_notes.into();
        if version_notes.is_empty() {
            return Err(ProtocolError::missing("version_notes"));
        }
        let language = language.into();
        if language.is_empty() {
            return Err(ProtocolError::missing("language"));
        }
        let mut change = self.build(
            table,
            key,
            ChangeKind::Published {
                version_notes,
                language,
            },
        )?;
        change.channel_id = change.key.as_str().map(str::to_string);
        Ok(change)
    }

    /// A synced channel.
    pub fn synced(&self, table: &str, key: Value, options: SyncOptions) -> ProtocolResult<Change> {
        self.build(table, key, ChangeKind::Synced(options))
    }

    /// A deployed channel.
    pub fn deployed(&self, table: &str, key: Value) -> ProtocolResult<Change> {
        self.build(table, key, ChangeKind::Deployed)
    }

    /// A patch inherited by every descendant of `key`.
    ///
    /// Client-local fields are dropped from the patch; a patch left empty
    /// makes the change a no-op.
    pub fn updated_descendants(&self, table: &str, key: Value, changes: Value) -> ProtocolResult<Change> {
        let mut mods = match require_object("changes", changes)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        mods.retain(|field, _| !EXCLUDED_FIELDS.contains(&field.as_str()));
        self.build(table, key, ChangeKind::UpdatedDescendants { mods })
    }
}

fn require_object(field: &str, value: Value) -> ProtocolResult<Value> {
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Err(ProtocolError::missing(field)),
        _ => Err(ProtocolError::invalid(field, "must be an object")),
    }
}

fn require_present(field: &str, value: Value) -> ProtocolResult<Value> {
    if value.is_null() {
        Err(ProtocolError::missing(field))
    } else {
        Ok(value)
    }
}

impl Change {
    /// The change type.
    #[must_use]
    pub fn change_type(&self) -> ChangeType {
        self.kind.change_type()
    }

    /// True for an update or descendant patch whose mods are empty; such
    /// changes are never saved.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        match &self.kind {
            ChangeKind::Updated { mods, .. } | ChangeKind::UpdatedDescendants { mods } => mods.is_empty(),
            _ => false,
        }
    }

    /// True if the server rejected the change in any way.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.disallowed || self.errored || !self.errors.is_empty()
    }

    /// Row after the change, for changes that carry one.
    #[must_use]
    pub fn obj(&self) -> Option<&Value> {
        match &self.kind {
            ChangeKind::Created { obj } => Some(obj),
            ChangeKind::Updated { obj, .. } => obj.as_ref(),
            _ => None,
        }
    }

    /// Row before the change, for changes that carry one.
    #[must_use]
    pub fn old_obj(&self) -> Option<&Value> {
        match &self.kind {
            ChangeKind::Updated { old_obj, .. }
            | ChangeKind::Deleted { old_obj }
            | ChangeKind::Moved { old_obj, .. } => old_obj.as_ref(),
            _ => None,
        }
    }

    /// The persisted projection: the variant's fields plus the common ones.
    #[must_use]
    pub fn to_entry(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("type".into(), json!(self.change_type().to_code()));
        entry.insert("table".into(), json!(self.table));
        entry.insert("key".into(), self.key.clone());
        entry.insert("channel_id".into(), json!(self.channel_id));
        if let Some(rev) = self.rev {
            entry.insert("rev".into(), json!(rev));
        }
        if let Some(source) = &self.source {
            entry.insert("source".into(), json!(source));
        }
        self.write_fields(&mut entry, true);
        if let Some(server_rev) = self.server_rev {
            entry.insert("server_rev".into(), json!(server_rev));
        }
        if self.disallowed {
            entry.insert("disallowed".into(), json!(true));
        }
        if self.errored {
            entry.insert("errored".into(), json!(true));
        }
        if !self.errors.is_empty() {
            entry.insert("errors".into(), Value::Array(self.errors.clone()));
        }
        Value::Object(entry)
    }

    /// The wire projection sent to the server.
    ///
    /// Created changes carry `obj`, updates carry `mods`, deletes carry only
    /// the address. Other types carry their own fields. Every change keeps
    /// `rev` and `channel_id` because the server answers per rev.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let mut wire = Map::new();
        wire.insert("type".into(), json!(self.change_type().to_code()));
        wire.insert("key".into(), self.key.clone());
        wire.insert("table".into(), json!(self.table));
        wire.insert("rev".into(), json!(self.rev));
        wire.insert("channel_id".into(), json!(self.channel_id));
        match &self.kind {
            ChangeKind::Created { obj } => {
                wire.insert("obj".into(), obj.clone());
            }
            ChangeKind::Updated { mods, .. } => {
                wire.insert("mods".into(), Value::Object(mods.clone()));
            }
            ChangeKind::Deleted { .. } => {}
            _ => self.write_fields(&mut wire, false),
        }
        Value::Object(wire)
    }

    fn write_fields(&self, out: &mut Map<String, Value>, with_snapshots: bool) {
        match &self.kind {
            ChangeKind::Created { obj } => {
                out.insert("obj".into(), obj.clone());
            }
            ChangeKind::Updated { mods, old_obj, obj } => {
                out.insert("mods".into(), Value::Object(mods.clone()));
                if with_snapshots {
                    if let Some(old) = old_obj {
                        out.insert("oldObj".into(), old.clone());
                    }
                    if let Some(obj) = obj {
                        out.insert("obj".into(), obj.clone());
                    }
                }
            }
            ChangeKind::Deleted { old_obj } => {
                if let (true, Some(old)) = (with_snapshots, old_obj) {
                    out.insert("oldObj".into(), old.clone());
                }
            }
            ChangeKind::Moved {
                target,
                position,
                parent,
                old_obj,
            } => {
                out.insert("target".into(), target.clone());
                out.insert("position".into(), json!(position.as_str()));
                out.insert("parent".into(), parent.clone());
                if let (true, Some(old)) = (with_snapshots, old_obj) {
                    out.insert("oldObj".into(), old.clone());
                }
            }
            ChangeKind::Copied {
                from_key,
                mods,
                target,
                position,
                excluded_descendants,
                parent,
            } => {
                out.insert("from_key".into(), from_key.clone());
                out.insert("mods".into(), Value::Object(mods.clone()));
                out.insert("target".into(), target.clone());
                out.insert("position".into(), json!(position.as_str()));
                out.insert(
                    "excluded_descendants".into(),
                    excluded_descendants.clone().unwrap_or(Value::Null),
                );
                out.insert("parent".into(), parent.clone());
            }
            ChangeKind::Published {
                version_notes,
                language,
            } => {
                out.insert("version_notes".into(), json!(version_notes));
                out.insert("language".into(), json!(language));
            }
            ChangeKind::Synced(options) => {
                out.insert(
                    "titles_and_descriptions".into(),
                    json!(options.titles_and_descriptions),
                );
                out.insert("resource_details".into(), json!(options.resource_details));
                out.insert("files".into(), json!(options.files));
                out.insert("assessment_items".into(), json!(options.assessment_items));
            }
            ChangeKind::Deployed => {}
            ChangeKind::UpdatedDescendants { mods } => {
                out.insert("mods".into(), Value::Object(mods.clone()));
            }
        }
    }

    /// Reads a change back from a log entry or a server-returned change.
    ///
    /// Decoding is lenient about optional fields so changes produced by the
    /// server decode as well as locally saved ones.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownChangeType`] for unrecognised type codes, which
    /// callers skip; other errors for structurally broken entries.
    pub fn from_entry(entry: &Value) -> ProtocolResult<Self> {
        let get = |field: &str| entry.get(field).filter(|v| !v.is_null());
        let code = get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::missing("type"))?;
        let change_type = ChangeType::from_code(code).ok_or(ProtocolError::UnknownChangeType(code))?;
        let table = get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::missing("table"))?
            .to_string();
        let key = get("key").cloned().ok_or_else(|| ProtocolError::missing("key"))?;

        let object = |field: &str| get(field).filter(|v| v.is_object()).cloned();
        let mods = |field: &str| {
            get(field)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };
        let required = |field: &str| get(field).cloned().ok_or_else(|| ProtocolError::missing(field));
        let position = || -> ProtocolResult<RelativePosition> {
            get("position")
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::missing("position"))?
                .parse()
        };
        let flag = |field: &str| get(field).and_then(Value::as_bool).unwrap_or(false);
        let text = |field: &str| get(field).and_then(Value::as_str).unwrap_or_default().to_string();

        let kind = match change_type {
            ChangeType::Created => ChangeKind::Created {
                obj: object("obj").ok_or_else(|| ProtocolError::missing("obj"))?,
            },
            ChangeType::Updated => ChangeKind::Updated {
                mods: mods("mods"),
                old_obj: object("oldObj"),
                obj: object("obj"),
            },
            ChangeType::Deleted => ChangeKind::Deleted {
                old_obj: object("oldObj"),
            },
            ChangeType::Moved => ChangeKind::Moved {
                target: required("target")?,
                position: position()?,
                parent: get("parent").cloned().unwrap_or(Value::Null),
                old_obj: object("oldObj"),
            },
            ChangeType::Copied => ChangeKind::Copied {
                from_key: required("from_key")?,
                mods: mods("mods"),
                target: required("target")?,
                position: position()?,
                excluded_descendants: object("excluded_descendants"),
                parent: get("parent").cloned().unwrap_or(Value::Null),
            },
            ChangeType::Published => ChangeKind::Published {
                version_notes: text("version_notes"),
                language: text("language"),
            },
            ChangeType::Synced => ChangeKind::Synced(SyncOptions {
                titles_and_descriptions: flag("titles_and_descriptions"),
                resource_details: flag("resource_details"),
                files: flag("files"),
                assessment_items: flag("assessment_items"),
            }),
            ChangeType::Deployed => ChangeKind::Deployed,
            ChangeType::UpdatedDescendants => ChangeKind::UpdatedDescendants { mods: mods("mods") },
        };

        Ok(Self {
            rev: get("rev").and_then(Value::as_i64),
            server_rev: get("server_rev").and_then(Value::as_i64),
            table,
            key,
            channel_id: get("channel_id").and_then(Value::as_str).map(str::to_string),
            source: get("source").and_then(Value::as_str).map(str::to_string),
            disallowed: flag("disallowed"),
            errored: flag("errored"),
            errors: get("errors")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            kind,
        })
    }

    /// Grouping key of the affected row, `table` plus the key's JSON text.
    #[must_use]
    pub fn row_id(&self) -> (String, String) {
        (self.table.clone(), self.key.to_string())
    }
}
