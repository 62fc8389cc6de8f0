//! Tree hooks for hierarchical resources.
//!
//! A [`TreeResource`] knows how rows of its table hang together. The apply
//! engine and the resource facade use it to turn `(target, position)` into
//! a concrete parent and sibling order, and to move or copy nodes.

use crate::error::{SyncError, SyncResult};
use crate::registry::row_key;
use curio_storage::Transaction;
use curio_sync_protocol::{apply_mods, Mods, ProtocolError, RelativePosition};
use serde_json::{json, Value};

/// Concrete placement of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeInsert {
    /// Parent the node hangs under.
    pub parent: Value,
    /// Sort value among its siblings.
    pub lft: f64,
}

/// Tree operations of a hierarchical table.
pub trait TreeResource: Send + Sync {
    /// Resolves where a node placed at `position` relative to `target` goes.
    fn resolve_tree_insert(
        &self,
        txn: &Transaction<'_>,
        table: &str,
        target: &Value,
        position: RelativePosition,
    ) -> SyncResult<TreeInsert>;

    /// Moves `key` to `insert`. Returns the moved row, `None` if it is not
    /// stored locally.
    fn table_move(
        &self,
        txn: &mut Transaction<'_>,
        table: &str,
        key: &Value,
        insert: &TreeInsert,
    ) -> SyncResult<Option<Value>>;

    /// Copies `from_key` to a new node `new_key` at `insert`, patched with
    /// `mods`. Returns the copy, `None` if the source is not stored locally.
    fn table_copy(
        &self,
        txn: &mut Transaction<'_>,
        table: &str,
        from_key: &Value,
        new_key: &Value,
        mods: &Mods,
        insert: &TreeInsert,
    ) -> SyncResult<Option<Value>>;

    /// Parent of `row`, `None` for a root.
    fn parent_key(&self, row: &Value) -> Option<Value>;

    /// Keys of every stored ancestor of `key`, nearest first.
    fn ancestors(&self, txn: &Transaction<'_>, table: &str, key: &Value) -> SyncResult<Vec<Value>> {
        let mut chain = Vec::new();
        let mut cursor = match txn.get(table, &row_key(table, key)?)? {
            Some(row) => self.parent_key(&row),
            None => return Ok(chain),
        };
        while let Some(parent) = cursor {
            if &parent == key || chain.contains(&parent) {
                break;
            }
            cursor = txn
                .get(table, &row_key(table, &parent)?)?
                .and_then(|row| self.parent_key(&row));
            chain.push(parent);
        }
        Ok(chain)
    }
}

/// Tree of content nodes ordered by a `lft` value among siblings.
#[derive(Debug, Clone)]
pub struct ContentTree {
    id_field: String,
}

const PARENT: &str = "parent";
const LFT: &str = "lft";
const COPYING: &str = "__COPYING";

impl ContentTree {
    /// Creates a tree whose rows are keyed by `id_field`.
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
        }
    }

    fn lft(row: &Value) -> f64 {
        row.get(LFT).and_then(Value::as_f64).unwrap_or(0.0)
    }

    fn children(&self, txn: &Transaction<'_>, table: &str, parent: &Value) -> SyncResult<Vec<Value>> {
        let mut rows: Vec<Value> = txn
            .filter(table, |row| row.get(PARENT) == Some(parent))?
            .into_iter()
            .map(|(_, row)| row)
            .collect();
        rows.sort_by(|a, b| Self::lft(a).total_cmp(&Self::lft(b)));
        Ok(rows)
    }

    fn require(&self, txn: &Transaction<'_>, table: &str, key: &Value) -> SyncResult<Value> {
        txn.get(table, &row_key(table, key)?)?
            .ok_or_else(|| SyncError::not_found(table, key))
    }

    fn place(&self, row: &mut Value, insert: &TreeInsert) {
        if let Some(map) = row.as_object_mut() {
            map.insert(PARENT.into(), insert.parent.clone());
            map.insert(LFT.into(), json!(insert.lft));
        }
    }
}

impl Default for ContentTree {
    fn default() -> Self {
        Self::new("id")
    }
}

impl TreeResource for ContentTree {
    fn resolve_tree_insert(
        &self,
        txn: &Transaction<'_>,
        table: &str,
        target: &Value,
        position: RelativePosition,
    ) -> SyncResult<TreeInsert> {
        let target_row = self.require(txn, table, target)?;
        match position {
            RelativePosition::FirstChild | RelativePosition::LastChild => {
                let siblings = self.children(txn, table, target)?;
                let lft = match (position, siblings.first(), siblings.last()) {
                    (RelativePosition::FirstChild, Some(first), _) => Self::lft(first) - 1.0,
                    (_, _, Some(last)) => Self::lft(last) + 1.0,
                    _ => 1.0,
                };
                Ok(TreeInsert {
                    parent: target.clone(),
                    lft,
                })
            }
            RelativePosition::Left | RelativePosition::Right => {
                let parent = self.parent_key(&target_row).ok_or_else(|| {
                    ProtocolError::invalid("target", "a root node has no siblings")
                })?;
                let siblings = self.children(txn, table, &parent)?;
                let index = siblings
                    .iter()
                    .position(|row| row.get(self.id_field.as_str()) == Some(target))
                    .unwrap_or(0);
                let here = Self::lft(&target_row);
                let lft = if position == RelativePosition::Left {
                    let before = index
                        .checked_sub(1)
                        .and_then(|i| siblings.get(i))
                        .map_or(here - 1.0, Self::lft);
                    (before + here) / 2.0
                } else {
                    let after = siblings.get(index + 1).map_or(here + 1.0, Self::lft);
                    (here + after) / 2.0
                };
                Ok(TreeInsert { parent, lft })
            }
        }
    }

    fn table_move(
        &self,
        txn: &mut Transaction<'_>,
        table: &str,
        key: &Value,
        insert: &TreeInsert,
    ) -> SyncResult<Option<Value>> {
        let row_id = row_key(table, key)?;
        let Some(mut row) = txn.get(table, &row_id)? else {
            return Ok(None);
        };
        if &insert.parent == key || self.ancestors(txn, table, &insert.parent)?.contains(key) {
            return Err(ProtocolError::invalid("target", "cannot move a node into its own subtree").into());
        }
        self.place(&mut row, insert);
        txn.put(table, row.clone())?;
        Ok(Some(row))
    }

    fn table_copy(
        &self,
        txn: &mut Transaction<'_>,
        table: &str,
        from_key: &Value,
        new_key: &Value,
        mods: &Mods,
        insert: &TreeInsert,
    ) -> SyncResult<Option<Value>> {
        let Some(mut row) = txn.get(table, &row_key(table, from_key)?)? else {
            return Ok(None);
        };
        apply_mods(&mut row, mods);
        self.place(&mut row, insert);
        if let Some(map) = row.as_object_mut() {
            map.insert(self.id_field.clone(), new_key.clone());
            // Descendants materialise once the server finishes the copy.
            map.insert(COPYING.into(), Value::Bool(true));
        }
        txn.put(table, row.clone())?;
        Ok(Some(row))
    }

    fn parent_key(&self, row: &Value) -> Option<Value> {
        row.get(PARENT).filter(|p| !p.is_null()).cloned()
    }
}
