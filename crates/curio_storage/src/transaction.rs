//! Transactions over the table store.

use crate::error::{AbortReason, StoreError, StoreResult};
use crate::key::Key;
use crate::schema::{KeyPath, TableSchema};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Committed rows of every table plus the auto-increment counters.
#[derive(Debug, Default, Clone)]
pub(crate) struct StoreState {
    pub tables: BTreeMap<String, BTreeMap<Key, Value>>,
    pub counters: BTreeMap<String, i64>,
    pub sequence: u64,
}

/// Options for opening a write transaction.
///
/// ```rust,ignore
/// let options = TransactionOptions::new()
///     .with_tables(["contentnode", "__changesForSyncing"])
///     .with_source("tab-1");
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    tables: BTreeSet<String>,
    source: Option<String>,
}

impl TransactionOptions {
    /// Unscoped transaction without a source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the transaction to `tables`.
    #[must_use]
    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.extend(tables.into_iter().map(Into::into));
        self
    }

    /// Tags every write of the transaction with `source`.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Source tag, if any.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub(crate) fn into_parts(self) -> (BTreeSet<String>, Option<String>) {
        (self.tables, self.source)
    }
}

/// Result of a transaction that may have been reverted by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome<T> {
    /// The closure returned `Ok` and its writes were committed.
    Applied(T),
    /// The closure aborted with [`AbortReason::Revert`]; nothing was written.
    Reverted,
}

impl<T> TxnOutcome<T> {
    /// True for [`TxnOutcome::Reverted`].
    #[must_use]
    pub fn is_reverted(&self) -> bool {
        matches!(self, Self::Reverted)
    }

    /// The applied value, if any.
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Reverted => None,
        }
    }
}

/// A transaction handle passed to [`crate::Database::transaction`] and
/// [`crate::Database::read`].
///
/// Writes are staged and visible to this transaction's own reads. They reach
/// the store only if the closure returns `Ok`.
pub struct Transaction<'a> {
    state: &'a StoreState,
    schemas: &'a BTreeMap<String, TableSchema>,
    scope: BTreeSet<String>,
    source: Option<String>,
    read_only: bool,
    writes: BTreeMap<String, BTreeMap<Key, Option<Value>>>,
    counters: BTreeMap<String, i64>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        state: &'a StoreState,
        schemas: &'a BTreeMap<String, TableSchema>,
        scope: BTreeSet<String>,
        source: Option<String>,
        read_only: bool,
    ) -> Self {
        Self {
            state,
            schemas,
            scope,
            source,
            read_only,
            writes: BTreeMap::new(),
            counters: BTreeMap::new(),
        }
    }

    /// Source tag of this transaction.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Schema of `table`.
    ///
    /// # Errors
    ///
    /// Fails for unknown tables and tables outside the scope.
    pub fn schema(&self, table: &str) -> StoreResult<&'a TableSchema> {
        let schema = self
            .schemas
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        if !self.scope.is_empty() && !self.scope.contains(table) {
            return Err(StoreError::NotInScope(table.to_string()));
        }
        Ok(schema)
    }

    fn writable(&self, table: &str) -> StoreResult<&'a TableSchema> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.schema(table)
    }

    /// Reads one row.
    pub fn get(&self, table: &str, key: &Key) -> StoreResult<Option<Value>> {
        self.schema(table)?;
        if let Some(staged) = self.writes.get(table).and_then(|w| w.get(key)) {
            return Ok(staged.clone());
        }
        Ok(self
            .state
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    /// Inserts or replaces a row, returning its primary key.
    ///
    /// Rows of auto-increment tables without a key get the next counter
    /// value written into the key field.
    pub fn put(&mut self, table: &str, row: Value) -> StoreResult<Key> {
        let schema = self.writable(table)?;
        let (key, row) = self.keyed(schema, row)?;
        self.stage(table, key.clone(), Some(row));
        Ok(key)
    }

    /// Inserts a row, failing if the key is already taken.
    pub fn add(&mut self, table: &str, row: Value) -> StoreResult<Key> {
        let schema = self.writable(table)?;
        let (key, row) = self.keyed(schema, row)?;
        if self.get(table, &key)?.is_some() {
            return Err(StoreError::KeyExists {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        self.stage(table, key.clone(), Some(row));
        Ok(key)
    }

    /// Deletes a row. Returns false if it did not exist.
    pub fn delete(&mut self, table: &str, key: &Key) -> StoreResult<bool> {
        self.writable(table)?;
        let existed = self.get(table, key)?.is_some();
        if existed {
            self.stage(table, key.clone(), None);
        }
        Ok(existed)
    }

    /// Modifies a row in place. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Fails if `modify` changes the row's primary key.
    pub fn update<F>(&mut self, table: &str, key: &Key, modify: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut Value),
    {
        let schema = self.writable(table)?;
        let Some(mut row) = self.get(table, key)? else {
            return Ok(false);
        };
        modify(&mut row);
        if schema.primary_key().extract(&row).as_ref() != Some(key) {
            return Err(StoreError::invalid_key(
                table,
                format!("update changed the primary key of {key}"),
            ));
        }
        self.stage(table, key.clone(), Some(row));
        Ok(true)
    }

    /// All rows of `table` in key order.
    pub fn scan(&self, table: &str) -> StoreResult<Vec<(Key, Value)>> {
        self.range(table, Bound::Unbounded, Bound::Unbounded, None)
    }

    /// Rows with keys between `lower` and `upper`, at most `limit`.
    pub fn range(
        &self,
        table: &str,
        lower: Bound<Key>,
        upper: Bound<Key>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(Key, Value)>> {
        self.schema(table)?;
        if is_empty_range(&lower, &upper) {
            return Ok(Vec::new());
        }

        let mut view: BTreeMap<Key, Value> = self
            .state
            .tables
            .get(table)
            .map(|rows| {
                rows.range((lower.clone(), upper.clone()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(staged) = self.writes.get(table) {
            for (key, value) in staged.range((lower, upper)) {
                match value {
                    Some(row) => view.insert(key.clone(), row.clone()),
                    None => view.remove(key),
                };
            }
        }

        Ok(view.into_iter().take(limit.unwrap_or(usize::MAX)).collect())
    }

    /// Rows whose top-level `field` equals `value`.
    pub fn where_eq(&self, table: &str, field: &str, value: &Value) -> StoreResult<Vec<(Key, Value)>> {
        self.filter(table, |row| row.get(field) == Some(value))
    }

    /// Rows matching `predicate`.
    pub fn filter<P>(&self, table: &str, predicate: P) -> StoreResult<Vec<(Key, Value)>>
    where
        P: Fn(&Value) -> bool,
    {
        Ok(self
            .scan(table)?
            .into_iter()
            .filter(|(_, row)| predicate(row))
            .collect())
    }

    /// Applies `modify` to every row matching `predicate`; returns the count.
    pub fn modify_where<P, F>(&mut self, table: &str, predicate: P, mut modify: F) -> StoreResult<usize>
    where
        P: Fn(&Value) -> bool,
        F: FnMut(&mut Value),
    {
        self.writable(table)?;
        let matching = self.filter(table, predicate)?;
        let count = matching.len();
        for (key, mut row) in matching {
            modify(&mut row);
            self.stage(table, key, Some(row));
        }
        Ok(count)
    }

    /// Largest key currently in `table`.
    pub fn last_key(&self, table: &str) -> StoreResult<Option<Key>> {
        Ok(self.scan(table)?.pop().map(|(key, _)| key))
    }

    /// Highest auto-increment value ever handed out for `table`.
    pub fn last_auto_key(&self, table: &str) -> StoreResult<i64> {
        self.schema(table)?;
        Ok(self.counter(table))
    }

    /// Builds the error that aborts the transaction.
    ///
    /// ```rust,ignore
    /// db.transaction(options, |txn| {
    ///     txn.put("items", row)?;
    ///     Err(txn.abort(AbortReason::Revert))
    /// })
    /// ```
    #[must_use]
    pub fn abort(&self, reason: AbortReason) -> StoreError {
        StoreError::Aborted(reason)
    }

    fn counter(&self, table: &str) -> i64 {
        self.counters
            .get(table)
            .or_else(|| self.state.counters.get(table))
            .copied()
            .unwrap_or(0)
    }

    fn keyed(&mut self, schema: &TableSchema, mut row: Value) -> StoreResult<(Key, Value)> {
        let table = schema.name();
        if !row.is_object() {
            return Err(StoreError::invalid_key(table, "rows must be JSON objects"));
        }
        match schema.primary_key().extract(&row) {
            Some(key) => {
                if schema.auto_increment() {
                    if let Key::Int(value) = key {
                        if value > self.counter(table) {
                            self.counters.insert(table.to_string(), value);
                        }
                    }
                }
                Ok((key, row))
            }
            None if schema.auto_increment() => {
                let next = self.counter(table) + 1;
                self.counters.insert(table.to_string(), next);
                if let (KeyPath::Field(field), Some(obj)) = (schema.primary_key(), row.as_object_mut()) {
                    obj.insert(field.clone(), Value::from(next));
                }
                Ok((Key::Int(next), row))
            }
            None => Err(StoreError::invalid_key(
                table,
                format!("row is missing primary key {:?}", schema.primary_key().fields()),
            )),
        }
    }

    fn stage(&mut self, table: &str, key: Key, value: Option<Value>) {
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key, value);
    }

    pub(crate) fn into_writes(
        self,
    ) -> (
        BTreeMap<String, BTreeMap<Key, Option<Value>>>,
        BTreeMap<String, i64>,
        Option<String>,
    ) {
        (self.writes, self.counters, self.source)
    }
}

fn is_empty_range(lower: &Bound<Key>, upper: &Bound<Key>) -> bool {
    match (lower, upper) {
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ranges() {
        let a = Key::Int(1);
        let b = Key::Int(2);
        assert!(!is_empty_range(&Bound::Included(a.clone()), &Bound::Included(a.clone())));
        assert!(is_empty_range(&Bound::Excluded(a.clone()), &Bound::Included(a.clone())));
        assert!(is_empty_range(&Bound::Included(b.clone()), &Bound::Included(a.clone())));
        assert!(!is_empty_range(&Bound::Excluded(a), &Bound::Unbounded));
        assert!(!is_empty_range(&Bound::Unbounded, &Bound::Excluded(b)));
    }
}
