//! Table schemas.
//!
//! A schema is declared with a compact definition string:
//!
//! ```text
//! ++rev,[table+key],server_rev,type
//! ```
//!
//! The first entry names the primary key (`++` marks it auto-increment),
//! `[a+b]` is a compound key path and every following entry is an indexed
//! field. Indexed fields are recorded for lookups by field equality.

use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use serde_json::Value;

/// Path from a row to a key value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPath {
    /// A single top-level field.
    Field(String),
    /// Several top-level fields forming one compound key.
    Compound(Vec<String>),
}

impl KeyPath {
    fn parse(table: &str, entry: &str) -> StoreResult<Self> {
        let entry = entry.trim_start_matches(['&', '*']);
        if let Some(inner) = entry.strip_prefix('[') {
            let inner = inner
                .strip_suffix(']')
                .ok_or_else(|| StoreError::invalid_schema(table, format!("unclosed '[' in {entry}")))?;
            let fields: Vec<String> = inner
                .split('+')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
            if fields.len() < 2 {
                return Err(StoreError::invalid_schema(
                    table,
                    format!("compound key {entry} needs at least two fields"),
                ));
            }
            return Ok(KeyPath::Compound(fields));
        }
        if entry.is_empty() {
            return Err(StoreError::invalid_schema(table, "empty key path"));
        }
        Ok(KeyPath::Field(entry.to_string()))
    }

    /// Reads the key this path points at inside `row`.
    #[must_use]
    pub fn extract(&self, row: &Value) -> Option<Key> {
        match self {
            KeyPath::Field(field) => row.get(field).and_then(Key::from_value),
            KeyPath::Compound(fields) => fields
                .iter()
                .map(|f| row.get(f).and_then(Key::from_value))
                .collect::<Option<Vec<_>>>()
                .map(Key::Compound),
        }
    }

    /// Fields covered by this path.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        match self {
            KeyPath::Field(field) => vec![field.as_str()],
            KeyPath::Compound(fields) => fields.iter().map(String::as_str).collect(),
        }
    }
}

/// Definition of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    primary_key: KeyPath,
    auto_increment: bool,
    indexes: Vec<KeyPath>,
}

impl TableSchema {
    /// Parses a schema definition string for table `name`.
    ///
    /// # Errors
    ///
    /// Fails on an empty definition, a malformed compound path, or an
    /// auto-increment compound primary key.
    pub fn parse(name: impl Into<String>, definition: &str) -> StoreResult<Self> {
        let name = name.into();
        let mut entries = definition.split(',').map(str::trim);
        let first = entries
            .next()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| StoreError::invalid_schema(&name, "missing primary key"))?;

        let (auto_increment, pk) = match first.strip_prefix("++") {
            Some(rest) => (true, rest),
            None => (false, first),
        };
        let primary_key = KeyPath::parse(&name, pk)?;
        if auto_increment && matches!(primary_key, KeyPath::Compound(_)) {
            return Err(StoreError::invalid_schema(
                &name,
                "compound primary keys cannot auto-increment",
            ));
        }

        let indexes = entries
            .filter(|e| !e.is_empty())
            .map(|e| KeyPath::parse(&name, e))
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Self {
            name,
            primary_key,
            auto_increment,
            indexes,
        })
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary key path.
    #[must_use]
    pub fn primary_key(&self) -> &KeyPath {
        &self.primary_key
    }

    /// Whether missing primary keys are assigned from a counter.
    #[must_use]
    pub fn auto_increment(&self) -> bool {
        self.auto_increment
    }

    /// Secondary index paths.
    #[must_use]
    pub fn indexes(&self) -> &[KeyPath] {
        &self.indexes
    }

    /// Returns true if `field` is the primary key or an indexed field.
    #[must_use]
    pub fn is_indexed(&self, field: &str) -> bool {
        self.primary_key == KeyPath::Field(field.to_string())
            || self
                .indexes
                .iter()
                .any(|idx| *idx == KeyPath::Field(field.to_string()))
    }
}
