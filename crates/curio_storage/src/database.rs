//! Database facade and recovery.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use crate::feed::{CommitEvent, CommitFeed, Listener, ListenerId, RowChange};
use crate::file::FileBackend;
use crate::journal::{Journal, JournalRecord, JournalWrite};
use crate::key::Key;
use crate::memory::InMemoryBackend;
use crate::schema::TableSchema;
use crate::transaction::{StoreState, Transaction, TransactionOptions, TxnOutcome};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `fsync` the journal after every commit.
    pub sync_on_commit: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
        }
    }
}

impl StoreConfig {
    /// Sets whether each commit is synced to disk.
    #[must_use]
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }
}

/// Errors usable as the error type of a transaction closure.
///
/// Implemented by [`StoreError`] and by error types of higher layers that
/// wrap it, so a closure can mix store calls with its own fallible logic.
pub trait TxnError: From<StoreError> {
    /// The wrapped store error, if this is one.
    fn as_store_error(&self) -> Option<&StoreError>;
}

impl TxnError for StoreError {
    fn as_store_error(&self) -> Option<&StoreError> {
        Some(self)
    }
}

/// The table store.
///
/// `Database` holds every table in memory and journals each commit to its
/// storage backend before the commit becomes visible. There is exactly one
/// writer at a time; readers never block on the closure of a writer.
///
/// ```rust,ignore
/// use curio_storage::{Database, TableSchema, TransactionOptions};
///
/// let db = Database::open_in_memory(vec![TableSchema::parse("items", "++id,name")?])?;
/// let key = db.transaction(TransactionOptions::new(), |txn| {
///     txn.put("items", serde_json::json!({"name": "first"}))
/// })?;
/// ```
///
/// Transactions must not be nested: calling [`Database::transaction`] from
/// inside a transaction closure deadlocks.
pub struct Database {
    config: StoreConfig,
    schemas: BTreeMap<String, TableSchema>,
    state: RwLock<StoreState>,
    journal: Mutex<Journal>,
    write_lock: Mutex<()>,
    feed: CommitFeed,
}

impl Database {
    /// Opens a store over `backend`, replaying its journal.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate table names, unreadable backends or a
    /// corrupted journal.
    pub fn open<B>(backend: B, schemas: Vec<TableSchema>, config: StoreConfig) -> StoreResult<Self>
    where
        B: StorageBackend + 'static,
    {
        let mut by_name = BTreeMap::new();
        for schema in schemas {
            let name = schema.name().to_string();
            if by_name.insert(name.clone(), schema).is_some() {
                return Err(StoreError::invalid_schema(name, "table declared twice"));
            }
        }

        let mut journal = Journal::new(Box::new(backend));
        let mut state = StoreState::default();
        let records = journal.replay()?;
        let replayed = records.len();
        for record in records {
            replay_record(&mut state, record);
        }
        debug!(records = replayed, sequence = state.sequence, "journal replayed");

        Ok(Self {
            config,
            schemas: by_name,
            state: RwLock::new(state),
            journal: Mutex::new(journal),
            write_lock: Mutex::new(()),
            feed: CommitFeed::new(),
        })
    }

    /// Opens a volatile store.
    pub fn open_in_memory(schemas: Vec<TableSchema>) -> StoreResult<Self> {
        Self::open(InMemoryBackend::new(), schemas, StoreConfig::default())
    }

    /// Opens a store journaled to the file at `path`.
    pub fn open_path(path: &Path, schemas: Vec<TableSchema>) -> StoreResult<Self> {
        Self::open(FileBackend::open(path)?, schemas, StoreConfig::default())
    }

    /// Schema of a registered table.
    #[must_use]
    pub fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.schemas.get(table)
    }

    /// Sequence number of the last commit.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.state.read().sequence
    }

    /// Runs `f` in a write transaction.
    ///
    /// If `f` returns `Ok` its writes are journaled, applied and announced
    /// on the commit feed. If it returns `Err` nothing is written.
    pub fn transaction<F, T, E>(&self, options: TransactionOptions, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: TxnError,
    {
        let writer = self.write_lock.lock();
        let (scope, source) = options.into_parts();
        if let Some(unknown) = scope.iter().find(|t| !self.schemas.contains_key(*t)) {
            return Err(StoreError::UnknownTable(unknown.clone()).into());
        }

        let (result, writes, counters, source) = {
            let state = self.state.read();
            let mut txn = Transaction::new(&state, &self.schemas, scope, source, false);
            let result = f(&mut txn)?;
            let (writes, counters, source) = txn.into_writes();
            (result, writes, counters, source)
        };

        if writes.is_empty() && counters.is_empty() {
            return Ok(result);
        }
        let event = self.commit(writes, counters, source)?;
        drop(writer);

        if let Some(event) = event {
            self.feed.emit(&event);
        }
        Ok(result)
    }

    /// Like [`Database::transaction`], but a closure that aborts with
    /// [`crate::AbortReason::Revert`] yields [`TxnOutcome::Reverted`] instead
    /// of an error. Every other abort propagates.
    pub fn transaction_outcome<F, T, E>(
        &self,
        options: TransactionOptions,
        f: F,
    ) -> Result<TxnOutcome<T>, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: TxnError,
    {
        match self.transaction(options, f) {
            Ok(value) => Ok(TxnOutcome::Applied(value)),
            Err(e) if e.as_store_error().is_some_and(StoreError::is_revert) => {
                debug!("transaction reverted");
                Ok(TxnOutcome::Reverted)
            }
            Err(e) => Err(e),
        }
    }

    /// Runs `f` against a read-only view of the committed state.
    pub fn read<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
    {
        let state = self.state.read();
        let txn = Transaction::new(&state, &self.schemas, BTreeSet::new(), None, true);
        f(&txn)
    }

    /// Reads one committed row.
    pub fn get(&self, table: &str, key: &Key) -> StoreResult<Option<Value>> {
        self.read(|txn| txn.get(table, key))
    }

    /// All committed rows of `table`.
    pub fn scan(&self, table: &str) -> StoreResult<Vec<(Key, Value)>> {
        self.read(|txn| txn.scan(table))
    }

    /// Highest auto-increment key ever assigned in `table`.
    ///
    /// Deleting rows never lowers it, so it doubles as the table's
    /// high-water mark.
    pub fn last_auto_key(&self, table: &str) -> StoreResult<i64> {
        self.read(|txn| txn.last_auto_key(table))
    }

    /// Rewrites the journal as a single snapshot record.
    pub fn checkpoint(&self) -> StoreResult<()> {
        let _writer = self.write_lock.lock();
        let state = self.state.read();
        let record = JournalRecord::Snapshot {
            sequence: state.sequence,
            tables: state
                .tables
                .iter()
                .map(|(name, rows)| {
                    let rows = rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    (name.clone(), rows)
                })
                .collect(),
            counters: state.counters.clone(),
        };
        self.journal.lock().rewrite(&record)?;
        debug!(sequence = state.sequence, "checkpoint written");
        Ok(())
    }

    /// Size of the journal in bytes.
    pub fn journal_size(&self) -> StoreResult<u64> {
        self.journal.lock().size()
    }

    /// Registers a commit listener.
    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        self.feed.subscribe(listener)
    }

    /// Removes a commit listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.feed.unsubscribe(id)
    }

    /// The commit feed.
    #[must_use]
    pub fn feed(&self) -> &CommitFeed {
        &self.feed
    }

    fn commit(
        &self,
        writes: BTreeMap<String, BTreeMap<Key, Option<Value>>>,
        counters: BTreeMap<String, i64>,
        source: Option<String>,
    ) -> StoreResult<Option<CommitEvent>> {
        let mut state = self.state.write();
        let sequence = state.sequence + 1;

        let mut changes = Vec::new();
        for (table, rows) in writes {
            for (key, value) in rows {
                let previous = state.tables.get(&table).and_then(|r| r.get(&key)).cloned();
                if previous.is_none() && value.is_none() {
                    continue;
                }
                changes.push(RowChange {
                    table: table.clone(),
                    key,
                    value,
                    previous,
                });
            }
        }

        let record = JournalRecord::Commit {
            sequence,
            writes: changes
                .iter()
                .map(|c| JournalWrite {
                    table: c.table.clone(),
                    key: c.key.clone(),
                    value: c.value.clone(),
                })
                .collect(),
            counters: counters.clone(),
        };
        self.journal
            .lock()
            .append(&record, self.config.sync_on_commit)?;

        for change in &changes {
            let rows = state.tables.entry(change.table.clone()).or_default();
            match &change.value {
                Some(row) => rows.insert(change.key.clone(), row.clone()),
                None => rows.remove(&change.key),
            };
        }
        merge_counters(&mut state.counters, counters);
        state.sequence = sequence;

        debug!(sequence, rows = changes.len(), source = ?source, "committed");
        if changes.is_empty() {
            return Ok(None);
        }
        Ok(Some(CommitEvent {
            sequence,
            source,
            changes,
        }))
    }
}

fn replay_record(state: &mut StoreState, record: JournalRecord) {
    match record {
        JournalRecord::Commit {
            sequence,
            writes,
            counters,
        } => {
            for write in writes {
                let rows = state.tables.entry(write.table).or_default();
                match write.value {
                    Some(row) => rows.insert(write.key, row),
                    None => rows.remove(&write.key),
                };
            }
            merge_counters(&mut state.counters, counters);
            state.sequence = state.sequence.max(sequence);
        }
        JournalRecord::Snapshot {
            sequence,
            tables,
            counters,
        } => {
            state.tables = tables
                .into_iter()
                .map(|(name, rows)| (name, rows.into_iter().collect()))
                .collect();
            state.counters = counters;
            state.sequence = sequence;
        }
    }
}

fn merge_counters(into: &mut BTreeMap<String, i64>, from: BTreeMap<String, i64>) {
    for (table, value) in from {
        let slot = into.entry(table).or_insert(0);
        *slot = (*slot).max(value);
    }
}
