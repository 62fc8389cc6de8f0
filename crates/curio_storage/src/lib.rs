//! # Curio Storage
//!
//! Embedded transactional table store underneath the Curio replication
//! engine.
//!
//! This crate provides:
//! - Byte-level backends ([`InMemoryBackend`], [`FileBackend`])
//! - A checksummed commit journal replayed on open
//! - Tables declared with compact schema strings ([`TableSchema`])
//! - Single-writer transactions scoped to a set of tables and tagged with a
//!   source ([`Database::transaction`])
//! - A commit feed delivering every committed write to listeners
//!
//! ## Example
//!
//! ```rust
//! use curio_storage::{Database, Key, StoreResult, TableSchema, TransactionOptions};
//! use serde_json::json;
//!
//! # fn main() -> StoreResult<()> {
//! let db = Database::open_in_memory(vec![TableSchema::parse("items", "++id,name")?])?;
//! let key = db.transaction(TransactionOptions::new(), |txn| {
//!     txn.put("items", json!({"name": "first"}))
//! })?;
//! assert_eq!(key, Key::Int(1));
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod database;
mod error;
mod feed;
mod file;
mod journal;
mod key;
mod memory;
mod schema;
mod transaction;

pub use backend::StorageBackend;
pub use database::{Database, StoreConfig, TxnError};
pub use error::{AbortReason, StoreError, StoreResult};
pub use feed::{CommitEvent, CommitFeed, Listener, ListenerId, RowChange};
pub use file::FileBackend;
pub use journal::{compute_crc32, JOURNAL_MAGIC};
pub use key::Key;
pub use memory::InMemoryBackend;
pub use schema::{KeyPath, TableSchema};
pub use transaction::{Transaction, TransactionOptions, TxnOutcome};
