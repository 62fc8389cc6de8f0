//! # Curio Sync Engine
//!
//! Offline-first change replication for Curio.
//!
//! This crate provides:
//! - A durable change log fed by every local write
//! - Change tracking with revert
//! - The debounced, cancellable sync client
//! - Application of server-returned changes through a dispatcher stream
//! - Resource facades with cached, refreshable reads
//! - Cross-tab fetch coordination over a shared bus
//!
//! ## Architecture
//!
//! Writes go through a [`Resource`], which updates its table and appends a
//! [`curio_sync_protocol::Change`] to the log in the same transaction. The
//! [`SyncClient`] wakes on new log rows, waits for the burst to settle,
//! drains and merges everything logged so far, posts it, and reconciles the
//! server's verdicts back into the log:
//! 1. Drain and merge the pending log
//! 2. Post the merged batch
//! 3. Stamp verdicts, delete successes, record channel revisions
//! 4. Apply the changes the server returned
//!
//! ## Key Invariants
//!
//! - A write and its log row commit together or not at all
//! - Changes made while a cycle is in flight wait for the next cycle
//! - Applied server changes are never logged again
//! - Rejected changes are kept, flagged, and never resent

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod abort;
mod apply;
mod changes;
mod config;
mod context;
mod engine;
mod error;
mod fetch;
mod http;
mod registry;
mod resource;
mod session;
mod stream;
mod sync;
mod tabs;
mod tracker;
mod transport;
mod tree;

pub use abort::{AbortController, AbortSignal};
pub use apply::{AppliedChange, ApplyEngine, StoreDispatcher};
pub use changes::{log_schemas, ChangeLog, LogPage, UnsyncedWatch, CHANGES_TABLE, TASKS_TABLE};
pub use config::SyncConfig;
pub use context::SyncContext;
pub use engine::{EngineBuilder, ReplicationEngine};
pub use error::{SyncError, SyncResult};
pub use fetch::{Fetcher, RemoteFetcher, LAST_FETCH_FIELD};
pub use http::{HttpClient, HttpResponse, HttpTransport, MockHttpClient};
pub use registry::{ResourceDescriptor, ResourceRegistry, CHANNEL, CONTENTNODE};
pub use resource::Resource;
pub use session::Session;
pub use stream::{ChangeDispatcher, ChangeStream};
pub use sync::{SyncClient, SyncCycleResult, SyncState, SyncStats};
pub use tabs::{CrossTabChannel, Envelope, TabBus};
pub use tracker::{ChangeTracker, TrackerState};
pub use transport::{MockTransport, SyncTransport};
pub use tree::{ContentTree, TreeInsert, TreeResource};
