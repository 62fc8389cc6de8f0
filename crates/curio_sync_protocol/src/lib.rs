//! # Curio Sync Protocol
//!
//! Change model and sync protocol types for Curio.
//!
//! This crate provides:
//! - [`Change`] records and the validating [`ChangeBuilder`]
//! - Key-path patches ([`diff_mods`], [`apply_mods`])
//! - The merge engine ([`merge_changes`], [`MergedChanges`])
//! - Sync response and cross-tab messages
//! - Writer source sentinels
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod error;
mod merge;
mod messages;
mod mods;
mod source;

pub use change::{
    Change, ChangeBuilder, ChangeKind, ChangeType, CopySpec, RelativePosition, SyncOptions,
    TableCatalog,
};
pub use error::{ProtocolError, ProtocolResult};
pub use merge::{merge_changes, merge_flat, MergedChanges};
pub use messages::{
    ChangeFailure, ChannelRev, ResponseStatus, RevAck, RevRef, SyncResponse, TabMessage,
    TaskStatus,
};
pub use mods::{apply_mods, apply_path, diff_mods, fold_mods, Mods, EXCLUDED_FIELDS};
pub use source::{is_ignored_source, FETCH_SOURCE, IGNORED_SOURCE, REVERT_SOURCE};
