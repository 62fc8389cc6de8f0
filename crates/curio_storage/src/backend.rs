//! Byte-level storage backends underneath the commit journal.

use crate::error::StoreResult;

/// An append-only byte store holding the commit journal.
///
/// Backends never interpret what they hold. The journal decides framing,
/// checksums and recovery; a backend only has to give back exactly the
/// bytes that were appended at an offset.
///
/// # Invariants
///
/// - `append` returns the offset the data starts at
/// - `size` is the offset of the next append
/// - after `sync` returns, appended data survives process termination
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::ReadPastEnd`] if the range extends
    /// past the current size.
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> StoreResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> StoreResult<u64>;

    /// Makes data and metadata durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Drops everything after `new_size`.
    ///
    /// Used to cut a torn trailing record during recovery and to reset the
    /// journal on checkpoint.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` is larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StoreResult<()>;
}
