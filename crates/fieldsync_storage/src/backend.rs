//! Storage backend trait definition.

use crate::error::StorageResult;

/// An append-only byte store holding the offline journal.
///
/// # Invariants
///
/// - `append` returns the offset where the bytes begin
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `flush` returns, appended bytes survive a process restart
///
/// Implementations must be `Send + Sync`; callers serialise mutation
/// through their own lock.
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::ReadPastEnd`] when the range is not
    /// fully inside the stored bytes, or on I/O failure.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes could not be written.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Forces data and metadata to the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Current size in bytes; the offset of the next append.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Drops every byte at or after `new_size`.
    ///
    /// The journal uses this to cut off a torn trailing entry after a crash.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::TruncatePastEnd`] if `new_size`
    /// exceeds the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
