//! The backend trait.

use crate::error::StorageResult;

/// An opaque, append-oriented byte store.
///
/// Offsets returned by [`append`](Self::append) stay valid until the store
/// is truncated below them or its contents are replaced.
pub trait StorageBackend: Send + Sync {
    /// Reads exactly `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// `ReadPastEnd` if the range is not fully inside the store, or an I/O
    /// error from the underlying medium.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    fn flush(&mut self) -> StorageResult<()>;

    /// Forces data and metadata to stable storage.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    fn sync(&mut self) -> StorageResult<()>;

    /// Current size in bytes, which is also the next append offset.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    fn size(&self) -> StorageResult<u64>;

    /// Shrinks the store to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// `TruncateBeyondEnd` if `new_size` is larger than the store.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Replaces the whole content of the store with `data`.
    ///
    /// Readers never observe a partially written replacement.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures; on failure the old content is kept.
    fn replace_contents(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Reads the entire store.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }
}
