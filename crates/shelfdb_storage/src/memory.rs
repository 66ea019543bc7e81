//! Heap-backed backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// A backend that keeps its bytes in memory.
///
/// ```rust
/// use shelfdb_storage::{InMemoryBackend, StorageBackend};
///
/// let mut store = InMemoryBackend::new();
/// store.append(b"abc").unwrap();
/// assert_eq!(store.size().unwrap(), 3);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    bytes: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store preloaded with `bytes`, e.g. to simulate a torn log.
    #[must_use]
    pub fn with_data(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    /// Copy of the current content.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.bytes.read();
        StorageError::check_read(offset, len, bytes.len() as u64)?;
        let start = offset as usize;
        Ok(bytes[start..start + len].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let bytes = self.bytes.get_mut();
        let offset = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let bytes = self.bytes.get_mut();
        StorageError::check_truncate(new_size, bytes.len() as u64)?;
        bytes.truncate(new_size as usize);
        Ok(())
    }

    fn replace_contents(&mut self, data: &[u8]) -> StorageResult<()> {
        *self.bytes.get_mut() = data.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_appends() {
        let mut store = InMemoryBackend::new();
        assert_eq!(store.append(b"ab").unwrap(), 0);
        assert_eq!(store.append(b"").unwrap(), 2);
        assert_eq!(store.append(b"cde").unwrap(), 2);
        assert_eq!(store.read_at(1, 3).unwrap(), b"bcd");
    }

    #[test]
    fn reads_are_bounds_checked() {
        let store = InMemoryBackend::with_data(b"abc".to_vec());
        assert!(matches!(
            store.read_at(1, 3),
            Err(StorageError::ReadPastEnd { offset: 1, len: 3, size: 3 })
        ));
        assert!(store.read_at(u64::MAX, 1).is_err());
        assert!(store.read_at(3, 0).unwrap().is_empty());
    }

    #[test]
    fn truncate_and_replace() {
        let mut store = InMemoryBackend::with_data(b"abcdef".to_vec());
        store.truncate(2).unwrap();
        assert_eq!(store.data(), b"ab");
        assert!(store.truncate(3).is_err());

        store.replace_contents(b"xyz").unwrap();
        assert_eq!(store.read_all().unwrap(), b"xyz");
    }
}
