//! Storage error type.

use std::io;
use thiserror::Error;

/// Result alias for backend operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures reported by a [`crate::StorageBackend`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system reported an I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read asked for bytes past the end of the store.
    #[error("read of {len} bytes at offset {offset} exceeds store size {size}")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Size of the store at the time of the read.
        size: u64,
    },

    /// A truncate asked to grow the store.
    #[error("cannot truncate store of size {size} to {requested}")]
    TruncateBeyondEnd {
        /// Requested size.
        requested: u64,
        /// Current size.
        size: u64,
    },
}

impl StorageError {
    pub(crate) fn check_read(offset: u64, len: usize, size: u64) -> StorageResult<()> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= size => Ok(()),
            _ => Err(Self::ReadPastEnd { offset, len, size }),
        }
    }

    pub(crate) fn check_truncate(requested: u64, size: u64) -> StorageResult<()> {
        if requested > size {
            Err(Self::TruncateBeyondEnd { requested, size })
        } else {
            Ok(())
        }
    }
}
