//! # ShelfDB Storage
//!
//! Byte-store backends underneath the ShelfDB document engine.
//!
//! A backend is a growable array of bytes with append, positional read,
//! truncate and whole-content replacement. It knows nothing about records,
//! logs or documents; `shelfdb_core` owns every on-disk format.
//!
//! Two backends ship with the crate:
//!
//! - [`InMemoryBackend`] keeps the bytes in a `Vec<u8>`; used by in-memory
//!   databases and tests.
//! - [`FileBackend`] keeps the bytes in one file and replaces it atomically
//!   (temp file + rename) when compaction rewrites it.
//!
//! ```rust
//! use shelfdb_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut log = InMemoryBackend::new();
//! let at = log.append(b"record").unwrap();
//! assert_eq!(log.read_at(at, 6).unwrap(), b"record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
