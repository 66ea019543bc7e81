//! # ShelfDB Core
//!
//! Embedded transactional document database.
//!
//! Documents are JSON objects grouped into collections, and collections
//! into scopes. This crate provides:
//! - Write-ahead logged, CRC-checked document storage with crash recovery
//! - Single-writer transactions with revision-based conflict detection and
//!   pluggable resolution
//! - Atomic batches
//! - Change notifications per document and per collection
//! - Document expiration with a background reaper
//! - Content-addressed blobs, simple value and full-text indexes, and
//!   maintenance passes (compaction, reindexing, integrity checks)
//!
//! ```rust
//! use shelfdb_core::{ConcurrencyControl, Database, DbError, Document};
//!
//! let db = Database::open_in_memory().unwrap();
//! let coll = db.create_collection("coll", "").unwrap();
//!
//! let mut doc = Document::with_id("doc1");
//! doc.set("v", 1);
//! coll.save(&mut doc).unwrap();
//!
//! let mut stale = coll.document("doc1").unwrap().unwrap();
//! doc.set("v", 2);
//! coll.save(&mut doc).unwrap();
//!
//! stale.set("v", 3);
//! let err = coll
//!     .save_with(&mut stale, ConcurrencyControl::FailOnConflict)
//!     .unwrap_err();
//! assert!(matches!(err, DbError::Conflict { .. }));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod collection;
mod config;
mod database;
mod dir;
mod document;
mod error;
mod index;
mod legacy;
mod maintenance;
mod manifest;
mod namespace;
mod notify;
mod reaper;
mod segment;
mod stats;
mod store;
mod transaction;
mod types;
mod wal;

pub use blob::Blob;
pub use collection::{Collection, ConcurrencyControl, ConflictResolver};
pub use config::Config;
pub use database::Database;
pub use document::Document;
pub use error::{DbError, DbResult};
pub use index::IndexSpec;
pub use maintenance::MaintenanceType;
pub use namespace::Scope;
pub use notify::{
    ChangeKind, CollectionChange, DispatchQueue, DocumentChange, Executor, InlineExecutor,
    ListenerToken, Task,
};
pub use stats::{DatabaseStats, StatsSnapshot, StoreStatistics};
pub use types::{CollectionId, Revision, SequenceNumber, TransactionId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
