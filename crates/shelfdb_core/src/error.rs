//! Error types for the ShelfDB engine.

use std::io;
use thiserror::Error;

/// Result alias used across the engine.
pub type DbResult<T> = Result<T, DbError>;

/// Errors returned by database, collection and document operations.
///
/// An unresolved conflict reported by a custom resolver is not an error: the
/// operation returns `Ok(false)` instead.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database handle has been closed or deleted.
    #[error("database is not open")]
    NotOpen,

    /// A scope, collection, document or index does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A `FailOnConflict` write found a different stored revision.
    #[error("conflict saving document {document_id:?}")]
    Conflict {
        /// Id of the conflicting document.
        document_id: String,
    },

    /// A caller-supplied argument is malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The database or the write slot is held by someone else.
    #[error("busy: {message}")]
    Busy {
        /// What is busy.
        message: String,
    },

    /// Failure reported by the byte-store backend.
    #[error("storage error: {0}")]
    Storage(#[from] shelfdb_storage::StorageError),

    /// A body or manifest could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Stored data is structurally invalid.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// A stored record failed its CRC check.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored with the record.
        expected: u32,
        /// Checksum computed over the record.
        actual: u32,
    },

    /// A conflict resolver panicked.
    #[error("conflict resolver failed: {message}")]
    ResolverFailure {
        /// Panic payload, when it was a string.
        message: String,
    },

    /// The call is not allowed in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the call was rejected.
        message: String,
    },

    /// A batch was rolled back because one of its mutations failed.
    #[error("batch aborted: {reason}")]
    BatchAborted {
        /// The first failure recorded in the batch.
        reason: String,
    },
}

impl DbError {
    /// Creates a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a `Conflict` error.
    pub fn conflict(document_id: impl Into<String>) -> Self {
        Self::Conflict {
            document_id: document_id.into(),
        }
    }

    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a `Busy` error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    /// Creates a `Codec` error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a `Corruption` error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a `ResolverFailure` error.
    pub fn resolver_failure(message: impl Into<String>) -> Self {
        Self::ResolverFailure {
            message: message.into(),
        }
    }

    /// Creates an `InvalidOperation` error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a `BatchAborted` error.
    pub fn batch_aborted(reason: impl Into<String>) -> Self {
        Self::BatchAborted {
            reason: reason.into(),
        }
    }

    /// Returns true for `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for `Conflict`.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
