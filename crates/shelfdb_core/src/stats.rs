//! Operation counters and storage statistics.
//!
//! [`DatabaseStats`] counts operations as they happen. [`StoreStatistics`]
//! describes the stored data and is refreshed by the `Optimize` and
//! `FullOptimize` maintenance passes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live operation counters. Values only grow.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    saves: AtomicU64,
    deletes: AtomicU64,
    purges: AtomicU64,
    expired: AtomicU64,
    conflicts: AtomicU64,
    unresolved: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    checkpoints: AtomicU64,
    compactions: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident, $doc:literal) => {
        pub(crate) fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[doc = $doc]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl DatabaseStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_save, saves, saves, "Documents saved.");
    counter!(record_delete, deletes, deletes, "Documents deleted.");
    counter!(record_purge, purges, purges, "Documents purged explicitly.");
    counter!(record_expired, expired, expired, "Documents purged by expiration.");
    counter!(record_conflict, conflicts, conflicts, "Writes that found a different stored revision.");
    counter!(record_unresolved, unresolved, unresolved, "Conflicts a resolver declined.");
    counter!(record_commit, commits, commits, "Non-empty commits.");
    counter!(record_rollback, rollbacks, rollbacks, "Transactions rolled back.");
    counter!(record_checkpoint, checkpoints, checkpoints, "Checkpoints taken.");
    counter!(record_compaction, compactions, compactions, "Compactions run.");

    /// Copies every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            saves: self.saves(),
            deletes: self.deletes(),
            purges: self.purges(),
            expired: self.expired(),
            conflicts: self.conflicts(),
            unresolved: self.unresolved(),
            commits: self.commits(),
            rollbacks: self.rollbacks(),
            checkpoints: self.checkpoints(),
            compactions: self.compactions(),
        }
    }
}

/// Point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Documents saved.
    pub saves: u64,
    /// Documents deleted.
    pub deletes: u64,
    /// Documents purged explicitly.
    pub purges: u64,
    /// Documents purged by expiration.
    pub expired: u64,
    /// Writes that found a different stored revision.
    pub conflicts: u64,
    /// Conflicts a resolver declined.
    pub unresolved: u64,
    /// Non-empty commits.
    pub commits: u64,
    /// Transactions rolled back.
    pub rollbacks: u64,
    /// Checkpoints taken.
    pub checkpoints: u64,
    /// Compactions run.
    pub compactions: u64,
}

/// Description of the stored data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreStatistics {
    /// Collections holding at least one record.
    pub collections: u64,
    /// Live documents.
    pub documents: u64,
    /// Tombstones.
    pub tombstones: u64,
    /// Documents with an expiration set.
    pub expiring: u64,
    /// Bytes in the segment log.
    pub segment_bytes: u64,
    /// Records in the segment log; only counted by a full pass.
    pub segment_records: Option<u64>,
    /// Index tables.
    pub indexes: u64,
    /// Distinct keys over all index tables.
    pub index_keys: u64,
    /// Highest committed sequence.
    pub last_sequence: u64,
}
