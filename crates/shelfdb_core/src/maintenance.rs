//! Maintenance passes.

use crate::database::DbInner;
use crate::error::{DbError, DbResult};
use crate::segment::Compactor;
use tracing::{debug, info};

/// A maintenance pass for [`Database::perform_maintenance`](crate::Database::perform_maintenance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaintenanceType {
    /// Rewrites the segment log keeping the newest record per document,
    /// dropping records of deleted collections and purge markers, then
    /// deletes blobs no live document references.
    Compact,
    /// Rebuilds every index from the stored documents.
    Reindex,
    /// Verifies every record checksum, every index entry and every blob.
    IntegrityCheck,
    /// Refreshes statistics from the in-memory index.
    Optimize,
    /// Refreshes statistics by scanning every record and index table.
    FullOptimize,
}

impl std::str::FromStr for MaintenanceType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "compact" => Ok(Self::Compact),
            "reindex" => Ok(Self::Reindex),
            "integritycheck" => Ok(Self::IntegrityCheck),
            "optimize" => Ok(Self::Optimize),
            "fulloptimize" => Ok(Self::FullOptimize),
            _ => Err(DbError::invalid_argument(format!("unknown maintenance type {s:?}"))),
        }
    }
}

impl DbInner {
    pub(crate) fn perform_maintenance(&self, kind: MaintenanceType) -> DbResult<()> {
        self.check_open()?;
        match kind {
            MaintenanceType::Compact => self.txns.exclusive("compact", || self.compact()),
            MaintenanceType::Reindex => self.txns.exclusive("reindex", || self.reindex()),
            MaintenanceType::IntegrityCheck => self.integrity_check(),
            MaintenanceType::Optimize => self.refresh_statistics(false),
            MaintenanceType::FullOptimize => self.refresh_statistics(true),
        }
    }

    fn compact(&self) -> DbResult<()> {
        self.checkpoint()?;
        let compactor = Compactor::new(self.tombstone_retention);
        let live = self.live_collections();
        let result = self.store.compact(&compactor, |id| live.contains(&id))?;
        self.stats.record_compaction();

        let referenced = self.store.referenced_blobs()?;
        let mut removed = 0usize;
        for digest in self.blobs.digests()? {
            if !referenced.contains(&digest) {
                self.blobs.remove(&digest)?;
                removed += 1;
            }
        }
        info!(
            records = result.output_records,
            bytes_saved = result.bytes_saved,
            blobs_removed = removed,
            "compaction finished"
        );
        Ok(())
    }

    fn reindex(&self) -> DbResult<()> {
        let specs = self.store.index_specs();
        for (collection, name, spec) in &specs {
            let table = self.store.build_index(*collection, spec.clone())?;
            self.store.install_index(*collection, name, table);
        }
        debug!(indexes = specs.len(), "indexes rebuilt");
        Ok(())
    }

    fn integrity_check(&self) -> DbResult<()> {
        let report = self.txns.locked(|| self.store.integrity_check())?;
        let mut blobs = 0usize;
        for digest in self.blobs.digests()? {
            if self.blobs.get(&digest)?.is_none() {
                return Err(DbError::corruption(format!("blob {digest} vanished")));
            }
            blobs += 1;
        }
        info!(
            records = report.records,
            documents = report.documents,
            index_tables = report.index_tables,
            blobs,
            "integrity check passed"
        );
        Ok(())
    }

    fn refresh_statistics(&self, full: bool) -> DbResult<()> {
        let stats = self.txns.locked(|| self.store.statistics(full))?;
        debug!(?stats, full, "statistics refreshed");
        *self.statistics.write() = stats;
        Ok(())
    }
}
