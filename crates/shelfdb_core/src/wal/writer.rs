//! WAL writer and recovery reader.

use crate::error::DbResult;
use crate::segment::SegmentRecord;
use crate::types::{SequenceNumber, TransactionId};
use crate::wal::record::WalRecord;
use shelfdb_storage::StorageBackend;
use std::collections::HashMap;

/// A transaction found committed in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransaction {
    /// Transaction ID.
    pub txid: TransactionId,
    /// Commit sequence.
    pub sequence: SequenceNumber,
    /// Records in staging order.
    pub records: Vec<SegmentRecord>,
}

/// Everything recovery needs from the log.
#[derive(Debug, Default)]
pub struct WalRecovery {
    /// Committed transactions in commit order.
    pub committed: Vec<CommittedTransaction>,
    /// Transactions that began but never committed.
    pub incomplete: usize,
    /// Highest transaction ID seen.
    pub max_txid: u64,
    /// Highest checkpoint sequence seen.
    pub checkpoint: Option<SequenceNumber>,
    /// Offset just past the last complete frame.
    pub valid_len: u64,
    /// Size of the log when read.
    pub size: u64,
}

/// Append-only write-ahead log.
///
/// Every commit writes `Begin`, one `Write` per record and `Commit`, then
/// flushes (or syncs) before the records reach the segment log.
pub struct WalManager {
    backend: Box<dyn StorageBackend>,
    sync_on_commit: bool,
}

impl WalManager {
    /// Wraps a backend. With `sync_on_commit` every commit is `fsync`ed.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend,
            sync_on_commit,
        }
    }

    /// Appends one record and returns its offset.
    pub fn append(&mut self, record: &WalRecord) -> DbResult<u64> {
        Ok(self.backend.append(&record.encode()?)?)
    }

    /// Appends a full committed transaction and makes it durable.
    pub fn log_commit(
        &mut self,
        txid: TransactionId,
        sequence: SequenceNumber,
        records: &[SegmentRecord],
    ) -> DbResult<()> {
        let mut frames = WalRecord::Begin { txid }.encode()?;
        for record in records {
            frames.extend_from_slice(
                &WalRecord::Write {
                    txid,
                    record: record.clone(),
                }
                .encode()?,
            );
        }
        frames.extend_from_slice(&WalRecord::Commit { txid, sequence }.encode()?);
        self.backend.append(&frames)?;
        if self.sync_on_commit {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(())
    }

    /// Drops everything from `offset` on, un-logging a commit whose records
    /// never reached the segment log.
    pub fn discard_from(&mut self, offset: u64) -> DbResult<()> {
        self.backend.truncate(offset)?;
        if self.sync_on_commit {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(())
    }

    /// Reads the log and groups committed transactions.
    ///
    /// A partial frame at the end is tolerated; a corrupt complete frame
    /// fails recovery.
    pub fn recover(&self) -> DbResult<WalRecovery> {
        let data = self.backend.read_all()?;
        let mut recovery = WalRecovery {
            size: data.len() as u64,
            ..WalRecovery::default()
        };
        let mut open: HashMap<TransactionId, Vec<SegmentRecord>> = HashMap::new();
        let mut offset = 0usize;

        while let Some((record, len)) = WalRecord::decode(&data[offset..])? {
            offset += len;
            match record {
                WalRecord::Begin { txid } => {
                    recovery.max_txid = recovery.max_txid.max(txid.as_u64());
                    open.insert(txid, Vec::new());
                }
                WalRecord::Write { txid, record } => {
                    open.entry(txid).or_default().push(record);
                }
                WalRecord::Commit { txid, sequence } => {
                    let records = open.remove(&txid).unwrap_or_default();
                    recovery.committed.push(CommittedTransaction {
                        txid,
                        sequence,
                        records,
                    });
                }
                WalRecord::Checkpoint { sequence } => {
                    recovery.checkpoint = Some(sequence);
                }
            }
        }
        recovery.valid_len = offset as u64;
        recovery.incomplete = open.len();
        Ok(recovery)
    }

    /// Drops a torn tail found by [`recover`](Self::recover).
    pub fn truncate(&mut self, len: u64) -> DbResult<()> {
        Ok(self.backend.truncate(len)?)
    }

    /// Writes a checkpoint marker then empties the log.
    pub fn checkpoint(&mut self, sequence: SequenceNumber) -> DbResult<()> {
        self.append(&WalRecord::Checkpoint { sequence })?;
        self.backend.flush()?;
        self.backend.truncate(0)?;
        self.backend.sync()?;
        Ok(())
    }

    /// Current size in bytes.
    pub fn size(&self) -> DbResult<u64> {
        Ok(self.backend.size()?)
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("size", &self.size().ok())
            .field("sync_on_commit", &self.sync_on_commit)
            .finish()
    }
}
