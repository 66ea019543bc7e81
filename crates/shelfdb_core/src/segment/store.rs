//! Append-only record log holding every document version.

use crate::error::{DbError, DbResult};
use crate::segment::record::SegmentRecord;
use parking_lot::RwLock;
use shelfdb_storage::StorageBackend;

/// Result of scanning the whole segment log.
#[derive(Debug, Default)]
pub struct SegmentScan {
    /// Every complete record with its offset, in file order.
    pub records: Vec<(u64, SegmentRecord)>,
    /// Offset just past the last complete record.
    pub valid_len: u64,
    /// Size of the store when scanned.
    pub size: u64,
}

impl SegmentScan {
    /// True if the log ends in a partially written record.
    #[must_use]
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.size
    }
}

/// A failed [`SegmentStore::append_all`].
#[derive(Debug)]
pub struct AppendError {
    /// What went wrong.
    pub error: DbError,
    /// True if bytes of the failed write may still be in the log.
    pub torn: bool,
}

impl AppendError {
    fn clean(error: DbError) -> Self {
        Self { error, torn: false }
    }
}

impl From<AppendError> for DbError {
    fn from(err: AppendError) -> Self {
        err.error
    }
}

/// The segment log: records are appended, never rewritten in place.
pub struct SegmentStore {
    backend: RwLock<Box<dyn StorageBackend>>,
}

impl SegmentStore {
    /// Wraps a backend.
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend: RwLock::new(backend),
        }
    }

    /// Appends `records` as one write and returns their offsets.
    ///
    /// Either every record lands or the log is cut back to its old length.
    /// [`AppendError::torn`] reports when that cut failed too.
    pub fn append_all(&self, records: &[SegmentRecord]) -> Result<Vec<u64>, AppendError> {
        let mut data = Vec::new();
        let mut lens = Vec::with_capacity(records.len());
        for record in records {
            let bytes = record.encode().map_err(AppendError::clean)?;
            lens.push(bytes.len() as u64);
            data.extend_from_slice(&bytes);
        }

        let mut backend = self.backend.write();
        let base = backend.size().map_err(|e| AppendError::clean(e.into()))?;
        let written = backend.append(&data).and_then(|_| backend.flush());
        if let Err(err) = written {
            let torn = backend.truncate(base).and_then(|()| backend.flush()).is_err();
            return Err(AppendError {
                error: err.into(),
                torn,
            });
        }

        let mut offset = base;
        Ok(lens
            .into_iter()
            .map(|len| {
                let at = offset;
                offset += len;
                at
            })
            .collect())
    }

    /// Reads the record starting at `offset`.
    pub fn read_at(&self, offset: u64) -> DbResult<SegmentRecord> {
        let backend = self.backend.read();
        let size = backend.size()?;
        if offset.saturating_add(4) > size {
            return Err(DbError::corruption(format!("record offset {offset} beyond segment end")));
        }
        let head = backend.read_at(offset, 4)?;
        let len = SegmentRecord::peek_len(&head)
            .ok_or_else(|| DbError::corruption("unreadable record length"))?;
        if offset + len as u64 > size {
            return Err(DbError::corruption(format!(
                "record at {offset} extends past segment end"
            )));
        }
        SegmentRecord::decode(&backend.read_at(offset, len)?)
    }

    /// Decodes every record. Stops at a torn tail; a checksum failure in a
    /// complete record is an error.
    pub fn scan(&self) -> DbResult<SegmentScan> {
        let data = self.backend.read().read_all()?;
        let size = data.len() as u64;
        let mut scan = SegmentScan {
            size,
            ..SegmentScan::default()
        };
        let mut offset = 0usize;
        while offset < data.len() {
            let rest = &data[offset..];
            match SegmentRecord::peek_len(rest) {
                Some(len) if len > 0 && len <= rest.len() => {
                    let record = SegmentRecord::decode(rest)?;
                    scan.records.push((offset as u64, record));
                    offset += len;
                }
                _ => break,
            }
        }
        scan.valid_len = offset as u64;
        Ok(scan)
    }

    /// Rewrites the log to contain exactly `records` and returns their new offsets.
    pub fn rewrite(&self, records: &[SegmentRecord]) -> DbResult<Vec<u64>> {
        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            offsets.push(data.len() as u64);
            data.extend_from_slice(&record.encode()?);
        }
        let mut backend = self.backend.write();
        backend.replace_contents(&data)?;
        backend.sync()?;
        Ok(offsets)
    }

    /// Drops everything after `len`.
    pub fn truncate(&self, len: u64) -> DbResult<()> {
        Ok(self.backend.write().truncate(len)?)
    }

    /// Hands buffered appends to the OS.
    pub fn flush(&self) -> DbResult<()> {
        Ok(self.backend.write().flush()?)
    }

    /// Forces the log to stable storage.
    pub fn sync(&self) -> DbResult<()> {
        Ok(self.backend.write().sync()?)
    }

    /// Current size in bytes.
    pub fn size(&self) -> DbResult<u64> {
        Ok(self.backend.read().size()?)
    }
}

impl std::fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStore")
            .field("size", &self.size().ok())
            .finish()
    }
}
