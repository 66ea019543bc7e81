//! Transaction state.

use crate::blob::Blob;
use crate::error::DbError;
use crate::notify::ChangeKind;
use crate::segment::SegmentRecord;
use crate::types::{CollectionId, Revision, SequenceNumber, TransactionId};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// The state of one document as a transaction sees it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredState {
    pub revision: Revision,
    pub deleted: bool,
    pub expiration: Option<u64>,
    pub body: Map<String, Value>,
}

/// A staged record, plus what it means for listeners.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub record: SegmentRecord,
    pub body: Map<String, Value>,
    /// `None` for writes listeners never hear about, like expiration changes.
    pub change: Option<ChangeKind>,
}

/// A write transaction.
///
/// Holds at most one staged record per document; staging a second write to
/// the same document replaces the first in place so commit order follows
/// first touch.
#[derive(Debug)]
pub(crate) struct Transaction {
    id: TransactionId,
    sequence: SequenceNumber,
    writes: Vec<PendingWrite>,
    positions: HashMap<(CollectionId, String), usize>,
    blobs: Vec<Blob>,
    failure: Option<String>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, sequence: SequenceNumber) -> Self {
        Self {
            id,
            sequence,
            writes: Vec::new(),
            positions: HashMap::new(),
            blobs: Vec::new(),
            failure: None,
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    /// Sequence the transaction commits at.
    pub(crate) fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// The staged state of a document, if this transaction wrote it.
    ///
    /// `Some(None)` means the transaction purged it.
    pub(crate) fn pending(&self, collection: CollectionId, id: &str) -> Option<Option<StoredState>> {
        let pos = self.positions.get(&(collection, id.to_owned()))?;
        let write = &self.writes[*pos];
        if write.record.is_purge() {
            return Some(None);
        }
        Some(Some(StoredState {
            revision: write.record.revision,
            deleted: write.record.is_tombstone(),
            expiration: write.record.expiration,
            body: write.body.clone(),
        }))
    }

    pub(crate) fn stage(
        &mut self,
        record: SegmentRecord,
        body: Map<String, Value>,
        change: Option<ChangeKind>,
    ) {
        let key = (record.collection_id, record.doc_id.clone());
        if let Some(&pos) = self.positions.get(&key) {
            let write = &mut self.writes[pos];
            write.record = record;
            write.body = body;
            // Listeners compare against the state before the transaction:
            // a document created here stays an insert however often it is
            // saved again.
            write.change = match (write.change, change) {
                (Some(ChangeKind::Inserted), Some(ChangeKind::Updated)) => Some(ChangeKind::Inserted),
                (earlier, None) => earlier,
                (_, later) => later,
            };
        } else {
            self.positions.insert(key, self.writes.len());
            self.writes.push(PendingWrite {
                record,
                body,
                change,
            });
        }
    }

    pub(crate) fn stage_blob(&mut self, blob: Blob) {
        if !self.blobs.iter().any(|b| b.digest() == blob.digest()) {
            self.blobs.push(blob);
        }
    }

    /// Records the first failure; the transaction will roll back.
    pub(crate) fn fail(&mut self, err: &DbError) {
        if self.failure.is_none() {
            self.failure = Some(err.to_string());
        }
    }

    pub(crate) fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub(crate) fn into_parts(self) -> (Vec<PendingWrite>, Vec<Blob>) {
        (self.writes, self.blobs)
    }
}
