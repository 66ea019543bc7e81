//! Document store: the segment log plus its in-memory index.
//!
//! The index maps `(collection, document id)` to the offset and metadata of
//! the newest record. Commits update the log, the key index and the
//! secondary index tables under one write lock, so readers always see the
//! state of some commit boundary and never a partial commit.

use crate::blob;
use crate::error::{DbError, DbResult};
use crate::index::{IndexSpec, IndexTable};
use crate::segment::{
    decode_body, AppendError, CompactionResult, Compactor, SegmentRecord, SegmentStore,
};
use crate::stats::StoreStatistics;
use crate::types::{CollectionId, Revision, SequenceNumber};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Metadata of the newest record for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DocMeta {
    pub offset: u64,
    pub sequence: SequenceNumber,
    pub revision: Revision,
    pub deleted: bool,
    pub expiration: Option<u64>,
}

#[derive(Debug, Default)]
struct StoreState {
    docs: HashMap<CollectionId, HashMap<String, DocMeta>>,
    indexes: HashMap<CollectionId, BTreeMap<String, IndexTable>>,
    max_sequence: SequenceNumber,
}

impl StoreState {
    /// Updates the key index for a record written at `offset`.
    fn index_record(&mut self, offset: u64, record: &SegmentRecord) {
        self.max_sequence = self.max_sequence.max(record.sequence);
        let docs = self.docs.entry(record.collection_id).or_default();
        if record.is_purge() {
            docs.remove(&record.doc_id);
        } else {
            docs.insert(
                record.doc_id.clone(),
                DocMeta {
                    offset,
                    sequence: record.sequence,
                    revision: record.revision,
                    deleted: record.is_tombstone(),
                    expiration: record.expiration,
                },
            );
        }
    }

    /// Decodes the body an index update needs, if the collection has any
    /// index tables and the record carries a live document.
    fn index_body(&self, record: &SegmentRecord) -> DbResult<Option<Map<String, Value>>> {
        let indexed = self
            .indexes
            .get(&record.collection_id)
            .is_some_and(|tables| !tables.is_empty());
        if !indexed || record.is_purge() || record.is_tombstone() {
            return Ok(None);
        }
        decode_body(&record.payload).map(Some)
    }

    fn update_indexes(&mut self, record: &SegmentRecord, body: Option<&Map<String, Value>>) {
        if let Some(tables) = self.indexes.get_mut(&record.collection_id) {
            for table in tables.values_mut() {
                table.update(&record.doc_id, body);
            }
        }
    }
}

/// What `load` found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct LoadReport {
    pub records: usize,
    pub torn_bytes: u64,
    pub skipped_dead: usize,
}

/// Result of an integrity check.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct IntegrityReport {
    /// Records verified in the segment log.
    pub records: u64,
    /// Index entries checked against their records.
    pub documents: u64,
    /// Index tables checked.
    pub index_tables: u64,
}

/// The durable document store.
pub(crate) struct DocumentStore {
    segments: SegmentStore,
    state: RwLock<StoreState>,
}

impl DocumentStore {
    pub(crate) fn new(segments: SegmentStore) -> Self {
        Self {
            segments,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Rebuilds the key index from the segment log, dropping a torn tail and
    /// records of collections `is_live` rejects.
    pub(crate) fn load(&self, is_live: impl Fn(CollectionId) -> bool) -> DbResult<LoadReport> {
        let scan = self.segments.scan()?;
        let mut report = LoadReport::default();
        if scan.has_torn_tail() {
            report.torn_bytes = scan.size - scan.valid_len;
            warn!(bytes = report.torn_bytes, "discarding torn segment tail");
            self.segments.truncate(scan.valid_len)?;
        }
        let mut state = self.state.write();
        *state = StoreState::default();
        for (offset, record) in &scan.records {
            state.max_sequence = state.max_sequence.max(record.sequence);
            if is_live(record.collection_id) {
                state.index_record(*offset, record);
                report.records += 1;
            } else {
                report.skipped_dead += 1;
            }
        }
        Ok(report)
    }

    /// Appends committed records and updates every in-memory structure.
    ///
    /// Nothing becomes visible unless the whole append succeeded.
    pub(crate) fn apply(&self, records: &[SegmentRecord]) -> Result<(), AppendError> {
        let mut state = self.state.write();
        let bodies = records
            .iter()
            .map(|record| state.index_body(record))
            .collect::<DbResult<Vec<_>>>()
            .map_err(|error| AppendError { error, torn: false })?;
        let offsets = self.segments.append_all(records)?;
        for ((record, offset), body) in records.iter().zip(offsets).zip(&bodies) {
            state.index_record(offset, record);
            state.update_indexes(record, body.as_ref());
        }
        Ok(())
    }

    pub(crate) fn max_sequence(&self) -> SequenceNumber {
        self.state.read().max_sequence
    }

    pub(crate) fn meta(&self, collection: CollectionId, id: &str) -> Option<DocMeta> {
        self.state
            .read()
            .docs
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .copied()
    }

    /// Reads metadata and body of the newest record for a key.
    pub(crate) fn read(
        &self,
        collection: CollectionId,
        id: &str,
    ) -> DbResult<Option<(DocMeta, Map<String, Value>)>> {
        let state = self.state.read();
        let Some(meta) = state.docs.get(&collection).and_then(|d| d.get(id)).copied() else {
            return Ok(None);
        };
        let record = self.segments.read_at(meta.offset)?;
        if record.collection_id != collection || record.doc_id != id {
            return Err(DbError::corruption(format!(
                "index entry for {id:?} points at a record for {:?}",
                record.doc_id
            )));
        }
        Ok(Some((meta, decode_body(&record.payload)?)))
    }

    /// Ids of live documents, sorted.
    pub(crate) fn live_ids(&self, collection: CollectionId) -> Vec<String> {
        let state = self.state.read();
        let mut ids: Vec<String> = state
            .docs
            .get(&collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, m)| !m.deleted)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub(crate) fn live_count(&self, collection: CollectionId) -> u64 {
        self.state
            .read()
            .docs
            .get(&collection)
            .map_or(0, |docs| docs.values().filter(|m| !m.deleted).count() as u64)
    }

    /// Keys of every stored record (live or tombstone) expiring at or before `now_ms`.
    pub(crate) fn expired(&self, now_ms: u64) -> Vec<(CollectionId, String)> {
        let state = self.state.read();
        let mut out: Vec<(CollectionId, String)> = state
            .docs
            .iter()
            .flat_map(|(cid, docs)| {
                docs.iter()
                    .filter(|(_, m)| m.expiration.is_some_and(|e| e <= now_ms))
                    .map(move |(id, _)| (*cid, id.clone()))
            })
            .collect();
        out.sort();
        out
    }

    /// Earliest expiration across the store.
    pub(crate) fn next_expiration(&self) -> Option<u64> {
        self.state
            .read()
            .docs
            .values()
            .flat_map(HashMap::values)
            .filter_map(|m| m.expiration)
            .min()
    }

    /// Forgets a deleted collection's documents and indexes.
    pub(crate) fn drop_collection(&self, collection: CollectionId) {
        let mut state = self.state.write();
        state.docs.remove(&collection);
        state.indexes.remove(&collection);
    }

    /// Builds a table for `spec` over the collection's live documents.
    pub(crate) fn build_index(&self, collection: CollectionId, spec: IndexSpec) -> DbResult<IndexTable> {
        let state = self.state.read();
        let mut table = IndexTable::new(spec);
        if let Some(docs) = state.docs.get(&collection) {
            for (id, meta) in docs.iter().filter(|(_, m)| !m.deleted) {
                let record = self.segments.read_at(meta.offset)?;
                table.update(id, Some(&decode_body(&record.payload)?));
            }
        }
        Ok(table)
    }

    /// Installs (or replaces) an index table.
    pub(crate) fn install_index(&self, collection: CollectionId, name: &str, table: IndexTable) {
        self.state
            .write()
            .indexes
            .entry(collection)
            .or_default()
            .insert(name.to_owned(), table);
    }

    pub(crate) fn remove_index(&self, collection: CollectionId, name: &str) -> bool {
        self.state
            .write()
            .indexes
            .get_mut(&collection)
            .is_some_and(|t| t.remove(name).is_some())
    }

    pub(crate) fn index_spec(&self, collection: CollectionId, name: &str) -> Option<IndexSpec> {
        self.state
            .read()
            .indexes
            .get(&collection)
            .and_then(|t| t.get(name))
            .map(|t| t.spec().clone())
    }

    /// Documents matching `key` in the named index, or `None` if there is no such index.
    pub(crate) fn index_lookup(
        &self,
        collection: CollectionId,
        name: &str,
        key: &[Value],
    ) -> DbResult<Option<Vec<String>>> {
        let state = self.state.read();
        let Some(table) = state.indexes.get(&collection).and_then(|t| t.get(name)) else {
            return Ok(None);
        };
        let keys = table.spec().lookup_keys(key)?;
        Ok(Some(table.lookup(&keys)))
    }

    /// Every index of every collection, for a full rebuild.
    pub(crate) fn index_specs(&self) -> Vec<(CollectionId, String, IndexSpec)> {
        let state = self.state.read();
        state
            .indexes
            .iter()
            .flat_map(|(cid, tables)| {
                tables
                    .iter()
                    .map(move |(name, t)| (*cid, name.clone(), t.spec().clone()))
            })
            .collect()
    }

    /// Rewrites the segment log with only the newest record per key.
    pub(crate) fn compact(
        &self,
        compactor: &Compactor,
        is_live: impl Fn(CollectionId) -> bool,
    ) -> DbResult<CompactionResult> {
        let mut state = self.state.write();
        let scan = self.segments.scan()?;
        let records = scan.records.into_iter().map(|(_, r)| r).collect();
        let (output, result) = compactor.compact(records, is_live);
        let offsets = self.segments.rewrite(&output)?;

        let max_sequence = state.max_sequence;
        state.docs.clear();
        for (offset, record) in offsets.into_iter().zip(&output) {
            state.index_record(offset, record);
        }
        state.max_sequence = max_sequence;
        debug!(
            input = result.input_records,
            output = result.output_records,
            bytes_saved = result.bytes_saved,
            "segment log compacted"
        );
        Ok(result)
    }

    /// Digests of every blob referenced by a live document.
    pub(crate) fn referenced_blobs(&self) -> DbResult<HashSet<String>> {
        let state = self.state.read();
        let mut digests = HashSet::new();
        for meta in state.docs.values().flat_map(HashMap::values) {
            if meta.deleted {
                continue;
            }
            let record = self.segments.read_at(meta.offset)?;
            let body = decode_body(&record.payload)?;
            blob::collect_digests(&Value::Object(body), &mut digests);
        }
        Ok(digests)
    }

    /// Verifies every record checksum, every key-index offset and every index table.
    pub(crate) fn integrity_check(&self) -> DbResult<IntegrityReport> {
        let state = self.state.read();
        let scan = self.segments.scan()?;
        if scan.has_torn_tail() {
            return Err(DbError::corruption(format!(
                "segment log has {} trailing bytes",
                scan.size - scan.valid_len
            )));
        }
        let mut report = IntegrityReport {
            records: scan.records.len() as u64,
            ..IntegrityReport::default()
        };
        for (cid, docs) in &state.docs {
            for (id, meta) in docs {
                let record = self.segments.read_at(meta.offset)?;
                if record.collection_id != *cid
                    || record.doc_id != *id
                    || record.sequence != meta.sequence
                    || record.revision != meta.revision
                {
                    return Err(DbError::corruption(format!(
                        "index entry for {id:?} in {cid} does not match its record"
                    )));
                }
                report.documents += 1;
            }
        }
        for (cid, tables) in &state.indexes {
            for (name, table) in tables {
                if !table.is_consistent() {
                    return Err(DbError::corruption(format!("index {name:?} of {cid} is inconsistent")));
                }
                report.index_tables += 1;
            }
        }
        Ok(report)
    }

    /// Statistics from the in-memory index; `full` also counts log records.
    pub(crate) fn statistics(&self, full: bool) -> DbResult<StoreStatistics> {
        let state = self.state.read();
        let mut stats = StoreStatistics {
            segment_bytes: self.segments.size()?,
            last_sequence: state.max_sequence.as_u64(),
            ..StoreStatistics::default()
        };
        for docs in state.docs.values().filter(|d| !d.is_empty()) {
            stats.collections += 1;
            for meta in docs.values() {
                if meta.deleted {
                    stats.tombstones += 1;
                } else {
                    stats.documents += 1;
                }
                if meta.expiration.is_some() {
                    stats.expiring += 1;
                }
            }
        }
        for tables in state.indexes.values() {
            stats.indexes += tables.len() as u64;
            stats.index_keys += tables.values().map(|t| t.key_count() as u64).sum::<u64>();
        }
        if full {
            stats.segment_records = Some(self.segments.scan()?.records.len() as u64);
        }
        Ok(stats)
    }

    pub(crate) fn sync(&self) -> DbResult<()> {
        self.segments.sync()
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("segments", &self.segments)
            .field("max_sequence", &self.max_sequence())
            .finish_non_exhaustive()
    }
}
