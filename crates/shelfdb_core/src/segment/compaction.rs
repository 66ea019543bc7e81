//! Segment compaction.
//!
//! Compaction keeps, for each `(collection, document id)`, only the newest
//! record. Purge markers, records of deleted collections and (unless
//! retained) tombstones are dropped. The logical state of every live
//! collection is unchanged.

use crate::segment::record::SegmentRecord;
use crate::types::CollectionId;
use std::collections::HashMap;

/// Statistics from one compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Records read.
    pub input_records: usize,
    /// Records written.
    pub output_records: usize,
    /// Superseded versions dropped.
    pub obsolete_versions_removed: usize,
    /// Tombstones dropped.
    pub tombstones_removed: usize,
    /// Documents dropped because their collection is gone or they were purged.
    pub purged_removed: usize,
    /// Input size minus output size.
    pub bytes_saved: usize,
}

/// Merges a record log into its latest-version form.
#[derive(Debug, Clone)]
pub struct Compactor {
    keep_tombstones: bool,
}

impl Compactor {
    /// Creates a compactor; `keep_tombstones` retains deletion markers.
    #[must_use]
    pub fn new(keep_tombstones: bool) -> Self {
        Self { keep_tombstones }
    }

    /// Compacts `records`, given in log order. `is_live` says whether a
    /// collection still exists. Output is sorted by collection then id.
    pub fn compact(
        &self,
        records: Vec<SegmentRecord>,
        is_live: impl Fn(CollectionId) -> bool,
    ) -> (Vec<SegmentRecord>, CompactionResult) {
        let mut result = CompactionResult {
            input_records: records.len(),
            ..CompactionResult::default()
        };
        let input_size: usize = records.iter().map(SegmentRecord::encoded_size).sum();

        let mut latest: HashMap<(CollectionId, String), SegmentRecord> = HashMap::new();
        for record in records {
            let key = (record.collection_id, record.doc_id.clone());
            match latest.get(&key) {
                Some(existing) if existing.sequence > record.sequence => {
                    result.obsolete_versions_removed += 1;
                }
                _ => {
                    if latest.insert(key, record).is_some() {
                        result.obsolete_versions_removed += 1;
                    }
                }
            }
        }

        let mut output: Vec<SegmentRecord> = Vec::with_capacity(latest.len());
        for record in latest.into_values() {
            if record.is_purge() || !is_live(record.collection_id) {
                result.purged_removed += 1;
            } else if record.is_tombstone() && !self.keep_tombstones {
                result.tombstones_removed += 1;
            } else {
                output.push(record);
            }
        }
        output.sort_by(|a, b| {
            (a.collection_id, &a.doc_id).cmp(&(b.collection_id, &b.doc_id))
        });

        let output_size: usize = output.iter().map(SegmentRecord::encoded_size).sum();
        result.output_records = output.len();
        result.bytes_saved = input_size.saturating_sub(output_size);
        (output, result)
    }
}
