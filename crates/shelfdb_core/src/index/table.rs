//! In-memory index tables: key to document ids.

use crate::index::spec::IndexSpec;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One index's entries for one collection.
#[derive(Debug, Clone)]
pub(crate) struct IndexTable {
    spec: IndexSpec,
    entries: BTreeMap<String, BTreeSet<String>>,
    by_doc: HashMap<String, Vec<String>>,
}

impl IndexTable {
    pub(crate) fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            entries: BTreeMap::new(),
            by_doc: HashMap::new(),
        }
    }

    pub(crate) fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    /// Re-indexes `doc_id`; `None` removes it.
    pub(crate) fn update(&mut self, doc_id: &str, body: Option<&Map<String, Value>>) {
        if let Some(old) = self.by_doc.remove(doc_id) {
            for key in old {
                if let Some(ids) = self.entries.get_mut(&key) {
                    ids.remove(doc_id);
                    if ids.is_empty() {
                        self.entries.remove(&key);
                    }
                }
            }
        }
        let Some(body) = body else { return };
        let keys = self.spec.keys_for(body);
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.entries
                .entry(key.clone())
                .or_default()
                .insert(doc_id.to_owned());
        }
        self.by_doc.insert(doc_id.to_owned(), keys);
    }

    /// Ids present under every one of `keys`, sorted.
    pub(crate) fn lookup(&self, keys: &[String]) -> Vec<String> {
        let mut sets = keys.iter().map(|k| self.entries.get(k));
        let Some(Some(first)) = sets.next() else {
            return Vec::new();
        };
        let mut hits: BTreeSet<String> = first.clone();
        for set in sets {
            match set {
                Some(set) => hits.retain(|id| set.contains(id)),
                None => return Vec::new(),
            }
        }
        hits.into_iter().collect()
    }

    pub(crate) fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn document_count(&self) -> usize {
        self.by_doc.len()
    }

    /// Checks that the forward and reverse maps agree.
    pub(crate) fn is_consistent(&self) -> bool {
        let forward: usize = self.entries.values().map(BTreeSet::len).sum();
        let reverse: usize = self.by_doc.values().map(Vec::len).sum();
        forward == reverse
            && self.by_doc.iter().all(|(id, keys)| {
                keys.iter()
                    .all(|k| self.entries.get(k).is_some_and(|ids| ids.contains(id)))
            })
    }
}
