//! Database manifest: the collection registry and recovery metadata.

use crate::error::{DbError, DbResult};
use crate::index::IndexSpec;
use crate::types::CollectionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Magic bytes for manifest file.
pub(crate) const MANIFEST_MAGIC: [u8; 4] = *b"SMFN";

/// Current manifest version.
pub(crate) const MANIFEST_VERSION: u16 = 1;

/// Name of the default scope and of the default collection.
pub(crate) const DEFAULT_NAME: &str = "_default";

/// One registered collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CollectionEntry {
    pub scope: String,
    pub name: String,
    pub id: CollectionId,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexSpec>,
}

/// Database manifest.
///
/// Encoded as the magic, a little-endian version, then a CBOR body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub collections: Vec<CollectionEntry>,
    pub next_collection_id: u32,
    pub default_collection_deleted: bool,
    /// Sequence of the last commit covered by a checkpoint.
    pub last_sequence: u64,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    /// A manifest holding only the default collection.
    pub(crate) fn new() -> Self {
        Self {
            collections: vec![CollectionEntry {
                scope: DEFAULT_NAME.to_owned(),
                name: DEFAULT_NAME.to_owned(),
                id: CollectionId::new(1),
                indexes: BTreeMap::new(),
            }],
            next_collection_id: 2,
            default_collection_deleted: false,
            last_sequence: 0,
        }
    }

    pub(crate) fn find(&self, scope: &str, name: &str) -> Option<&CollectionEntry> {
        self.collections
            .iter()
            .find(|c| c.scope == scope && c.name == name)
    }

    pub(crate) fn find_mut(&mut self, scope: &str, name: &str) -> Option<&mut CollectionEntry> {
        self.collections
            .iter_mut()
            .find(|c| c.scope == scope && c.name == name)
    }

    pub(crate) fn is_live(&self, id: CollectionId) -> bool {
        self.collections.iter().any(|c| c.id == id)
    }

    /// Registers a collection and returns its new id.
    pub(crate) fn create(&mut self, scope: &str, name: &str) -> CollectionId {
        let id = CollectionId::new(self.next_collection_id);
        self.next_collection_id += 1;
        self.collections.push(CollectionEntry {
            scope: scope.to_owned(),
            name: name.to_owned(),
            id,
            indexes: BTreeMap::new(),
        });
        id
    }

    pub(crate) fn remove(&mut self, scope: &str, name: &str) -> Option<CollectionEntry> {
        let pos = self
            .collections
            .iter()
            .position(|c| c.scope == scope && c.name == name)?;
        let entry = self.collections.remove(pos);
        if scope == DEFAULT_NAME && name == DEFAULT_NAME {
            self.default_collection_deleted = true;
        }
        Some(entry)
    }

    /// Scope names holding at least one collection, plus the default scope.
    pub(crate) fn scope_names(&self) -> Vec<String> {
        let mut names = vec![DEFAULT_NAME.to_owned()];
        for entry in &self.collections {
            if !names.contains(&entry.scope) {
                names.push(entry.scope.clone());
            }
        }
        names
    }

    pub(crate) fn collections_in<'a>(
        &'a self,
        scope: &'a str,
    ) -> impl Iterator<Item = &'a CollectionEntry> + 'a {
        self.collections.iter().filter(move |c| c.scope == scope)
    }

    pub(crate) fn encode(&self) -> DbResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| DbError::codec(format!("manifest: {e}")))?;
        Ok(buf)
    }

    pub(crate) fn decode(data: &[u8]) -> DbResult<Self> {
        if data.len() < 6 || data[0..4] != MANIFEST_MAGIC {
            return Err(DbError::corruption("invalid manifest magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > MANIFEST_VERSION {
            return Err(DbError::corruption(format!(
                "unsupported manifest version: {version}"
            )));
        }
        ciborium::from_reader(&data[6..]).map_err(|e| DbError::codec(format!("manifest: {e}")))
    }
}
