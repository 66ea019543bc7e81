//! Documents.

use crate::blob::Blob;
use crate::error::{DbError, DbResult};
use crate::types::Revision;
use serde_json::{Map, Value};
use std::time::SystemTime;

/// A JSON document with an id, unique within its collection.
///
/// Documents read from a collection carry the revision they were read at.
/// Saving compares that revision with the stored one to detect conflicts,
/// and on success updates it in place.
///
/// ```rust
/// use shelfdb_core::Document;
/// use serde_json::json;
///
/// let mut doc = Document::with_id("doc1");
/// doc.set("x", 1);
/// assert_eq!(doc.get("x"), Some(&json!(1)));
/// assert!(doc.revision().is_none());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: String,
    body: Map<String, Value>,
    revision: Option<Revision>,
    deleted: bool,
    expiration: Option<SystemTime>,
    pending_blobs: Vec<Blob>,
}

impl Document {
    /// Creates an empty document with a random UUID id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Creates an empty document with the given id.
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self::with_body(id, Map::new())
    }

    /// Creates a document with the given id and body.
    #[must_use]
    pub fn with_body(id: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            body,
            revision: None,
            deleted: false,
            expiration: None,
            pending_blobs: Vec::new(),
        }
    }

    /// Creates a document from a JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `value` is not an object.
    pub fn from_json(id: impl Into<String>, value: Value) -> DbResult<Self> {
        match value {
            Value::Object(body) => Ok(Self::with_body(id, body)),
            other => Err(DbError::invalid_argument(format!(
                "document body must be an object, got {other}"
            ))),
        }
    }

    pub(crate) fn stored(
        id: String,
        body: Map<String, Value>,
        revision: Revision,
        deleted: bool,
        expiration: Option<SystemTime>,
    ) -> Self {
        Self {
            id,
            body,
            revision: Some(revision),
            deleted,
            expiration,
            pending_blobs: Vec::new(),
        }
    }

    /// The document id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Revision this document was read or last saved at; `None` if never saved.
    #[must_use]
    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    /// True for the stored state of a deleted document.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Expiration time at the moment the document was read.
    #[must_use]
    pub fn expiration(&self) -> Option<SystemTime> {
        self.expiration
    }

    /// The body.
    #[must_use]
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Mutable access to the body.
    pub fn body_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.body
    }

    /// Replaces the body.
    pub fn set_body(&mut self, body: Map<String, Value>) {
        self.body = body;
    }

    /// Returns the top-level value under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Sets a top-level value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.body.insert(key.into(), value.into());
    }

    /// Removes a top-level value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.body.remove(key)
    }

    /// Stores a blob reference under `key`; the content is written when the
    /// document is saved.
    pub fn set_blob(&mut self, key: impl Into<String>, blob: Blob) {
        self.body
            .insert(key.into(), Value::Object(blob.properties()));
        self.pending_blobs.push(blob);
    }

    /// Body as a JSON value.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(self.body.clone())
    }

    pub(crate) fn take_pending_blobs(&mut self) -> Vec<Blob> {
        std::mem::take(&mut self.pending_blobs)
    }

    pub(crate) fn pending_blobs(&self) -> &[Blob] {
        &self.pending_blobs
    }

    pub(crate) fn mark_saved(&mut self, revision: Revision, deleted: bool) {
        self.revision = Some(revision);
        self.deleted = deleted;
        self.pending_blobs.clear();
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}
