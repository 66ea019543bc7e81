//! Whole-database document calls from before scopes and collections.
//!
//! Each one forwards to the default collection.

#![allow(deprecated)]

use crate::collection::{ConcurrencyControl, ConflictResolver};
use crate::database::Database;
use crate::document::Document;
use crate::error::DbResult;
use crate::index::IndexSpec;
use crate::notify::{CollectionChange, DocumentChange, ListenerToken};
use std::time::SystemTime;

impl Database {
    /// Reads a document of the default collection.
    ///
    /// # Errors
    ///
    /// `NotFound` once the default collection is deleted.
    #[deprecated(note = "use `default_collection()?.document(id)`")]
    pub fn document(&self, id: &str) -> DbResult<Option<Document>> {
        self.default_collection()?.document(id)
    }

    /// Number of documents in the default collection.
    ///
    /// # Errors
    ///
    /// `NotFound` once the default collection is deleted.
    #[deprecated(note = "use `default_collection()?.count()`")]
    pub fn count(&self) -> DbResult<u64> {
        self.default_collection()?.count()
    }

    /// Saves into the default collection.
    ///
    /// # Errors
    ///
    /// As for [`Collection::save_with`](crate::Collection::save_with).
    #[deprecated(note = "use `default_collection()?.save_with(doc, control)`")]
    pub fn save_document(&self, doc: &mut Document, control: ConcurrencyControl) -> DbResult<()> {
        self.default_collection()?.save_with(doc, control)
    }

    /// Saves into the default collection with a conflict resolver.
    ///
    /// # Errors
    ///
    /// As for [`Collection::save_with_resolver`](crate::Collection::save_with_resolver).
    #[deprecated(note = "use `default_collection()?.save_with_resolver(doc, resolver)`")]
    pub fn save_document_with_resolver(
        &self,
        doc: &mut Document,
        resolver: impl ConflictResolver,
    ) -> DbResult<bool> {
        self.default_collection()?.save_with_resolver(doc, resolver)
    }

    /// Deletes from the default collection.
    ///
    /// # Errors
    ///
    /// As for [`Collection::delete_with`](crate::Collection::delete_with).
    #[deprecated(note = "use `default_collection()?.delete_with(doc, control)`")]
    pub fn delete_document(&self, doc: &mut Document, control: ConcurrencyControl) -> DbResult<()> {
        self.default_collection()?.delete_with(doc, control)
    }

    /// Purges from the default collection.
    ///
    /// # Errors
    ///
    /// `NotFound` if nothing is stored under `id`.
    #[deprecated(note = "use `default_collection()?.purge(id)`")]
    pub fn purge_document(&self, id: &str) -> DbResult<()> {
        self.default_collection()?.purge(id)
    }

    /// Sets the expiration of a default-collection document.
    ///
    /// # Errors
    ///
    /// `NotFound` if there is no live document `id`.
    #[deprecated(note = "use `default_collection()?.set_expiration(id, expiration)`")]
    pub fn set_document_expiration(&self, id: &str, expiration: Option<SystemTime>) -> DbResult<()> {
        self.default_collection()?.set_expiration(id, expiration)
    }

    /// Expiration of a default-collection document.
    ///
    /// # Errors
    ///
    /// `NotFound` if there is no live document `id`.
    #[deprecated(note = "use `default_collection()?.expiration(id)`")]
    pub fn document_expiration(&self, id: &str) -> DbResult<Option<SystemTime>> {
        self.default_collection()?.expiration(id)
    }

    /// Creates an index on the default collection.
    ///
    /// # Errors
    ///
    /// As for [`Collection::create_index`](crate::Collection::create_index).
    #[deprecated(note = "use `default_collection()?.create_index(name, spec)`")]
    pub fn create_index(&self, name: &str, spec: IndexSpec) -> DbResult<()> {
        self.default_collection()?.create_index(name, spec)
    }

    /// Deletes an index of the default collection.
    ///
    /// # Errors
    ///
    /// `Busy` inside a batch.
    #[deprecated(note = "use `default_collection()?.delete_index(name)`")]
    pub fn delete_index(&self, name: &str) -> DbResult<()> {
        self.default_collection()?.delete_index(name)
    }

    /// Index names of the default collection.
    ///
    /// # Errors
    ///
    /// `NotFound` once the default collection is deleted.
    #[deprecated(note = "use `default_collection()?.indexes()`")]
    pub fn indexes(&self) -> DbResult<Vec<String>> {
        self.default_collection()?.indexes()
    }

    /// Listens to the default collection.
    ///
    /// # Errors
    ///
    /// `NotFound` once the default collection is deleted.
    #[deprecated(note = "use `default_collection()?.add_change_listener(listener)`")]
    pub fn add_change_listener<F>(&self, listener: F) -> DbResult<ListenerToken>
    where
        F: Fn(&CollectionChange) + Send + Sync + 'static,
    {
        self.default_collection()?.add_change_listener(listener)
    }

    /// Listens to one default-collection document.
    ///
    /// # Errors
    ///
    /// `NotFound` once the default collection is deleted.
    #[deprecated(note = "use `default_collection()?.add_document_change_listener(id, listener)`")]
    pub fn add_document_change_listener<F>(&self, id: &str, listener: F) -> DbResult<ListenerToken>
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.default_collection()?.add_document_change_listener(id, listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_reach_the_default_collection() {
        let db = Database::open_in_memory().unwrap();
        let mut doc = Document::with_id("a");
        doc.set("k", "v");
        db.save_document(&mut doc, ConcurrencyControl::FailOnConflict)
            .unwrap();
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(
            db.default_collection().unwrap().document("a").unwrap().unwrap().get("k"),
            Some(&"v".into())
        );
        db.delete_document(&mut doc, ConcurrencyControl::LastWriteWins)
            .unwrap();
        assert!(db.document("a").unwrap().is_none());
        db.purge_document("a").unwrap();
        assert!(db.purge_document("a").unwrap_err().is_not_found());
    }

    #[test]
    fn aliases_fail_once_default_is_deleted() {
        let db = Database::open_in_memory().unwrap();
        db.delete_collection("_default", "_default").unwrap();
        assert!(db.count().unwrap_err().is_not_found());
    }
}
