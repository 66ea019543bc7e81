//! Collections: document mutation, conflict handling, indexes and listeners.

use crate::database::DbInner;
use crate::document::Document;
use crate::error::{DbError, DbResult};
use crate::index::IndexSpec;
use crate::notify::{ChangeKind, CollectionChange, DocumentChange, Executor, ListenerToken, Target};
use crate::segment::{encode_body, SegmentRecord};
use crate::transaction::{StoredState, Transaction};
use crate::types::{expiration_millis, from_millis, CollectionId, Revision};
use serde_json::{Map, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// What to do when a write finds a stored revision other than the one the
/// caller's document was read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyControl {
    /// Overwrite the stored version.
    #[default]
    LastWriteWins,
    /// Fail with [`DbError::Conflict`].
    FailOnConflict,
}

/// Decides a conflicting save or delete.
///
/// Called inside the write transaction with the caller's document and the
/// stored one (`None` when the stored version is a deletion). Edits to
/// `mine` are what gets written. Returning `false` abandons the write.
///
/// A resolver must not write to the database; such writes fail with
/// `InvalidOperation` and so does the write being resolved.
///
/// Closures with the matching signature are resolvers:
///
/// ```rust
/// use shelfdb_core::{Database, Document};
///
/// let db = Database::open_in_memory().unwrap();
/// let coll = db.default_collection().unwrap();
/// let mut doc = Document::with_id("doc1");
/// doc.set("n", 1);
/// coll.save(&mut doc).unwrap();
///
/// let mut stale = Document::with_id("doc1");
/// stale.set("n", 2);
/// let saved = coll
///     .save_with_resolver(&mut stale, |mine: &mut Document, theirs: Option<&Document>| {
///         let theirs = theirs.and_then(|d| d.get("n")).and_then(|v| v.as_i64()).unwrap_or(0);
///         let mine_n = mine.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
///         mine.set("n", theirs + mine_n);
///         true
///     })
///     .unwrap();
/// assert!(saved);
/// assert_eq!(coll.document("doc1").unwrap().unwrap().get("n"), Some(&3.into()));
/// ```
pub trait ConflictResolver {
    /// Returns whether to write `mine`.
    fn resolve(&mut self, mine: &mut Document, theirs: Option<&Document>) -> bool;
}

impl<F> ConflictResolver for F
where
    F: FnMut(&mut Document, Option<&Document>) -> bool,
{
    fn resolve(&mut self, mine: &mut Document, theirs: Option<&Document>) -> bool {
        self(mine, theirs)
    }
}

enum Policy<'a> {
    Control(ConcurrencyControl),
    Resolver(&'a mut dyn ConflictResolver),
}

/// Outcome of checking a write against the stored state.
enum Decision {
    Proceed,
    Abandon,
}

/// A handle to one collection.
///
/// Handles are cheap to clone. Once the collection is deleted every call
/// fails with `NotFound`, and once the database closes with `NotOpen`.
#[derive(Clone)]
pub struct Collection {
    db: Arc<DbInner>,
    id: CollectionId,
    scope: String,
    name: String,
}

impl Collection {
    pub(crate) fn new(db: Arc<DbInner>, id: CollectionId, scope: String, name: String) -> Self {
        Self {
            db,
            id,
            scope,
            name,
        }
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the scope holding this collection.
    #[must_use]
    pub fn scope_name(&self) -> &str {
        &self.scope
    }

    /// Fully qualified `scope.name`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.scope, self.name)
    }

    fn check(&self) -> DbResult<()> {
        self.db.check_open()?;
        if self.db.manifest.read().is_live(self.id) {
            Ok(())
        } else {
            Err(DbError::not_found(format!("collection {}", self.full_name())))
        }
    }

    /// Runs `op` in the write transaction after re-checking the handle.
    fn write<R>(&self, op: impl FnOnce(&mut Transaction) -> DbResult<R>) -> DbResult<R> {
        self.db.check_open()?;
        self.db.txns.write(|txn| {
            self.check()?;
            op(txn)
        })
    }

    /// Stored state of `id`, seen through `txn` when given.
    fn current(&self, txn: Option<&Transaction>, id: &str) -> DbResult<Option<StoredState>> {
        if let Some(pending) = txn.and_then(|t| t.pending(self.id, id)) {
            return Ok(pending);
        }
        Ok(self.db.store.read(self.id, id)?.map(|(meta, body)| StoredState {
            revision: meta.revision,
            deleted: meta.deleted,
            expiration: meta.expiration,
            body,
        }))
    }

    /// Committed state of `id`, plus what this thread's open batch staged.
    fn visible(&self, id: &str) -> DbResult<Option<StoredState>> {
        match self.db.txns.with_open(|txn| txn.pending(self.id, id)) {
            Some(Some(pending)) => Ok(pending),
            _ => self.current(None, id),
        }
    }

    fn stored_document(&self, id: &str, state: StoredState) -> Document {
        Document::stored(
            id.to_owned(),
            state.body,
            state.revision,
            state.deleted,
            state.expiration.map(from_millis),
        )
    }

    // ----- documents -----

    /// Reads a live document.
    ///
    /// Inside a batch this also sees what the batch has staged.
    ///
    /// # Errors
    ///
    /// `NotOpen`, `NotFound` for a deleted collection, or storage faults.
    pub fn document(&self, id: &str) -> DbResult<Option<Document>> {
        self.check()?;
        Ok(self
            .visible(id)?
            .filter(|s| !s.deleted)
            .map(|s| self.stored_document(id, s)))
    }

    /// Number of live documents as of the last commit.
    ///
    /// # Errors
    ///
    /// `NotOpen` or `NotFound` for a deleted collection.
    pub fn count(&self) -> DbResult<u64> {
        self.check()?;
        Ok(self.db.store.live_count(self.id))
    }

    /// Ids of live documents as of the last commit, sorted.
    ///
    /// # Errors
    ///
    /// `NotOpen` or `NotFound` for a deleted collection.
    pub fn document_ids(&self) -> DbResult<Vec<String>> {
        self.check()?;
        Ok(self.db.store.live_ids(self.id))
    }

    /// Saves with [`ConcurrencyControl::LastWriteWins`].
    ///
    /// # Errors
    ///
    /// See [`save_with`](Self::save_with).
    pub fn save(&self, doc: &mut Document) -> DbResult<()> {
        self.save_with(doc, ConcurrencyControl::LastWriteWins)
    }

    /// Saves a document, updating its revision on success.
    ///
    /// # Errors
    ///
    /// `Conflict` under `FailOnConflict` when the stored revision differs;
    /// `NotOpen`, `NotFound` for a deleted collection, or storage faults.
    pub fn save_with(&self, doc: &mut Document, control: ConcurrencyControl) -> DbResult<()> {
        self.save_inner(doc, Policy::Control(control)).map(|_| ())
    }

    /// Saves a document, letting `resolver` decide a conflict.
    ///
    /// Returns `Ok(false)` when the resolver declined; nothing is written.
    ///
    /// # Errors
    ///
    /// `ResolverFailure` if the resolver panics, `InvalidOperation` if it
    /// tried to write, plus the errors of [`save_with`](Self::save_with).
    pub fn save_with_resolver(
        &self,
        doc: &mut Document,
        mut resolver: impl ConflictResolver,
    ) -> DbResult<bool> {
        self.save_inner(doc, Policy::Resolver(&mut resolver))
    }

    fn save_inner(&self, doc: &mut Document, mut policy: Policy<'_>) -> DbResult<bool> {
        self.write(|txn| {
            let current = self.current(Some(txn), doc.id())?;
            let matches = match (doc.revision(), &current) {
                (_, None) => true,
                (None, Some(stored)) => stored.deleted,
                (Some(rev), Some(stored)) => rev == stored.revision,
            };
            if !matches {
                if let Decision::Abandon = self.resolve(doc, current.as_ref(), &mut policy)? {
                    return Ok(false);
                }
            }

            let sequence = txn.sequence();
            let revision = Revision::at(sequence);
            let expiration = current.as_ref().and_then(|s| s.expiration);
            let record = SegmentRecord::document(
                self.id,
                doc.id(),
                sequence,
                revision,
                expiration,
                encode_body(doc.body())?,
            );
            let kind = if current.as_ref().is_some_and(|s| !s.deleted) {
                ChangeKind::Updated
            } else {
                ChangeKind::Inserted
            };
            for blob in doc.take_pending_blobs() {
                txn.stage_blob(blob);
            }
            txn.stage(record, doc.body().clone(), Some(kind));
            doc.mark_saved(revision, false);
            Ok(true)
        })
    }

    /// Applies `policy` to a write whose revision does not match.
    fn resolve(
        &self,
        doc: &mut Document,
        current: Option<&StoredState>,
        policy: &mut Policy<'_>,
    ) -> DbResult<Decision> {
        self.db.stats.record_conflict();
        match policy {
            Policy::Control(ConcurrencyControl::LastWriteWins) => Ok(Decision::Proceed),
            Policy::Control(ConcurrencyControl::FailOnConflict) => {
                debug!(collection = %self.full_name(), id = doc.id(), "write conflict");
                Err(DbError::conflict(doc.id()))
            }
            Policy::Resolver(resolver) => {
                let theirs = current
                    .filter(|s| !s.deleted)
                    .map(|s| self.stored_document(doc.id(), s.clone()));
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    resolver.resolve(doc, theirs.as_ref())
                }));
                match outcome {
                    Ok(true) => Ok(Decision::Proceed),
                    Ok(false) => {
                        self.db.stats.record_unresolved();
                        Ok(Decision::Abandon)
                    }
                    Err(payload) => Err(DbError::resolver_failure(panic_message(&*payload))),
                }
            }
        }
    }

    /// Deletes with [`ConcurrencyControl::LastWriteWins`].
    ///
    /// # Errors
    ///
    /// See [`delete_with`](Self::delete_with).
    pub fn delete(&self, doc: &mut Document) -> DbResult<()> {
        self.delete_with(doc, ConcurrencyControl::LastWriteWins)
    }

    /// Replaces a document with a tombstone.
    ///
    /// # Errors
    ///
    /// `NotFound` if there is no live stored version, `Conflict` under
    /// `FailOnConflict` when the stored revision differs.
    pub fn delete_with(&self, doc: &mut Document, control: ConcurrencyControl) -> DbResult<()> {
        self.delete_inner(doc, Policy::Control(control)).map(|_| ())
    }

    /// Deletes a document, letting `resolver` decide a conflict.
    ///
    /// # Errors
    ///
    /// As for [`delete_with`](Self::delete_with) and
    /// [`save_with_resolver`](Self::save_with_resolver).
    pub fn delete_with_resolver(
        &self,
        doc: &mut Document,
        mut resolver: impl ConflictResolver,
    ) -> DbResult<bool> {
        self.delete_inner(doc, Policy::Resolver(&mut resolver))
    }

    fn delete_inner(&self, doc: &mut Document, mut policy: Policy<'_>) -> DbResult<bool> {
        self.write(|txn| {
            let current = self.current(Some(txn), doc.id())?;
            let Some(stored) = current.filter(|s| !s.deleted) else {
                return Err(DbError::not_found(format!("document {:?}", doc.id())));
            };
            if doc.revision() != Some(stored.revision) {
                if let Decision::Abandon = self.resolve(doc, Some(&stored), &mut policy)? {
                    return Ok(false);
                }
            }

            let sequence = txn.sequence();
            let revision = Revision::at(sequence);
            let record =
                SegmentRecord::tombstone(self.id, doc.id(), sequence, revision, stored.expiration);
            txn.stage(record, Map::new(), Some(ChangeKind::Deleted));
            doc.mark_saved(revision, true);
            Ok(true)
        })
    }

    /// Removes every trace of a document, tombstone included. Listeners see
    /// [`ChangeKind::Purged`].
    ///
    /// # Errors
    ///
    /// `NotFound` if nothing is stored under `id`.
    pub fn purge(&self, id: &str) -> DbResult<()> {
        self.write(|txn| {
            if self.current(Some(txn), id)?.is_none() {
                return Err(DbError::not_found(format!("document {id:?}")));
            }
            let record = SegmentRecord::purge(self.id, id, txn.sequence());
            txn.stage(record, Map::new(), Some(ChangeKind::Purged));
            Ok(())
        })?;
        self.db.stats.record_purge();
        Ok(())
    }

    /// Sets or clears when a document expires. The revision is unchanged
    /// and listeners are not told.
    ///
    /// # Errors
    ///
    /// `NotFound` if there is no live document `id`.
    pub fn set_expiration(&self, id: &str, expiration: Option<SystemTime>) -> DbResult<()> {
        self.write(|txn| {
            let Some(stored) = self.current(Some(txn), id)?.filter(|s| !s.deleted) else {
                return Err(DbError::not_found(format!("document {id:?}")));
            };
            let record = SegmentRecord::document(
                self.id,
                id,
                txn.sequence(),
                stored.revision,
                expiration.map(expiration_millis),
                encode_body(&stored.body)?,
            );
            txn.stage(record, stored.body, None);
            Ok(())
        })
    }

    /// When a live document expires, if ever.
    ///
    /// # Errors
    ///
    /// `NotFound` if there is no live document `id`.
    pub fn expiration(&self, id: &str) -> DbResult<Option<SystemTime>> {
        self.check()?;
        match self.visible(id)? {
            Some(stored) if !stored.deleted => Ok(stored.expiration.map(from_millis)),
            _ => Err(DbError::not_found(format!("document {id:?}"))),
        }
    }

    // ----- indexes -----

    /// Creates or replaces an index.
    ///
    /// Creating an index identical to an existing one is a no-op. A
    /// replacement swaps in atomically with respect to readers.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty name or spec, `Busy` inside a batch.
    pub fn create_index(&self, name: &str, spec: IndexSpec) -> DbResult<()> {
        if name.is_empty() {
            return Err(DbError::invalid_argument("index name must not be empty"));
        }
        spec.validate()?;
        self.db.txns.exclusive("change indexes", || {
            self.check()?;
            let mut manifest = self.db.manifest.write();
            let entry = manifest
                .find_mut(&self.scope, &self.name)
                .ok_or_else(|| DbError::not_found(format!("collection {}", self.full_name())))?;
            if entry.indexes.get(name) == Some(&spec) {
                return Ok(());
            }
            let table = self.db.store.build_index(self.id, spec.clone())?;
            entry.indexes.insert(name.to_owned(), spec);
            self.db.persist_manifest(&manifest)?;
            self.db.store.install_index(self.id, name, table);
            debug!(collection = %self.full_name(), index = name, "index created");
            Ok(())
        })
    }

    /// Deletes an index; absent indexes are ignored.
    ///
    /// # Errors
    ///
    /// `Busy` inside a batch.
    pub fn delete_index(&self, name: &str) -> DbResult<()> {
        self.db.txns.exclusive("change indexes", || {
            self.check()?;
            let mut manifest = self.db.manifest.write();
            let removed = manifest
                .find_mut(&self.scope, &self.name)
                .and_then(|entry| entry.indexes.remove(name))
                .is_some();
            if removed {
                self.db.persist_manifest(&manifest)?;
                self.db.store.remove_index(self.id, name);
            }
            Ok(())
        })
    }

    /// Names of this collection's indexes, sorted.
    ///
    /// # Errors
    ///
    /// `NotOpen` or `NotFound` for a deleted collection.
    pub fn indexes(&self) -> DbResult<Vec<String>> {
        self.check()?;
        Ok(self
            .db
            .manifest
            .read()
            .find(&self.scope, &self.name)
            .map(|e| e.indexes.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// The spec of one index.
    ///
    /// # Errors
    ///
    /// `NotFound` if there is no such index.
    pub fn index(&self, name: &str) -> DbResult<IndexSpec> {
        self.check()?;
        self.db
            .store
            .index_spec(self.id, name)
            .ok_or_else(|| DbError::not_found(format!("index {name:?}")))
    }

    /// Ids of committed documents matching `key`, sorted.
    ///
    /// A value index takes one value per indexed path; a full-text index
    /// takes one string, all of whose words must match.
    ///
    /// # Errors
    ///
    /// `NotFound` if there is no such index, `InvalidArgument` for a key of
    /// the wrong shape.
    pub fn index_lookup(&self, name: &str, key: &[Value]) -> DbResult<Vec<String>> {
        self.check()?;
        self.db
            .store
            .index_lookup(self.id, name, key)?
            .ok_or_else(|| DbError::not_found(format!("index {name:?}")))
    }

    // ----- listeners -----

    fn target<'a>(&'a self, document: Option<&'a str>) -> Target<'a> {
        Target {
            collection: self.id,
            scope: &self.scope,
            name: &self.name,
            document,
        }
    }

    /// Calls `listener` once per commit that changes this collection,
    /// on the database's executor.
    ///
    /// # Errors
    ///
    /// `NotOpen` or `NotFound` for a deleted collection.
    pub fn add_change_listener<F>(&self, listener: F) -> DbResult<ListenerToken>
    where
        F: Fn(&CollectionChange) + Send + Sync + 'static,
    {
        self.add_change_listener_with_executor(Arc::clone(&self.db.executor), listener)
    }

    /// Like [`add_change_listener`](Self::add_change_listener) with an
    /// explicit executor.
    ///
    /// # Errors
    ///
    /// `NotOpen` or `NotFound` for a deleted collection.
    pub fn add_change_listener_with_executor<F>(
        &self,
        executor: Arc<dyn Executor>,
        listener: F,
    ) -> DbResult<ListenerToken>
    where
        F: Fn(&CollectionChange) + Send + Sync + 'static,
    {
        self.check()?;
        Ok(self
            .db
            .bus
            .add_collection_listener(self.target(None), executor, Box::new(listener)))
    }

    /// Calls `listener` once per commit that changes document `id`.
    ///
    /// # Errors
    ///
    /// `NotOpen` or `NotFound` for a deleted collection.
    pub fn add_document_change_listener<F>(&self, id: &str, listener: F) -> DbResult<ListenerToken>
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.add_document_change_listener_with_executor(id, Arc::clone(&self.db.executor), listener)
    }

    /// Like [`add_document_change_listener`](Self::add_document_change_listener)
    /// with an explicit executor.
    ///
    /// # Errors
    ///
    /// `NotOpen` or `NotFound` for a deleted collection.
    pub fn add_document_change_listener_with_executor<F>(
        &self,
        id: &str,
        executor: Arc<dyn Executor>,
        listener: F,
    ) -> DbResult<ListenerToken>
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.check()?;
        Ok(self
            .db
            .bus
            .add_document_listener(self.target(Some(id)), executor, Box::new(listener)))
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("scope", &self.scope)
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.db, &other.db)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "resolver panicked".to_owned()
    }
}
