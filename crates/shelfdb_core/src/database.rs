//! Database facade and recovery.

use crate::blob::{Blob, BlobStore};
use crate::collection::Collection;
use crate::config::Config;
use crate::dir::{self, DatabaseDir};
use crate::error::{DbError, DbResult};
use crate::maintenance::MaintenanceType;
use crate::manifest::{Manifest, DEFAULT_NAME};
use crate::namespace::{scope_or_default, validate_name, Scope};
use crate::notify::{ChangeBus, DispatchQueue, Executor};
use crate::reaper::{self, Reaper};
use crate::segment::SegmentStore;
use crate::stats::{DatabaseStats, StoreStatistics};
use crate::store::DocumentStore;
use crate::transaction::TransactionManager;
use crate::types::{CollectionId, SequenceNumber};
use crate::wal::WalManager;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use shelfdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared state behind a [`Database`] and every handle derived from it.
pub(crate) struct DbInner {
    name: String,
    path: Option<PathBuf>,
    pub(crate) tombstone_retention: bool,
    dir: Mutex<Option<DatabaseDir>>,
    pub(crate) manifest: RwLock<Manifest>,
    pub(crate) store: Arc<DocumentStore>,
    pub(crate) blobs: Arc<BlobStore>,
    pub(crate) bus: Arc<ChangeBus>,
    pub(crate) stats: Arc<DatabaseStats>,
    pub(crate) txns: TransactionManager,
    pub(crate) executor: Arc<dyn Executor>,
    queue: Option<Arc<DispatchQueue>>,
    pub(crate) statistics: RwLock<StoreStatistics>,
    open: AtomicBool,
    reaper: Mutex<Option<Reaper>>,
}

/// Storage pieces a database is assembled from.
struct Parts {
    dir: Option<DatabaseDir>,
    manifest: Manifest,
    segments: Box<dyn StorageBackend>,
    wal: Box<dyn StorageBackend>,
    blobs: BlobStore,
}

impl DbInner {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> DbResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DbError::NotOpen)
        }
    }

    /// Writes the manifest to disk; a no-op in memory.
    pub(crate) fn persist_manifest(&self, manifest: &Manifest) -> DbResult<()> {
        match self.dir.lock().as_ref() {
            Some(dir) => dir.save_manifest(manifest),
            None => Ok(()),
        }
    }

    pub(crate) fn live_collections(&self) -> HashSet<CollectionId> {
        self.manifest.read().collections.iter().map(|c| c.id).collect()
    }

    pub(crate) fn checkpoint(&self) -> DbResult<()> {
        self.txns.checkpoint(|sequence| {
            let mut manifest = self.manifest.write();
            manifest.last_sequence = sequence.as_u64();
            self.persist_manifest(&manifest)
        })
    }

    pub(crate) fn collections(self: &Arc<Self>, scope: &str) -> DbResult<Vec<Collection>> {
        self.check_open()?;
        let scope = scope_or_default(scope);
        Ok(self
            .manifest
            .read()
            .collections_in(scope)
            .map(|e| Collection::new(Arc::clone(self), e.id, e.scope.clone(), e.name.clone()))
            .collect())
    }

    pub(crate) fn collection(self: &Arc<Self>, name: &str, scope: &str) -> DbResult<Collection> {
        self.check_open()?;
        let scope = scope_or_default(scope);
        let manifest = self.manifest.read();
        let entry = manifest
            .find(scope, name)
            .ok_or_else(|| DbError::not_found(format!("collection {scope}.{name}")))?;
        Ok(Collection::new(
            Arc::clone(self),
            entry.id,
            entry.scope.clone(),
            entry.name.clone(),
        ))
    }

    /// Tears the database down: reaper, writers, notifications, storage.
    pub(crate) fn close(&self) -> DbResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.txns.exclusive("close the database", || Ok(()))?;
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.stop();
        }
        let closing = self
            .txns
            .exclusive("close the database", || Ok(self.open.swap(false, Ordering::SeqCst)))?;
        if !closing {
            return Ok(());
        }

        self.bus.close();
        if let Some(queue) = &self.queue {
            queue.shutdown();
        }
        let result = self.checkpoint();
        self.dir.lock().take();
        info!(name = %self.name, "database closed");
        result
    }
}

/// An open database.
///
/// Dropping the handle closes the database. [`Collection`] and [`Scope`]
/// handles keep working until then and fail with `NotOpen` afterwards.
///
/// ```rust
/// use shelfdb_core::{Database, Document};
///
/// let db = Database::open_in_memory().unwrap();
/// let users = db.create_collection("users", "app").unwrap();
///
/// let mut doc = Document::with_id("u1");
/// doc.set("name", "Ada");
/// users.save(&mut doc).unwrap();
///
/// assert_eq!(users.count().unwrap(), 1);
/// db.close().unwrap();
/// ```
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Opens (or creates) the database `name` under `config.directory`.
    ///
    /// The database lives in `<directory>/<name>.shelfdb`. Committed
    /// transactions found in the write-ahead log are replayed and torn tails
    /// are discarded.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a bad name, `NotFound` if it is missing and
    /// `create_if_missing` is off, `Busy` if it is already open, `Corruption`
    /// or `ChecksumMismatch` for damaged files.
    pub fn open(name: &str, config: Config) -> DbResult<Self> {
        validate_db_name(name)?;
        let path = dir::bundle_path(&config.directory, name);
        let db_dir = DatabaseDir::open(&path, config.create_if_missing)?;
        let (manifest, fresh) = match db_dir.load_manifest()? {
            Some(manifest) => (manifest, false),
            None => (Manifest::new(), true),
        };
        if fresh {
            db_dir.save_manifest(&manifest)?;
        }
        let parts = Parts {
            segments: Box::new(FileBackend::open(&db_dir.segment_path())?),
            wal: Box::new(FileBackend::open(&db_dir.wal_path())?),
            blobs: BlobStore::directory(db_dir.blobs_path())?,
            manifest,
            dir: Some(db_dir),
        };
        Self::assemble(name, Some(path), parts, config)
    }

    /// Opens a fresh database that lives only in memory.
    ///
    /// # Errors
    ///
    /// Only if the notification or reaper thread cannot be started.
    pub fn open_in_memory() -> DbResult<Self> {
        Self::open_in_memory_with_config(Config::default())
    }

    /// Like [`open_in_memory`](Self::open_in_memory) with explicit settings.
    ///
    /// # Errors
    ///
    /// Only if the notification or reaper thread cannot be started.
    pub fn open_in_memory_with_config(config: Config) -> DbResult<Self> {
        let parts = Parts {
            dir: None,
            manifest: Manifest::new(),
            segments: Box::new(InMemoryBackend::new()),
            wal: Box::new(InMemoryBackend::new()),
            blobs: BlobStore::in_memory(),
        };
        Self::assemble("memory", None, parts, config)
    }

    fn assemble(name: &str, path: Option<PathBuf>, parts: Parts, config: Config) -> DbResult<Self> {
        let Parts {
            dir,
            manifest,
            segments,
            wal,
            blobs,
        } = parts;

        let store = Arc::new(DocumentStore::new(SegmentStore::new(segments)));
        let loaded = store.load(|id| manifest.is_live(id))?;

        let mut wal = WalManager::new(wal, config.sync_on_commit);
        let recovery = wal.recover()?;
        if recovery.valid_len < recovery.size {
            warn!(
                bytes = recovery.size - recovery.valid_len,
                "discarding torn WAL tail"
            );
            wal.truncate(recovery.valid_len)?;
        }
        let segment_max = store.max_sequence();
        let mut last = segment_max.max(SequenceNumber::new(manifest.last_sequence));
        let mut replayed = 0usize;
        for txn in &recovery.committed {
            last = last.max(txn.sequence);
            if txn.sequence < segment_max {
                continue;
            }
            let records: Vec<_> = txn
                .records
                .iter()
                .filter(|r| manifest.is_live(r.collection_id))
                .cloned()
                .collect();
            store.apply(&records)?;
            replayed += 1;
        }

        for entry in &manifest.collections {
            for (index, spec) in &entry.indexes {
                let table = store.build_index(entry.id, spec.clone())?;
                store.install_index(entry.id, index, table);
            }
        }

        let (executor, queue): (Arc<dyn Executor>, _) = match config.executor.clone() {
            Some(executor) => (executor, None),
            None => {
                let queue = Arc::new(DispatchQueue::new(&format!("shelfdb-notify-{name}"))?);
                (Arc::clone(&queue) as Arc<dyn Executor>, Some(queue))
            }
        };

        let blobs = Arc::new(blobs);
        let bus = Arc::new(ChangeBus::new());
        let stats = Arc::new(DatabaseStats::new());
        let txns = TransactionManager::new(
            wal,
            Arc::clone(&store),
            Arc::clone(&blobs),
            Arc::clone(&bus),
            Arc::clone(&stats),
            recovery.max_txid + 1,
            last,
        );
        let statistics = store.statistics(false)?;

        let inner = Arc::new(DbInner {
            name: name.to_owned(),
            path,
            tombstone_retention: config.tombstone_retention,
            dir: Mutex::new(dir),
            manifest: RwLock::new(manifest),
            store,
            blobs,
            bus,
            stats,
            txns,
            executor,
            queue,
            statistics: RwLock::new(statistics),
            open: AtomicBool::new(true),
            reaper: Mutex::new(None),
        });
        if replayed > 0 {
            inner.checkpoint()?;
        }
        if config.expiration_sweep_interval > Duration::ZERO {
            let reaper = Reaper::start(Arc::downgrade(&inner), config.expiration_sweep_interval)?;
            *inner.reaper.lock() = Some(reaper);
        }

        info!(
            name,
            records = loaded.records,
            replayed,
            incomplete = recovery.incomplete,
            last_sequence = last.as_u64(),
            "database opened"
        );
        Ok(Self { inner })
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Directory holding the database; `None` in memory.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Whether [`close`](Self::close) has not run yet.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Sequence number of the last commit.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.inner.txns.committed_sequence().as_u64()
    }

    /// Closes the database.
    ///
    /// Stops the expiration reaper, waits for writers on other threads,
    /// delivers queued notifications, then checkpoints and releases the
    /// directory lock. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// `Busy` from inside a batch; storage faults from the final checkpoint.
    pub fn close(&self) -> DbResult<()> {
        self.inner.close()
    }

    /// Closes the database and removes its files.
    ///
    /// # Errors
    ///
    /// As for [`close`](Self::close), plus I/O faults while removing.
    pub fn delete(&self) -> DbResult<()> {
        self.inner.close()?;
        match &self.inner.path {
            Some(path) => dir::remove(path),
            None => Ok(()),
        }
    }

    /// Whether the database `name` exists under `directory`.
    #[must_use]
    pub fn exists(name: &str, directory: &Path) -> bool {
        dir::bundle_path(directory, name).is_dir()
    }

    /// Removes the closed database `name` under `directory`.
    ///
    /// # Errors
    ///
    /// `NotFound` if it does not exist, `Busy` if it is open.
    pub fn delete_database(name: &str, directory: &Path) -> DbResult<()> {
        validate_db_name(name)?;
        dir::remove(&dir::bundle_path(directory, name))
    }

    /// Copies the closed database at `from` to `name` under
    /// `config.directory`, byte for byte.
    ///
    /// # Errors
    ///
    /// `NotFound` if `from` is missing, `InvalidArgument` if the target
    /// exists, `Busy` if `from` is open.
    pub fn copy(from: &Path, name: &str, config: &Config) -> DbResult<()> {
        validate_db_name(name)?;
        dir::copy(from, &dir::bundle_path(&config.directory, name))
    }

    // ----- namespace -----

    /// The default scope plus every scope holding a collection.
    ///
    /// # Errors
    ///
    /// `NotOpen` once closed.
    pub fn scopes(&self) -> DbResult<Vec<Scope>> {
        self.inner.check_open()?;
        Ok(self
            .inner
            .manifest
            .read()
            .scope_names()
            .into_iter()
            .map(|name| Scope::new(name, Arc::clone(&self.inner)))
            .collect())
    }

    /// One scope; an empty name means the default scope.
    ///
    /// # Errors
    ///
    /// `NotFound` for a scope without collections, `NotOpen` once closed.
    pub fn scope(&self, name: &str) -> DbResult<Scope> {
        self.inner.check_open()?;
        let name = scope_or_default(name);
        if self.inner.manifest.read().scope_names().iter().any(|s| s == name) {
            Ok(Scope::new(name.to_owned(), Arc::clone(&self.inner)))
        } else {
            Err(DbError::not_found(format!("scope {name}")))
        }
    }

    /// The default scope, which always exists.
    ///
    /// # Errors
    ///
    /// `NotOpen` once closed.
    pub fn default_scope(&self) -> DbResult<Scope> {
        self.scope(DEFAULT_NAME)
    }

    /// Collections in `scope`; empty for an unknown scope.
    ///
    /// # Errors
    ///
    /// `NotOpen` once closed.
    pub fn collections(&self, scope: &str) -> DbResult<Vec<Collection>> {
        self.inner.collections(scope)
    }

    /// One collection.
    ///
    /// # Errors
    ///
    /// `NotFound` if it does not exist, `NotOpen` once closed.
    pub fn collection(&self, name: &str, scope: &str) -> DbResult<Collection> {
        self.inner.collection(name, scope)
    }

    /// The default collection.
    ///
    /// # Errors
    ///
    /// `NotFound` after it was deleted, `NotOpen` once closed.
    pub fn default_collection(&self) -> DbResult<Collection> {
        self.inner.collection(DEFAULT_NAME, DEFAULT_NAME)
    }

    /// Creates a collection, or returns the existing one.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a bad name or for re-creating the deleted
    /// default collection; `NotOpen` once closed.
    pub fn create_collection(&self, name: &str, scope: &str) -> DbResult<Collection> {
        self.inner.check_open()?;
        let scope = scope_or_default(scope);
        validate_name("scope", scope)?;
        validate_name("collection", name)?;

        let mut manifest = self.inner.manifest.write();
        if let Some(entry) = manifest.find(scope, name) {
            return Ok(Collection::new(
                Arc::clone(&self.inner),
                entry.id,
                entry.scope.clone(),
                entry.name.clone(),
            ));
        }
        if scope == DEFAULT_NAME && name == DEFAULT_NAME {
            return Err(DbError::invalid_argument(
                "the default collection cannot be re-created",
            ));
        }
        let mut updated = manifest.clone();
        let id = updated.create(scope, name);
        self.inner.persist_manifest(&updated)?;
        *manifest = updated;
        debug!(scope, name, %id, "collection created");
        Ok(Collection::new(
            Arc::clone(&self.inner),
            id,
            scope.to_owned(),
            name.to_owned(),
        ))
    }

    /// Deletes a collection and its documents; absent collections are ignored.
    ///
    /// # Errors
    ///
    /// `Busy` inside a batch, `NotOpen` once closed.
    pub fn delete_collection(&self, name: &str, scope: &str) -> DbResult<()> {
        self.inner.check_open()?;
        let scope = scope_or_default(scope);
        self.inner.txns.exclusive("delete a collection", || {
            self.inner.check_open()?;
            let mut manifest = self.inner.manifest.write();
            let mut updated = manifest.clone();
            let Some(entry) = updated.remove(scope, name) else {
                return Ok(());
            };
            self.inner.persist_manifest(&updated)?;
            *manifest = updated;
            drop(manifest);
            self.inner.store.drop_collection(entry.id);
            self.inner.bus.forget_collection(entry.id);
            debug!(scope, name, id = %entry.id, "collection deleted");
            Ok(())
        })
    }

    // ----- batches -----

    /// Runs `body` as one transaction.
    ///
    /// Every mutation the body makes on this thread joins the transaction,
    /// which commits once when the body returns `Ok`. If the body returns an
    /// error, or any mutation inside it failed even though the body went on,
    /// nothing is written: the body's error is returned, or `BatchAborted`
    /// naming the first failure. A batch inside a batch joins the outer one.
    ///
    /// Closing or deleting the database, deleting a collection and changing
    /// indexes are refused with `Busy` inside the body.
    ///
    /// # Errors
    ///
    /// See above; `NotOpen` once closed.
    pub fn in_batch<R>(&self, body: impl FnOnce() -> DbResult<R>) -> DbResult<R> {
        self.inner.check_open()?;
        self.inner.txns.batch(body)
    }

    // ----- blobs -----

    /// Stores blob content ahead of any document referencing it.
    ///
    /// # Errors
    ///
    /// `NotOpen` once closed, I/O faults.
    pub fn save_blob(&self, blob: &Blob) -> DbResult<()> {
        self.inner.check_open()?;
        self.inner.blobs.put(blob)
    }

    /// Loads the blob described by `properties` (as found in a document).
    ///
    /// Returns `Ok(None)` if nothing is stored under the digest.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `properties` lacks `"@type": "blob"` or a valid
    /// digest, `Corruption` if stored content does not match its digest.
    pub fn blob(&self, properties: &Map<String, Value>) -> DbResult<Option<Blob>> {
        self.inner.check_open()?;
        let digest = Blob::digest_from_properties(properties)?;
        Ok(self
            .inner
            .blobs
            .get(digest)?
            .map(|content| Blob::from_stored(properties, content)))
    }

    // ----- maintenance -----

    /// Runs one maintenance pass.
    ///
    /// # Errors
    ///
    /// `Corruption` from `IntegrityCheck`, `Busy` for `Compact` and
    /// `Reindex` inside a batch, storage faults.
    pub fn perform_maintenance(&self, kind: MaintenanceType) -> DbResult<()> {
        self.inner.perform_maintenance(kind)
    }

    /// Runs one expiration sweep now and returns how many documents it purged.
    ///
    /// # Errors
    ///
    /// `NotOpen` once closed, storage faults.
    pub fn purge_expired_documents(&self) -> DbResult<usize> {
        reaper::purge_expired(&self.inner)
    }

    /// Storage statistics as of the last `Optimize` pass (or open).
    #[must_use]
    pub fn statistics(&self) -> StoreStatistics {
        self.inner.statistics.read().clone()
    }

    /// Live operation counters.
    #[must_use]
    pub fn stats(&self) -> &DatabaseStats {
        &self.inner.stats
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.inner.close() {
            warn!(name = %self.inner.name, error = %err, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .field("open", &self.inner.is_open())
            .field("txns", &self.inner.txns)
            .finish_non_exhaustive()
    }
}

fn validate_db_name(name: &str) -> DbResult<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(DbError::invalid_argument(format!(
            "invalid database name {name:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use tempfile::tempdir;

    fn config(dir: &Path) -> Config {
        Config::new().directory(dir).sync_on_commit(false)
    }

    #[test]
    fn open_creates_bundle() {
        let temp = tempdir().unwrap();
        let db = Database::open("app", config(temp.path())).unwrap();
        assert_eq!(db.path(), Some(temp.path().join("app.shelfdb").as_path()));
        assert!(Database::exists("app", temp.path()));
        assert!(!Database::exists("other", temp.path()));
    }

    #[test]
    fn bad_names_are_rejected() {
        let temp = tempdir().unwrap();
        for name in ["", "a/b", ".."] {
            assert!(matches!(
                Database::open(name, config(temp.path())),
                Err(DbError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn second_open_is_busy() {
        let temp = tempdir().unwrap();
        let _db = Database::open("app", config(temp.path())).unwrap();
        assert!(matches!(
            Database::open("app", config(temp.path())),
            Err(DbError::Busy { .. })
        ));
    }

    #[test]
    fn closed_database_rejects_everything() {
        let db = Database::open_in_memory().unwrap();
        let coll = db.default_collection().unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(db.scopes(), Err(DbError::NotOpen)));
        assert!(matches!(db.default_collection(), Err(DbError::NotOpen)));
        assert!(matches!(
            coll.save(&mut Document::with_id("x")),
            Err(DbError::NotOpen)
        ));
    }

    #[test]
    fn sequence_survives_reopen() {
        let temp = tempdir().unwrap();
        {
            let db = Database::open("app", config(temp.path())).unwrap();
            let coll = db.default_collection().unwrap();
            for i in 0..3 {
                coll.save(&mut Document::with_id(format!("d{i}"))).unwrap();
            }
            assert_eq!(db.last_sequence(), 3);
        }
        let db = Database::open("app", config(temp.path())).unwrap();
        assert_eq!(db.last_sequence(), 3);
        assert_eq!(db.default_collection().unwrap().count().unwrap(), 3);
    }

    #[test]
    fn delete_removes_files() {
        let temp = tempdir().unwrap();
        let db = Database::open("app", config(temp.path())).unwrap();
        db.delete().unwrap();
        assert!(!Database::exists("app", temp.path()));
        assert!(Database::delete_database("app", temp.path())
            .unwrap_err()
            .is_not_found());
    }
}
