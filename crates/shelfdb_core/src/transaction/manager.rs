//! Transaction manager.

use crate::blob::BlobStore;
use crate::error::{DbError, DbResult};
use crate::notify::{ChangeBus, ChangeKind};
use crate::segment::{AppendError, SegmentRecord};
use crate::stats::DatabaseStats;
use crate::store::DocumentStore;
use crate::transaction::state::Transaction;
use crate::types::{SequenceNumber, TransactionId};
use crate::wal::WalManager;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::{Cell, RefCell, RefMut};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const REENTRANT_WRITE: &str = "write attempted from inside a conflict resolver";
const POISONED: &str = "a failed commit could not be rolled back; reopen the database";

/// The transaction owned by the thread holding the writer lock.
#[derive(Default)]
struct WriterSlot {
    txn: RefCell<Option<Transaction>>,
    /// Set when a resolver tried to write; fails the enclosing write.
    reentered: Cell<bool>,
}

thread_local! {
    static WRITER_HOLDS: Cell<usize> = const { Cell::new(0) };
}

/// True if this thread holds the writer lock of some database.
pub(crate) fn holds_writer() -> bool {
    WRITER_HOLDS.with(|holds| holds.get() > 0)
}

/// The writer lock, counted in [`holds_writer`] while held.
struct WriterGuard<'a> {
    guard: ReentrantMutexGuard<'a, WriterSlot>,
}

impl<'a> WriterGuard<'a> {
    fn new(guard: ReentrantMutexGuard<'a, WriterSlot>) -> Self {
        WRITER_HOLDS.with(|holds| holds.set(holds.get() + 1));
        Self { guard }
    }
}

impl Deref for WriterGuard<'_> {
    type Target = WriterSlot;

    fn deref(&self) -> &WriterSlot {
        &self.guard
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        WRITER_HOLDS.with(|holds| holds.set(holds.get().saturating_sub(1)));
    }
}

/// Empties the slot when dropped, so a panic never leaves a stale
/// transaction behind for the next writer.
struct ActiveTxn<'a> {
    slot: RefMut<'a, Option<Transaction>>,
}

impl Drop for ActiveTxn<'_> {
    fn drop(&mut self) {
        self.slot.take();
    }
}

struct BatchScope<'a> {
    cell: &'a RefCell<Option<Transaction>>,
}

impl BatchScope<'_> {
    fn take(&self) -> Option<Transaction> {
        self.cell.try_borrow_mut().ok().and_then(|mut slot| slot.take())
    }
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        self.take();
    }
}

/// Serializes writers and commits transactions.
///
/// There is one writer at a time, held through a re-entrant lock so that
/// every mutation a batch body makes on its own thread joins the batch's
/// transaction. Readers never take the writer lock.
///
/// A commit goes to the WAL first, then to the document store, and is then
/// published to the change bus while the writer lock is still held.
pub(crate) struct TransactionManager {
    writer: ReentrantMutex<WriterSlot>,
    wal: Mutex<WalManager>,
    store: Arc<DocumentStore>,
    blobs: Arc<BlobStore>,
    bus: Arc<ChangeBus>,
    stats: Arc<DatabaseStats>,
    next_txid: AtomicU64,
    committed_seq: AtomicU64,
    /// Set when a failed commit may have left durable traces.
    poisoned: AtomicBool,
}

impl TransactionManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        wal: WalManager,
        store: Arc<DocumentStore>,
        blobs: Arc<BlobStore>,
        bus: Arc<ChangeBus>,
        stats: Arc<DatabaseStats>,
        next_txid: u64,
        committed_seq: SequenceNumber,
    ) -> Self {
        Self {
            writer: ReentrantMutex::new(WriterSlot::default()),
            wal: Mutex::new(wal),
            store,
            blobs,
            bus,
            stats,
            next_txid: AtomicU64::new(next_txid.max(1)),
            committed_seq: AtomicU64::new(committed_seq.as_u64()),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Sequence of the last commit.
    pub(crate) fn committed_sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.committed_seq.load(Ordering::SeqCst))
    }

    fn lock_writer(&self) -> WriterGuard<'_> {
        WriterGuard::new(self.writer.lock())
    }

    fn check_poisoned(&self) -> DbResult<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(DbError::corruption(POISONED));
        }
        Ok(())
    }

    fn begin(&self) -> Transaction {
        let txid = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        Transaction::new(txid, self.committed_sequence().next())
    }

    /// Turns a write attempted by a resolver into a failure of the write
    /// that invoked the resolver.
    fn check_reentry<R>(writer: &WriterSlot, result: DbResult<R>) -> DbResult<R> {
        if writer.reentered.replace(false) && result.is_ok() {
            return Err(DbError::invalid_operation(REENTRANT_WRITE));
        }
        result
    }

    /// Runs `op` inside this thread's open transaction, or inside a new one
    /// committed as soon as `op` succeeds.
    pub(crate) fn write<R>(
        &self,
        op: impl FnOnce(&mut Transaction) -> DbResult<R>,
    ) -> DbResult<R> {
        let writer = self.lock_writer();
        self.check_poisoned()?;
        let Ok(mut slot) = writer.txn.try_borrow_mut() else {
            writer.reentered.set(true);
            return Err(DbError::invalid_operation(REENTRANT_WRITE));
        };

        if let Some(txn) = slot.as_mut() {
            let result = Self::check_reentry(&writer, op(txn));
            if let Err(err) = &result {
                txn.fail(err);
            }
            return result;
        }

        let mut active = ActiveTxn { slot };
        let txn = active.slot.insert(self.begin());
        let result = op(txn);
        let txn = active.slot.take();
        drop(active);

        match (Self::check_reentry(&writer, result), txn) {
            (Ok(value), Some(txn)) => {
                self.commit(&writer, txn)?;
                Ok(value)
            }
            (Ok(value), None) => Ok(value),
            (Err(err), _) => {
                self.stats.record_rollback();
                Err(err)
            }
        }
    }

    /// Runs `body` with one transaction open on this thread.
    ///
    /// A batch inside a batch joins the outer one. The transaction commits
    /// when the outermost body returns `Ok` and no mutation inside it
    /// failed; otherwise everything it staged is dropped.
    pub(crate) fn batch<R>(&self, body: impl FnOnce() -> DbResult<R>) -> DbResult<R> {
        let writer = self.lock_writer();
        self.check_poisoned()?;
        {
            let Ok(mut slot) = writer.txn.try_borrow_mut() else {
                writer.reentered.set(true);
                return Err(DbError::invalid_operation(REENTRANT_WRITE));
            };
            if slot.is_some() {
                drop(slot);
                let result = body();
                if let Err(err) = &result {
                    if let Ok(mut slot) = writer.txn.try_borrow_mut() {
                        if let Some(txn) = slot.as_mut() {
                            txn.fail(err);
                        }
                    }
                }
                return result;
            }
            *slot = Some(self.begin());
        }

        let scope = BatchScope { cell: &writer.txn };
        let result = body();
        let Some(txn) = scope.take() else {
            return result;
        };
        drop(scope);

        match result {
            Err(err) => {
                debug!(txid = %txn.id(), error = %err, "batch rolled back");
                self.stats.record_rollback();
                Err(err)
            }
            Ok(value) => {
                if let Some(reason) = txn.failure() {
                    debug!(txid = %txn.id(), reason, "batch aborted");
                    let err = DbError::batch_aborted(reason);
                    self.stats.record_rollback();
                    return Err(err);
                }
                self.commit(&writer, txn)?;
                Ok(value)
            }
        }
    }

    /// Runs `f` holding the writer lock, refusing if this thread has a
    /// transaction open.
    pub(crate) fn exclusive<R>(&self, action: &str, f: impl FnOnce() -> DbResult<R>) -> DbResult<R> {
        let writer = self.lock_writer();
        let idle = writer.txn.try_borrow().is_ok_and(|slot| slot.is_none());
        if !idle {
            return Err(DbError::busy(format!("cannot {action} while a batch is open")));
        }
        f()
    }

    /// Runs `f` against this thread's open transaction, if there is one.
    ///
    /// Never blocks: another thread's transaction is invisible.
    pub(crate) fn with_open<R>(&self, f: impl FnOnce(&Transaction) -> R) -> Option<R> {
        let writer = WriterGuard::new(self.writer.try_lock()?);
        let slot = writer.txn.try_borrow().ok()?;
        slot.as_ref().map(f)
    }

    fn commit(&self, _writer: &WriterGuard<'_>, txn: Transaction) -> DbResult<()> {
        if txn.is_empty() {
            return Ok(());
        }
        let txid = txn.id();
        let sequence = txn.sequence();
        let (writes, blobs) = txn.into_parts();

        for blob in &blobs {
            self.blobs.put(blob)?;
        }
        let records: Vec<SegmentRecord> = writes.iter().map(|w| w.record.clone()).collect();
        let mut wal = self.wal.lock();
        let logged_at = wal.size()?;
        let logged = wal.log_commit(txid, sequence, &records);
        drop(wal);
        if let Err(error) = logged {
            let failure = AppendError { error, torn: false };
            return Err(self.undo_commit(txid, sequence, logged_at, failure));
        }
        if let Err(failure) = self.store.apply(&records) {
            return Err(self.undo_commit(txid, sequence, logged_at, failure));
        }
        self.committed_seq.store(sequence.as_u64(), Ordering::SeqCst);

        self.stats.record_commit();
        let mut changes = Vec::with_capacity(writes.len());
        for write in writes {
            let Some(kind) = write.change else { continue };
            match kind {
                ChangeKind::Inserted | ChangeKind::Updated => self.stats.record_save(),
                ChangeKind::Deleted => self.stats.record_delete(),
                ChangeKind::Purged => {}
            }
            changes.push((write.record.collection_id, write.record.doc_id, kind));
        }
        debug!(%txid, %sequence, records = records.len(), blobs = blobs.len(), "committed");

        self.bus.publish(sequence, &changes);
        Ok(())
    }

    /// Un-logs a commit that failed before its records were all in the
    /// segment log.
    ///
    /// When either log cannot be restored the commit may come back on
    /// reopen, so the manager refuses further writes.
    fn undo_commit(
        &self,
        txid: TransactionId,
        sequence: SequenceNumber,
        logged_at: u64,
        failure: AppendError,
    ) -> DbError {
        let AppendError { error, torn } = failure;
        let wal_restored = match self.wal.lock().discard_from(logged_at) {
            Ok(()) => true,
            Err(undo) => {
                warn!(%txid, error = %undo, "could not un-log failed commit");
                false
            }
        };
        if wal_restored && !torn {
            debug!(%txid, %sequence, %error, "commit rolled back");
            self.stats.record_rollback();
            return error;
        }
        self.poisoned.store(true, Ordering::SeqCst);
        warn!(%txid, %sequence, %error, "commit outcome unknown, refusing further writes");
        DbError::corruption(format!("commit {sequence} may be durable after failing: {error}"))
    }

    /// Makes the segment log durable, lets `persist` record the committed
    /// sequence, then empties the WAL.
    pub(crate) fn checkpoint(
        &self,
        persist: impl FnOnce(SequenceNumber) -> DbResult<()>,
    ) -> DbResult<()> {
        let _writer = self.lock_writer();
        let sequence = self.committed_sequence();
        self.store.sync()?;
        persist(sequence)?;
        self.wal.lock().checkpoint(sequence)?;
        self.stats.record_checkpoint();
        debug!(%sequence, "checkpoint");
        Ok(())
    }

    /// Runs `f` holding the writer lock, for maintenance that rewrites storage.
    pub(crate) fn locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _writer = self.lock_writer();
        f()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_txid", &self.next_txid.load(Ordering::SeqCst))
            .field("committed_seq", &self.committed_seq.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
