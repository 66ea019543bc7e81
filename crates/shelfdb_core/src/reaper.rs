//! Expiration reaper.
//!
//! A background thread wakes every sweep interval and purges documents
//! whose expiration has passed, all in one write transaction.

use crate::database::DbInner;
use crate::error::{DbError, DbResult};
use crate::notify::ChangeKind;
use crate::segment::SegmentRecord;
use crate::types::to_millis;
use serde_json::Map;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Handle to the reaper thread.
#[derive(Debug)]
pub(crate) struct Reaper {
    stop: Sender<()>,
    worker: JoinHandle<()>,
}

impl Reaper {
    pub(crate) fn start(db: Weak<DbInner>, interval: Duration) -> DbResult<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let worker = thread::Builder::new()
            .name("shelfdb-reaper".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(db) = db.upgrade() else { break };
                match purge_expired(&db) {
                    Ok(_) | Err(DbError::NotOpen) => {}
                    Err(err) => warn!(error = %err, "expiration sweep failed"),
                }
            })?;
        Ok(Self { stop, worker })
    }

    /// Stops the thread and waits for a sweep in progress, unless called
    /// from the reaper thread itself.
    pub(crate) fn stop(self) {
        let _ = self.stop.send(());
        if self.worker.thread().id() != thread::current().id() {
            let _ = self.worker.join();
        }
    }
}

/// Purges every document whose expiration is due and returns how many.
///
/// Candidates are re-checked inside the transaction, so a save or
/// expiration change that committed first wins.
pub(crate) fn purge_expired(db: &DbInner) -> DbResult<usize> {
    db.check_open()?;
    let now = to_millis(SystemTime::now());
    let candidates = db.store.expired(now);
    if candidates.is_empty() {
        return Ok(0);
    }
    let purged = db.txns.write(|txn| {
        db.check_open()?;
        let mut purged = 0;
        for (collection, id) in candidates {
            let expiration = match txn.pending(collection, &id) {
                Some(state) => state.and_then(|s| s.expiration),
                None => db.store.meta(collection, &id).and_then(|m| m.expiration),
            };
            if !expiration.is_some_and(|e| e <= now) || !db.manifest.read().is_live(collection) {
                continue;
            }
            let record = SegmentRecord::purge(collection, id, txn.sequence());
            txn.stage(record, Map::new(), Some(ChangeKind::Purged));
            purged += 1;
        }
        Ok(purged)
    })?;
    for _ in 0..purged {
        db.stats.record_expired();
    }
    if purged > 0 {
        debug!(purged, "expired documents purged");
    }
    Ok(purged)
}
