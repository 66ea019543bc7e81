//! Change listeners: delivery, grouping, executors and removal.

use parking_lot::Mutex;
use serde_json::json;
use shelfdb_core::{
    ChangeKind, CollectionChange, Config, Database, DispatchQueue, Document, DocumentChange,
    Executor, InlineExecutor, ListenerToken,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

const WAIT: Duration = Duration::from_secs(5);

fn inline_db() -> Database {
    let config = Config::new()
        .executor(Arc::new(InlineExecutor))
        .expiration_sweep_interval(Duration::ZERO);
    Database::open_in_memory_with_config(config).unwrap()
}

fn doc(id: &str) -> Document {
    Document::from_json(id, json!({"id": id})).unwrap()
}

#[test]
fn document_listener_sees_each_kind_of_change() {
    let db = inline_db();
    let coll = db.default_collection().unwrap();
    let seen: Arc<Mutex<Vec<DocumentChange>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let _token = coll
        .add_document_change_listener("a", move |change| sink.lock().push(change.clone()))
        .unwrap();

    let mut a = doc("a");
    coll.save(&mut a).unwrap();
    a.set("v", 2);
    coll.save(&mut a).unwrap();
    coll.save(&mut doc("b")).unwrap();
    coll.delete(&mut a).unwrap();
    coll.purge("a").unwrap();

    let kinds: Vec<ChangeKind> = seen.lock().iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        [
            ChangeKind::Inserted,
            ChangeKind::Updated,
            ChangeKind::Deleted,
            ChangeKind::Purged
        ]
    );
    let seen = seen.lock();
    assert!(seen.iter().all(|c| c.document_id == "a"));
    assert!(seen.iter().all(|c| c.scope == "_default" && c.collection == "_default"));
    assert!(seen.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[test]
fn document_created_and_resaved_in_a_batch_is_an_insert() {
    let db = inline_db();
    let coll = db.default_collection().unwrap();
    coll.save(&mut doc("old")).unwrap();
    let seen: Arc<Mutex<Vec<(String, ChangeKind)>>> = Arc::default();
    let (fresh, existing) = (Arc::clone(&seen), Arc::clone(&seen));
    let _fresh = coll
        .add_document_change_listener("new", move |c| {
            fresh.lock().push((c.document_id.clone(), c.kind));
        })
        .unwrap();
    let _existing = coll
        .add_document_change_listener("old", move |c| {
            existing.lock().push((c.document_id.clone(), c.kind));
        })
        .unwrap();

    db.in_batch(|| {
        let mut created = doc("new");
        coll.save(&mut created)?;
        created.set("v", 2);
        coll.save(&mut created)?;
        let mut old = coll.document("old")?.unwrap();
        old.set("v", 2);
        coll.save(&mut old)?;
        coll.save(&mut old)?;
        Ok(())
    })
    .unwrap();

    let mut seen = seen.lock().clone();
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        seen,
        [
            ("new".to_owned(), ChangeKind::Inserted),
            ("old".to_owned(), ChangeKind::Updated)
        ]
    );
}

#[test]
fn collection_listener_gets_one_change_per_commit() {
    let db = inline_db();
    let coll = db.create_collection("orders", "shop").unwrap();
    let seen: Arc<Mutex<Vec<CollectionChange>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let _token = coll
        .add_change_listener(move |change| sink.lock().push(change.clone()))
        .unwrap();

    coll.save(&mut doc("o1")).unwrap();
    db.in_batch(|| {
        coll.save(&mut doc("o2"))?;
        coll.save(&mut doc("o3"))?;
        coll.save(&mut doc("o2"))
    })
    .unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].document_ids, ["o1"]);
    assert_eq!(seen[1].document_ids, ["o2", "o3"]);
    assert_eq!(seen[1].scope, "shop");
    assert_eq!(seen[1].collection, "orders");
}

#[test]
fn listeners_only_hear_their_own_collection() {
    let db = inline_db();
    let left = db.create_collection("left", "").unwrap();
    let right = db.create_collection("right", "").unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let _token = left
        .add_change_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    right.save(&mut doc("r")).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
    left.save(&mut doc("l")).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn expiration_changes_are_silent() {
    let db = inline_db();
    let coll = db.default_collection().unwrap();
    coll.save(&mut doc("a")).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let _token = coll
        .add_change_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let later = SystemTime::now() + Duration::from_secs(3600);
    coll.set_expiration("a", Some(later)).unwrap();
    coll.set_expiration("a", None).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn removed_listener_hears_nothing_more() {
    let db = inline_db();
    let coll = db.default_collection().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let token = coll
        .add_change_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    coll.save(&mut doc("a")).unwrap();
    token.remove();
    coll.save(&mut doc("b")).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn remove_waits_for_a_running_callback() {
    let db = inline_db();
    let coll = db.default_collection().unwrap();
    let queue = Arc::new(DispatchQueue::new("test-listeners").unwrap());
    let (started_tx, started_rx) = mpsc::channel();
    let finished = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    let done = Arc::clone(&finished);
    let counter = Arc::clone(&calls);
    let started_tx = Mutex::new(started_tx);
    let token = coll
        .add_change_listener_with_executor(
            Arc::clone(&queue) as Arc<dyn Executor>,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = started_tx.lock().send(());
                thread::sleep(Duration::from_millis(100));
                done.store(true, Ordering::SeqCst);
            },
        )
        .unwrap();

    coll.save(&mut doc("a")).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();
    token.remove();
    assert!(finished.load(Ordering::SeqCst));

    coll.save(&mut doc("b")).unwrap();
    queue.shutdown();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn removal_inside_a_batch_does_not_wait_for_a_blocked_callback() {
    let db = inline_db();
    let coll = db.default_collection().unwrap();
    let queue = Arc::new(DispatchQueue::new("test-batch-remove").unwrap());
    let (started_tx, started_rx) = mpsc::channel();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let writer = coll.clone();
    let started_tx = Mutex::new(started_tx);
    let token = coll
        .add_document_change_listener_with_executor(
            "a",
            Arc::clone(&queue) as Arc<dyn Executor>,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = started_tx.lock().send(());
                // Blocks until the batch below commits.
                let _ = writer.save(&mut doc("from-listener"));
            },
        )
        .unwrap();

    coll.save(&mut doc("a")).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();
    db.in_batch(|| {
        token.remove();
        coll.save(&mut doc("batched"))
    })
    .unwrap();

    queue.shutdown();
    assert!(coll.document("from-listener").unwrap().is_some());
    coll.save(&mut doc("a")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn queued_delivery_is_dropped_after_removal() {
    let db = inline_db();
    let coll = db.default_collection().unwrap();
    let queue = Arc::new(DispatchQueue::new("test-gate").unwrap());
    let calls = Arc::new(AtomicUsize::new(0));

    // Park the queue so the delivery below stays queued.
    let (release_tx, release_rx) = mpsc::channel::<()>();
    queue.execute(Box::new(move || {
        let _ = release_rx.recv_timeout(WAIT);
    }));

    let counter = Arc::clone(&calls);
    let token = coll
        .add_change_listener_with_executor(Arc::clone(&queue) as Arc<dyn Executor>, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    coll.save(&mut doc("a")).unwrap();
    token.remove();
    release_tx.send(()).unwrap();
    queue.shutdown();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn listener_may_remove_itself() {
    let db = inline_db();
    let coll = db.default_collection().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<ListenerToken>>> = Arc::default();

    let counter = Arc::clone(&calls);
    let own = Arc::clone(&slot);
    let token = coll
        .add_change_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = own.lock().take() {
                token.remove();
            }
        })
        .unwrap();
    *slot.lock() = Some(token);

    coll.save(&mut doc("a")).unwrap();
    coll.save(&mut doc("b")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_listener_does_not_break_commits() {
    let db = inline_db();
    let coll = db.default_collection().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let _bad = coll
        .add_change_listener(|_| panic!("listener failure"))
        .unwrap();
    let counter = Arc::clone(&calls);
    let _good = coll
        .add_change_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    coll.save(&mut doc("a")).unwrap();
    coll.save(&mut doc("b")).unwrap();
    assert_eq!(coll.count().unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn default_queue_delivers_in_commit_order() {
    let db = Database::open_in_memory().unwrap();
    let coll = db.default_collection().unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let _token = coll
        .add_change_listener(move |change| {
            let _ = tx.lock().send(change.sequence);
        })
        .unwrap();

    for i in 0..20 {
        coll.save(&mut doc(&format!("d{i}"))).unwrap();
    }
    let sequences: Vec<u64> = (0..20).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(sequences.last().copied(), Some(db.last_sequence()));
}

#[test]
fn deleting_a_collection_drops_its_listeners() {
    let db = inline_db();
    let coll = db.create_collection("temp", "").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let _token = coll
        .add_change_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    db.delete_collection("temp", "").unwrap();
    let again = db.create_collection("temp", "").unwrap();
    again.save(&mut doc("a")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(coll.add_change_listener(|_| {}).unwrap_err().is_not_found());
}
