//! Revisions and conflict handling across threads.

use proptest::prelude::*;
use serde_json::json;
use shelfdb_core::{
    ConcurrencyControl, Config, Database, DbError, Document, InlineExecutor, Revision,
};
use std::sync::{Arc, Barrier};
use std::thread;

fn memory_db() -> Database {
    let config = Config::new()
        .executor(Arc::new(InlineExecutor))
        .expiration_sweep_interval(std::time::Duration::ZERO);
    Database::open_in_memory_with_config(config).unwrap()
}

fn doc(id: &str, value: serde_json::Value) -> Document {
    Document::from_json(id, value).unwrap()
}

#[test]
fn every_save_increases_the_revision() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();

    let mut d = doc("a", json!({"n": 0}));
    coll.save(&mut d).unwrap();
    let mut last = d.revision().unwrap();

    for n in 1..5 {
        d.set("n", n);
        coll.save(&mut d).unwrap();
        let rev = d.revision().unwrap();
        assert!(rev > last);
        last = rev;
    }
    let stored = coll.document("a").unwrap().unwrap();
    assert_eq!(stored.revision(), Some(last));
    assert_eq!(stored.get("n"), Some(&json!(4)));
}

#[test]
fn concurrent_fail_on_conflict_lets_exactly_one_writer_win() {
    let db = memory_db();
    let coll = db.create_collection("coll", "").unwrap();
    coll.save(&mut doc("doc1", json!({"x": 1}))).unwrap();
    let v1 = coll.document("doc1").unwrap().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [2, 3]
        .into_iter()
        .map(|x| {
            let coll = coll.clone();
            let barrier = Arc::clone(&barrier);
            let mut mine = v1.clone();
            thread::spawn(move || {
                mine.set("x", x);
                barrier.wait();
                let result = coll.save_with(&mut mine, ConcurrencyControl::FailOnConflict);
                (x, result.map(|()| mine.revision()))
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = outcomes.iter().filter(|(_, r)| r.is_ok()).collect();
    assert_eq!(winners.len(), 1);
    let loser = outcomes.iter().find(|(_, r)| r.is_err()).unwrap();
    assert!(matches!(loser.1, Err(DbError::Conflict { .. })));

    let (x, Ok(revision)) = winners[0] else { unreachable!() };
    let stored = coll.document("doc1").unwrap().unwrap();
    assert_eq!(stored.get("x"), Some(&json!(x)));
    assert_eq!(stored.revision(), *revision);
    assert!(stored.revision() > v1.revision());
}

#[test]
fn last_write_wins_accepts_every_concurrent_writer() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    coll.save(&mut doc("shared", json!({"writer": -1}))).unwrap();
    let base = coll.document("shared").unwrap().unwrap();

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let coll = coll.clone();
            let barrier = Arc::clone(&barrier);
            let mut mine = base.clone();
            thread::spawn(move || {
                mine.set("writer", i);
                barrier.wait();
                coll.save(&mut mine).unwrap();
                mine.revision().unwrap()
            })
        })
        .collect();
    let revisions: Vec<Revision> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let stored = coll.document("shared").unwrap().unwrap();
    let newest = revisions.iter().max().copied();
    assert_eq!(stored.revision(), newest);
    let writer = stored.get("writer").and_then(|v| v.as_u64()).unwrap();
    assert!((writer as usize) < threads);

    let mut distinct = revisions.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), threads);
}

#[test]
fn fail_on_conflict_rejects_a_blind_overwrite() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    coll.save(&mut doc("a", json!({"v": 1}))).unwrap();

    let mut blind = doc("a", json!({"v": 2}));
    let err = coll
        .save_with(&mut blind, ConcurrencyControl::FailOnConflict)
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(blind.revision(), None);
    assert_eq!(coll.document("a").unwrap().unwrap().get("v"), Some(&json!(1)));
}

#[test]
fn resolver_can_merge_both_versions() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    coll.save(&mut doc("counter", json!({"n": 1}))).unwrap();
    let stale = coll.document("counter").unwrap().unwrap();

    let mut other = stale.clone();
    other.set("n", 10);
    coll.save(&mut other).unwrap();

    let mut mine = stale;
    mine.set("n", 5);
    let saved = coll
        .save_with_resolver(&mut mine, |mine: &mut Document, theirs: Option<&Document>| {
            let theirs = theirs.and_then(|d| d.get("n")).and_then(|v| v.as_i64()).unwrap();
            let ours = mine.get("n").and_then(|v| v.as_i64()).unwrap();
            mine.set("n", theirs + ours);
            true
        })
        .unwrap();

    assert!(saved);
    let stored = coll.document("counter").unwrap().unwrap();
    assert_eq!(stored.get("n"), Some(&json!(15)));
    assert_eq!(stored.revision(), mine.revision());
}

#[test]
fn declining_resolver_writes_nothing() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    coll.save(&mut doc("a", json!({"v": 1}))).unwrap();
    let before = coll.document("a").unwrap().unwrap();
    let sequence = db.last_sequence();

    let mut blind = doc("a", json!({"v": 2}));
    let saved = coll
        .save_with_resolver(&mut blind, |_: &mut Document, _: Option<&Document>| false)
        .unwrap();

    assert!(!saved);
    assert_eq!(coll.document("a").unwrap().unwrap(), before);
    assert_eq!(db.last_sequence(), sequence);
    assert_eq!(db.stats().unresolved(), 1);
}

#[test]
fn resolver_is_not_called_without_a_conflict() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    let mut fresh = doc("new", json!({"v": 1}));
    let saved = coll
        .save_with_resolver(&mut fresh, |_: &mut Document, _: Option<&Document>| -> bool {
            panic!("no conflict expected")
        })
        .unwrap();
    assert!(saved);
    assert!(fresh.revision().is_some());
}

#[test]
fn panicking_resolver_is_a_resolver_failure() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    coll.save(&mut doc("a", json!({"v": 1}))).unwrap();

    let mut blind = doc("a", json!({"v": 2}));
    let err = coll
        .save_with_resolver(&mut blind, |_: &mut Document, _: Option<&Document>| -> bool {
            panic!("resolver exploded")
        })
        .unwrap_err();
    match err {
        DbError::ResolverFailure { message } => assert!(message.contains("resolver exploded")),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(coll.document("a").unwrap().unwrap().get("v"), Some(&json!(1)));

    // The writer slot is usable again.
    coll.save(&mut doc("b", json!({}))).unwrap();
    assert_eq!(coll.count().unwrap(), 2);
}

#[test]
fn writing_from_a_resolver_is_an_invalid_operation() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    coll.save(&mut doc("a", json!({"v": 1}))).unwrap();

    let inner = coll.clone();
    let mut blind = doc("a", json!({"v": 2}));
    let err = coll
        .save_with_resolver(&mut blind, move |_: &mut Document, _: Option<&Document>| {
            let nested = inner.save(&mut Document::with_id("sneaky"));
            assert!(matches!(nested, Err(DbError::InvalidOperation { .. })));
            true
        })
        .unwrap_err();

    assert!(matches!(err, DbError::InvalidOperation { .. }));
    assert!(coll.document("sneaky").unwrap().is_none());
    assert_eq!(coll.document("a").unwrap().unwrap().get("v"), Some(&json!(1)));

    coll.save(&mut doc("after", json!({}))).unwrap();
    assert!(coll.document("after").unwrap().is_some());
}

#[test]
fn resolver_sees_a_deletion_as_none() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    coll.save(&mut doc("a", json!({"v": 1}))).unwrap();
    let stale = coll.document("a").unwrap().unwrap();
    coll.delete(&mut stale.clone()).unwrap();

    let mut mine = stale;
    mine.set("v", 2);
    let mut saw_none = false;
    let saved = coll
        .save_with_resolver(&mut mine, |_: &mut Document, theirs: Option<&Document>| {
            saw_none = theirs.is_none();
            true
        })
        .unwrap();

    assert!(saved);
    assert!(saw_none);
    assert_eq!(coll.document("a").unwrap().unwrap().get("v"), Some(&json!(2)));
}

#[test]
fn new_document_over_a_tombstone_is_not_a_conflict() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    let mut original = doc("a", json!({"v": 1}));
    coll.save(&mut original).unwrap();
    coll.delete(&mut original).unwrap();
    assert!(original.is_deleted());

    let mut fresh = doc("a", json!({"v": 2}));
    coll.save_with(&mut fresh, ConcurrencyControl::FailOnConflict).unwrap();
    assert!(fresh.revision() > original.revision());
    assert_eq!(coll.count().unwrap(), 1);
}

#[test]
fn saving_after_a_purge_is_an_insert() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    coll.save(&mut doc("a", json!({"v": 1}))).unwrap();
    let stale = coll.document("a").unwrap().unwrap();
    coll.purge("a").unwrap();

    let mut mine = stale;
    coll.save_with(&mut mine, ConcurrencyControl::FailOnConflict).unwrap();
    assert!(coll.document("a").unwrap().is_some());
}

#[test]
fn delete_checks_the_stored_revision() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();
    let mut d = doc("a", json!({"v": 1}));
    coll.save(&mut d).unwrap();
    let mut stale = d.clone();
    d.set("v", 2);
    coll.save(&mut d).unwrap();

    let err = coll
        .delete_with(&mut stale, ConcurrencyControl::FailOnConflict)
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(coll.document("a").unwrap().is_some());

    coll.delete(&mut stale).unwrap();
    assert!(coll.document("a").unwrap().is_none());
}

#[test]
fn deleting_what_is_not_there_is_not_found() {
    let db = memory_db();
    let coll = db.default_collection().unwrap();

    let err = coll.delete(&mut Document::with_id("ghost")).unwrap_err();
    assert!(err.is_not_found());

    let mut d = doc("a", json!({}));
    coll.save(&mut d).unwrap();
    coll.delete(&mut d).unwrap();
    assert!(coll.delete(&mut d).unwrap_err().is_not_found());

    // A tombstone can still be purged; after that nothing is left.
    coll.purge("a").unwrap();
    assert!(coll.purge("a").unwrap_err().is_not_found());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn revisions_grow_over_any_write_sequence(ops in prop::collection::vec(0u8..3, 1..40)) {
        let db = memory_db();
        let coll = db.default_collection().unwrap();
        let mut last: Option<Revision> = None;
        for op in ops {
            let current = coll.document("p").unwrap();
            match (op, current) {
                (0 | 1, current) => {
                    let mut d = current.unwrap_or_else(|| Document::with_id("p"));
                    d.set("op", op);
                    coll.save(&mut d).unwrap();
                    prop_assert!(d.revision() > last);
                    last = d.revision();
                }
                (_, Some(mut d)) => {
                    coll.delete(&mut d).unwrap();
                    prop_assert!(d.revision() > last);
                    last = d.revision();
                }
                (_, None) => {}
            }
        }
    }
}
