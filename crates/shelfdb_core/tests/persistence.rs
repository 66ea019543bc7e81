//! On-disk databases: reopening, crash recovery and file operations.

use serde_json::json;
use shelfdb_core::{Config, Database, DbError, Document, IndexSpec, InlineExecutor};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn config(dir: &Path) -> Config {
    Config::new()
        .directory(dir)
        .executor(Arc::new(InlineExecutor))
        .expiration_sweep_interval(Duration::ZERO)
}

fn append(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
}

#[test]
fn everything_survives_a_reopen() {
    let dir = TempDir::new().unwrap();
    let later = SystemTime::now() + Duration::from_secs(3600);
    let (kept_rev, sequence) = {
        let db = Database::open("app", config(dir.path())).unwrap();
        let users = db.create_collection("users", "app").unwrap();
        users
            .create_index("by_city", IndexSpec::value(["city"]))
            .unwrap();

        let mut kept = Document::from_json("u1", json!({"city": "Oslo"})).unwrap();
        users.save(&mut kept).unwrap();
        let mut gone = Document::from_json("u2", json!({"city": "Rome"})).unwrap();
        users.save(&mut gone).unwrap();
        users.delete(&mut gone).unwrap();
        users.set_expiration("u1", Some(later)).unwrap();
        db.close().unwrap();
        (kept.revision(), db.last_sequence())
    };

    let db = Database::open("app", config(dir.path())).unwrap();
    assert_eq!(db.last_sequence(), sequence);
    let users = db.collection("users", "app").unwrap();
    let kept = users.document("u1").unwrap().unwrap();
    assert_eq!(kept.revision(), kept_rev);
    assert_eq!(kept.get("city"), Some(&json!("Oslo")));
    assert!(users.expiration("u1").unwrap().is_some());
    assert!(users.document("u2").unwrap().is_none());
    // The tombstone is still there to purge.
    users.purge("u2").unwrap();

    assert_eq!(users.indexes().unwrap(), ["by_city"]);
    assert_eq!(users.index_lookup("by_city", &[json!("Oslo")]).unwrap(), ["u1"]);
}

#[test]
fn revisions_keep_growing_across_reopen_and_compaction() {
    let dir = TempDir::new().unwrap();
    let first = {
        let db = Database::open("seq", config(dir.path())).unwrap();
        let coll = db.default_collection().unwrap();
        let mut d = Document::with_id("a");
        coll.save(&mut d).unwrap();
        coll.purge("a").unwrap();
        db.perform_maintenance(shelfdb_core::MaintenanceType::Compact)
            .unwrap();
        d.revision().unwrap()
    };

    let db = Database::open("seq", config(dir.path())).unwrap();
    let coll = db.default_collection().unwrap();
    let mut d = Document::with_id("a");
    coll.save(&mut d).unwrap();
    assert!(d.revision().unwrap() > first);
}

#[test]
fn committed_work_is_replayed_from_the_log() {
    let dir = TempDir::new().unwrap();
    let db = Database::open("live", config(dir.path())).unwrap();
    let coll = db.create_collection("events", "").unwrap();
    for i in 0..5 {
        let mut d = Document::from_json(format!("e{i}"), json!({"n": i})).unwrap();
        coll.save(&mut d).unwrap();
    }
    let sequence = db.last_sequence();

    // Snapshot the running database as a crash that lost the segment log
    // would leave it.
    let live = db.path().unwrap();
    let crashed = dir.path().join("crashed.shelfdb");
    fs::create_dir(&crashed).unwrap();
    fs::copy(live.join("MANIFEST"), crashed.join("MANIFEST")).unwrap();
    fs::copy(live.join("wal.log"), crashed.join("wal.log")).unwrap();
    drop(db);

    let db = Database::open("crashed", config(dir.path())).unwrap();
    assert_eq!(db.last_sequence(), sequence);
    let coll = db.collection("events", "").unwrap();
    assert_eq!(coll.count().unwrap(), 5);
    assert_eq!(coll.document("e3").unwrap().unwrap().get("n"), Some(&json!(3)));
}

#[test]
fn torn_tails_are_discarded() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open("torn", config(dir.path())).unwrap();
        let coll = db.default_collection().unwrap();
        coll.save(&mut Document::from_json("a", json!({"v": 1})).unwrap())
            .unwrap();
    }
    let bundle = dir.path().join("torn.shelfdb");
    append(&bundle.join("segments.dat"), &[0x07, 0x00, 0x00]);
    append(&bundle.join("wal.log"), b"SWAL\x02");

    let db = Database::open("torn", config(dir.path())).unwrap();
    let coll = db.default_collection().unwrap();
    assert_eq!(coll.document("a").unwrap().unwrap().get("v"), Some(&json!(1)));
    coll.save(&mut Document::with_id("b")).unwrap();
    db.close().unwrap();

    let db = Database::open("torn", config(dir.path())).unwrap();
    assert_eq!(db.default_collection().unwrap().count().unwrap(), 2);
}

#[test]
fn damaged_segment_refuses_to_open() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open("bad", config(dir.path())).unwrap();
        let coll = db.default_collection().unwrap();
        coll.save(&mut Document::from_json("a", json!({"v": 1})).unwrap())
            .unwrap();
    }
    let segments = dir.path().join("bad.shelfdb").join("segments.dat");
    let mut data = fs::read(&segments).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    fs::write(&segments, data).unwrap();

    let err = Database::open("bad", config(dir.path())).unwrap_err();
    assert!(matches!(
        err,
        DbError::ChecksumMismatch { .. } | DbError::Corruption { .. }
    ));
}

#[test]
fn second_handle_is_busy() {
    let dir = TempDir::new().unwrap();
    let db = Database::open("locked", config(dir.path())).unwrap();
    let err = Database::open("locked", config(dir.path())).unwrap_err();
    assert!(matches!(err, DbError::Busy { .. }));

    db.close().unwrap();
    Database::open("locked", config(dir.path())).unwrap();
}

#[test]
fn missing_database_without_create_is_not_found() {
    let dir = TempDir::new().unwrap();
    let err = Database::open("nothing", config(dir.path()).create_if_missing(false)).unwrap_err();
    assert!(err.is_not_found());
    assert!(!Database::exists("nothing", dir.path()));
}

#[test]
fn copy_exists_and_delete() {
    let dir = TempDir::new().unwrap();
    let db = Database::open("original", config(dir.path())).unwrap();
    let coll = db.default_collection().unwrap();
    coll.save(&mut Document::from_json("a", json!({"v": 1})).unwrap())
        .unwrap();
    let source = db.path().unwrap().to_path_buf();
    assert!(matches!(
        Database::copy(&source, "duplicate", &config(dir.path())),
        Err(DbError::Busy { .. })
    ));
    drop(db);

    Database::copy(&source, "duplicate", &config(dir.path())).unwrap();
    assert!(Database::exists("duplicate", dir.path()));
    let err = Database::copy(&source, "duplicate", &config(dir.path())).unwrap_err();
    assert!(matches!(err, DbError::InvalidArgument { .. }));

    {
        let copy = Database::open("duplicate", config(dir.path())).unwrap();
        let coll = copy.default_collection().unwrap();
        assert_eq!(coll.document("a").unwrap().unwrap().get("v"), Some(&json!(1)));
    }

    let open = Database::open("duplicate", config(dir.path())).unwrap();
    let err = Database::delete_database("duplicate", dir.path()).unwrap_err();
    assert!(matches!(err, DbError::Busy { .. }));
    drop(open);

    Database::delete_database("duplicate", dir.path()).unwrap();
    assert!(!Database::exists("duplicate", dir.path()));
    assert!(Database::exists("original", dir.path()));
    assert!(Database::delete_database("duplicate", dir.path())
        .unwrap_err()
        .is_not_found());
}

#[test]
fn delete_through_the_handle() {
    let dir = TempDir::new().unwrap();
    let db = Database::open("doomed", config(dir.path())).unwrap();
    db.default_collection()
        .unwrap()
        .save(&mut Document::with_id("a"))
        .unwrap();
    db.delete().unwrap();

    assert!(!db.is_open());
    assert!(!Database::exists("doomed", dir.path()));
}
