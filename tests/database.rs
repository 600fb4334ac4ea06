use tempfile::tempdir;

use tupl::{Config, Database, TuplError};

fn open_at(dir: &std::path::Path, name: &str) -> Database {
    Database::open(Config::new().base_path(dir.join(name))).unwrap()
}

#[test]
fn store_load_roundtrip() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "basic");
    let idx = db.open_index(b"t").unwrap();

    idx.store(b"a", b"1").unwrap();
    assert_eq!(idx.load(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(idx.load(b"b").unwrap(), None);

    idx.store(b"a", b"2").unwrap();
    assert_eq!(idx.load(b"a").unwrap(), Some(b"2".to_vec()));

    assert!(idx.delete(b"a").unwrap());
    assert!(!idx.delete(b"a").unwrap());
    assert_eq!(idx.load(b"a").unwrap(), None);
}

#[test]
fn checkpoint_then_reopen_preserves_data() {
    let tmp = tempdir().unwrap();
    {
        let db = open_at(tmp.path(), "persist");
        let idx = db.open_index(b"t").unwrap();
        idx.store(b"a", b"1").unwrap();
        db.checkpoint().unwrap();
        db.close().unwrap();
    }

    let db = open_at(tmp.path(), "persist");
    let idx = db.open_index(b"t").unwrap();
    assert_eq!(idx.load(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(idx.load(b"b").unwrap(), None);
}

#[test]
fn synced_store_survives_a_crash() {
    let tmp = tempdir().unwrap();
    {
        let db = open_at(tmp.path(), "crash");
        let idx = db.open_index(b"t").unwrap();
        idx.store(b"k", b"v").unwrap();
        // No checkpoint, no clean close: the redo log alone carries it.
        db.simulate_crash();
    }

    let db = open_at(tmp.path(), "crash");
    let idx = db.open_index(b"t").unwrap();
    assert_eq!(idx.load(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn many_keys_across_splits_and_reopen() {
    let tmp = tempdir().unwrap();
    let key = |i: u32| format!("key{i:05}").into_bytes();
    let value = |i: u32| format!("value-{i}").into_bytes();
    {
        let db = Database::open(
            Config::new()
                .base_path(tmp.path().join("many"))
                .page_size(512),
        )
        .unwrap();
        let idx = db.open_index(b"t").unwrap();
        for i in 0..2000u32 {
            idx.store(&key(i), &value(i)).unwrap();
        }
        assert_eq!(idx.verify().unwrap(), 2000);
        db.close().unwrap();
    }

    let db = Database::open(
        Config::new()
            .base_path(tmp.path().join("many"))
            .page_size(512),
    )
    .unwrap();
    let idx = db.open_index(b"t").unwrap();
    for i in (0..2000u32).step_by(37) {
        assert_eq!(idx.load(&key(i)).unwrap(), Some(value(i)));
    }
    assert_eq!(idx.verify().unwrap(), 2000);
}

#[test]
fn deletes_shrink_and_survive_reopen() {
    let tmp = tempdir().unwrap();
    let key = |i: u32| format!("key{i:05}").into_bytes();
    {
        let db = Database::open(
            Config::new()
                .base_path(tmp.path().join("shrink"))
                .page_size(512),
        )
        .unwrap();
        let idx = db.open_index(b"t").unwrap();
        for i in 0..1000u32 {
            idx.store(&key(i), b"x").unwrap();
        }
        for i in 0..1000u32 {
            if i % 2 == 0 {
                assert!(idx.delete(&key(i)).unwrap());
            }
        }
        assert_eq!(idx.verify().unwrap(), 500);
        db.close().unwrap();
    }

    let db = Database::open(
        Config::new()
            .base_path(tmp.path().join("shrink"))
            .page_size(512),
    )
    .unwrap();
    let idx = db.open_index(b"t").unwrap();
    assert_eq!(idx.load(&key(0)).unwrap(), None);
    assert_eq!(idx.load(&key(1)).unwrap(), Some(b"x".to_vec()));
    assert_eq!(idx.verify().unwrap(), 500);
}

#[test]
fn second_open_of_same_base_is_refused() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "locked");
    let err = Database::open(Config::new().base_path(tmp.path().join("locked"))).unwrap_err();
    assert!(matches!(err, TuplError::Storage(_) | TuplError::Io(_)));
    drop(db);
    // Released on close; a fresh open succeeds.
    let db2 = open_at(tmp.path(), "locked");
    db2.close().unwrap();
}

#[test]
fn rename_and_delete_index() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "names");
    let idx = db.open_index(b"first").unwrap();
    idx.store(b"k", b"v").unwrap();

    db.rename_index(&idx, b"second").unwrap();
    assert!(db.find_index(b"first").unwrap().is_none());
    let renamed = db.find_index(b"second").unwrap().unwrap();
    assert_eq!(renamed.load(b"k").unwrap(), Some(b"v".to_vec()));

    db.delete_index(renamed).unwrap();
    assert!(db.find_index(b"second").unwrap().is_none());
    assert!(matches!(idx.load(b"k"), Err(TuplError::ClosedIndex)));
}

#[test]
fn rename_survives_crash_recovery() {
    let tmp = tempdir().unwrap();
    {
        let db = open_at(tmp.path(), "rename-crash");
        let idx = db.open_index(b"old").unwrap();
        idx.store(b"k", b"v").unwrap();
        db.checkpoint().unwrap();
        db.rename_index(&idx, b"new").unwrap();
        db.simulate_crash();
    }

    let db = open_at(tmp.path(), "rename-crash");
    assert!(db.find_index(b"old").unwrap().is_none());
    let idx = db.find_index(b"new").unwrap().unwrap();
    assert_eq!(idx.load(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn non_durable_database_works_in_memory() {
    let db = Database::open(Config::new()).unwrap();
    let idx = db.open_index(b"mem").unwrap();
    for i in 0..500u32 {
        idx.store(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
            .unwrap();
    }
    assert_eq!(idx.load(b"k123").unwrap(), Some(b"v123".to_vec()));
    assert!(idx.delete(b"k123").unwrap());
    assert_eq!(idx.load(b"k123").unwrap(), None);
}

#[test]
fn stats_reflect_activity() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "stats");
    let idx = db.open_index(b"t").unwrap();
    idx.store(b"a", b"1").unwrap();
    let stats = db.stats();
    assert!(stats.total_pages > 2);
    assert!(stats.cached_nodes > 0);
    assert_eq!(stats.page_size, 4096);
    db.checkpoint().unwrap();
    let after = db.stats();
    assert!(after.checkpoint_number > stats.checkpoint_number);
}

#[test]
fn ancillary_files_exist() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "files");
    db.checkpoint().unwrap();
    assert!(tmp.path().join("files.db").exists());
    assert!(tmp.path().join("files.lock").exists());
    assert!(tmp.path().join("files.info").exists());
    db.close().unwrap();
}
