use tempfile::tempdir;

use tupl::{Config, Database};

fn open_at(dir: &std::path::Path, name: &str) -> Database {
    Database::open(Config::new().base_path(dir.join(name))).unwrap()
}

#[test]
fn commit_makes_stores_visible() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "commit");
    let idx = db.open_index(b"t").unwrap();

    let mut txn = db.begin().unwrap();
    txn.store(&idx, b"k", b"v").unwrap();
    txn.commit().unwrap();
    assert_eq!(idx.load(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn rollback_restores_previous_values() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "rollback");
    let idx = db.open_index(b"t").unwrap();
    idx.store(b"k", b"before").unwrap();

    let mut txn = db.begin().unwrap();
    txn.store(&idx, b"k", b"during").unwrap();
    txn.store(&idx, b"fresh", b"x").unwrap();
    txn.rollback().unwrap();

    assert_eq!(idx.load(b"k").unwrap(), Some(b"before".to_vec()));
    assert_eq!(idx.load(b"fresh").unwrap(), None);
}

#[test]
fn dropped_transaction_rolls_back() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "drop");
    let idx = db.open_index(b"t").unwrap();
    {
        let mut txn = db.begin().unwrap();
        txn.store(&idx, b"k", b"v").unwrap();
    }
    assert_eq!(idx.load(b"k").unwrap(), None);
}

#[test]
fn transactional_delete_is_a_ghost_until_commit() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "ghost");
    let idx = db.open_index(b"t").unwrap();
    idx.store(b"k", b"v").unwrap();

    let mut txn = db.begin().unwrap();
    assert!(txn.delete(&idx, b"k").unwrap());
    // Ghosted: readers already treat it as absent.
    assert_eq!(idx.load(b"k").unwrap(), None);
    txn.rollback().unwrap();
    assert_eq!(idx.load(b"k").unwrap(), Some(b"v".to_vec()));

    let mut txn = db.begin().unwrap();
    assert!(txn.delete(&idx, b"k").unwrap());
    txn.commit().unwrap();
    assert_eq!(idx.load(b"k").unwrap(), None);
}

#[test]
fn nested_scope_rollback_keeps_outer_changes() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "nested");
    let idx = db.open_index(b"t").unwrap();

    let mut txn = db.begin().unwrap();
    txn.store(&idx, b"x", b"1").unwrap();
    txn.enter().unwrap();
    txn.store(&idx, b"x", b"2").unwrap();
    txn.rollback().unwrap();
    assert_eq!(idx.load(b"x").unwrap(), Some(b"1".to_vec()));
    txn.commit().unwrap();
    assert_eq!(idx.load(b"x").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn nested_scope_commit_folds_into_parent() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "nested-commit");
    let idx = db.open_index(b"t").unwrap();

    let mut txn = db.begin().unwrap();
    txn.enter().unwrap();
    txn.store(&idx, b"y", b"inner").unwrap();
    txn.commit().unwrap(); // seals the scope
    txn.rollback().unwrap(); // outer rollback still undoes it
    assert_eq!(idx.load(b"y").unwrap(), None);
}

#[test]
fn uncommitted_transaction_is_gone_after_crash() {
    let tmp = tempdir().unwrap();
    {
        let db = open_at(tmp.path(), "uncommitted");
        let idx = db.open_index(b"t").unwrap();
        let mut txn = db.begin().unwrap();
        txn.store(&idx, b"k", b"A").unwrap();
        // Neither committed nor rolled back; the process dies here.
        std::mem::forget(txn);
        db.simulate_crash();
    }

    let db = open_at(tmp.path(), "uncommitted");
    let idx = db.open_index(b"t").unwrap();
    assert_eq!(idx.load(b"k").unwrap(), None);
}

#[test]
fn committed_transaction_survives_crash() {
    let tmp = tempdir().unwrap();
    {
        let db = open_at(tmp.path(), "committed");
        let idx = db.open_index(b"t").unwrap();
        let mut txn = db.begin().unwrap();
        txn.store(&idx, b"k", b"B").unwrap();
        txn.commit().unwrap();
        db.simulate_crash();
    }

    let db = open_at(tmp.path(), "committed");
    let idx = db.open_index(b"t").unwrap();
    assert_eq!(idx.load(b"k").unwrap(), Some(b"B".to_vec()));
}

#[test]
fn uncommitted_work_checkpointed_then_crashed_rolls_back() {
    let tmp = tempdir().unwrap();
    {
        let db = open_at(tmp.path(), "mid-ckpt");
        let idx = db.open_index(b"t").unwrap();
        idx.store(b"base", b"1").unwrap();
        let mut txn = db.begin().unwrap();
        for i in 0..200u32 {
            txn.store(&idx, format!("txn{i:03}").as_bytes(), b"pending")
                .unwrap();
        }
        // The checkpoint flushes the dirty pages and serializes the
        // transaction's undo log into the master log.
        db.checkpoint().unwrap();
        std::mem::forget(txn);
        db.simulate_crash();
    }

    let db = open_at(tmp.path(), "mid-ckpt");
    let idx = db.open_index(b"t").unwrap();
    assert_eq!(idx.load(b"base").unwrap(), Some(b"1".to_vec()));
    for i in (0..200u32).step_by(17) {
        assert_eq!(idx.load(format!("txn{i:03}").as_bytes()).unwrap(), None);
    }
    assert_eq!(idx.verify().unwrap(), 1);
}

#[test]
fn large_transaction_spills_and_rolls_back() {
    let tmp = tempdir().unwrap();
    let db = Database::open(
        Config::new()
            .base_path(tmp.path().join("spill"))
            .page_size(512),
    )
    .unwrap();
    let idx = db.open_index(b"t").unwrap();

    let mut txn = db.begin().unwrap();
    // Far past half a page of undo entries, forcing the chain spill.
    for i in 0..500u32 {
        txn.store(&idx, format!("k{i:04}").as_bytes(), &[b'v'; 64])
            .unwrap();
    }
    txn.rollback().unwrap();
    assert_eq!(idx.verify().unwrap(), 0);

    let mut txn = db.begin().unwrap();
    for i in 0..500u32 {
        txn.store(&idx, format!("k{i:04}").as_bytes(), &[b'w'; 64])
            .unwrap();
    }
    txn.commit().unwrap();
    assert_eq!(idx.verify().unwrap(), 500);
}

#[test]
fn transaction_sees_its_own_writes() {
    let tmp = tempdir().unwrap();
    let db = open_at(tmp.path(), "own-writes");
    let idx = db.open_index(b"t").unwrap();

    let mut txn = db.begin().unwrap();
    txn.store(&idx, b"k", b"v").unwrap();
    assert_eq!(txn.load(&idx, b"k").unwrap(), Some(b"v".to_vec()));
    txn.commit().unwrap();
}
