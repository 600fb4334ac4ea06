use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tempfile::tempdir;

use tupl::{Config, Database};

#[test]
fn reader_follows_concurrent_ascending_writer() {
    let tmp = tempdir().unwrap();
    let db = Arc::new(
        Database::open(
            Config::new()
                .base_path(tmp.path().join("follow"))
                .page_size(512),
        )
        .unwrap(),
    );
    let idx = db.open_index(b"t").unwrap();

    const N: u32 = 5000;
    let writer_done = Arc::new(AtomicBool::new(false));

    let w_idx = idx.clone();
    let w_done = writer_done.clone();
    let writer = thread::spawn(move || {
        for i in 0..N {
            w_idx
                .store(format!("a{i:04}").as_bytes(), format!("{i}").as_bytes())
                .unwrap();
        }
        w_done.store(true, Ordering::Release);
    });

    // The reader walks behind the writer. It must observe a contiguous
    // prefix: strictly ascending keys with no duplicates and no gaps
    // within the visited range.
    let mut cursor = idx.cursor();
    let mut seen: Vec<u32> = Vec::new();
    if cursor.find(b"a0000").unwrap().is_some() {
        seen.push(0);
    }
    loop {
        if cursor.next().unwrap() {
            let key = cursor.key().unwrap();
            let n: u32 = std::str::from_utf8(&key[1..]).unwrap().parse().unwrap();
            seen.push(n);
            if seen.len() as u32 == N {
                break;
            }
        } else if writer_done.load(Ordering::Acquire) {
            // One final sweep after the writer finished.
            if !cursor.next().unwrap() {
                break;
            }
            let key = cursor.key().unwrap();
            let n: u32 = std::str::from_utf8(&key[1..]).unwrap().parse().unwrap();
            seen.push(n);
        } else {
            thread::yield_now();
        }
    }
    writer.join().unwrap();

    assert!(!seen.is_empty());
    for (pos, n) in seen.iter().enumerate() {
        assert_eq!(*n as usize, seen[0] as usize + pos, "gap or duplicate at {pos}");
    }
    assert_eq!(*seen.first().unwrap(), 0);
}

#[test]
fn parallel_writers_then_reopen() {
    let tmp = tempdir().unwrap();
    let base = tmp.path().join("parallel");
    {
        let db = Arc::new(Database::open(Config::new().base_path(&base)).unwrap());
        let idx = db.open_index(b"t").unwrap();

        let mut handles = Vec::new();
        for t in 0..4u32 {
            let idx = idx.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100u32 {
                    idx.store(
                        format!("t{t}-{i:03}").as_bytes(),
                        format!("{t}:{i}").as_bytes(),
                    )
                    .unwrap();
                }
            }));
        }
        // Checkpoints race the writers the whole way.
        for _ in 0..5 {
            db.checkpoint().unwrap();
        }
        for h in handles {
            h.join().unwrap();
        }
        db.checkpoint().unwrap();
        db.close().unwrap();
    }

    let db = Database::open(Config::new().base_path(&base)).unwrap();
    let idx = db.open_index(b"t").unwrap();
    for t in 0..4u32 {
        for i in 0..100u32 {
            assert_eq!(
                idx.load(format!("t{t}-{i:03}").as_bytes()).unwrap(),
                Some(format!("{t}:{i}").into_bytes()),
                "lost t{t}-{i:03}"
            );
        }
    }
    assert_eq!(idx.verify().unwrap(), 400);
}

#[test]
fn acknowledged_writes_survive_crash_during_checkpoint_pressure() {
    let tmp = tempdir().unwrap();
    let base = tmp.path().join("acked");
    {
        let db = Arc::new(Database::open(Config::new().base_path(&base)).unwrap());
        let idx = db.open_index(b"t").unwrap();

        let mut handles = Vec::new();
        for t in 0..3u32 {
            let idx = idx.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100u32 {
                    idx.store(format!("w{t}-{i:03}").as_bytes(), b"1").unwrap();
                }
            }));
        }
        db.checkpoint().unwrap();
        for h in handles {
            h.join().unwrap();
        }
        // Every store above was acknowledged; a crash must lose none.
        match Arc::try_unwrap(db) {
            Ok(db) => db.simulate_crash(),
            Err(_) => panic!("database still shared"),
        }
    }

    let db = Database::open(Config::new().base_path(&base)).unwrap();
    let idx = db.open_index(b"t").unwrap();
    for t in 0..3u32 {
        for i in 0..100u32 {
            assert_eq!(
                idx.load(format!("w{t}-{i:03}").as_bytes()).unwrap(),
                Some(b"1".to_vec())
            );
        }
    }
}

#[test]
fn mixed_transactions_across_threads() {
    let tmp = tempdir().unwrap();
    let db = Arc::new(Database::open(Config::new().base_path(tmp.path().join("mixed"))).unwrap());
    let idx = db.open_index(b"t").unwrap();

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let db = db.clone();
        let idx = idx.clone();
        handles.push(thread::spawn(move || {
            for i in 0..50u32 {
                let mut txn = db.begin().unwrap();
                txn.store(&idx, format!("c{t}-{i:02}").as_bytes(), b"keep")
                    .unwrap();
                txn.store(&idx, format!("r{t}-{i:02}").as_bytes(), b"drop")
                    .unwrap();
                if i % 2 == 0 {
                    txn.commit().unwrap();
                } else {
                    txn.rollback().unwrap();
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..4u32 {
        for i in 0..50u32 {
            let committed = i % 2 == 0;
            let c = idx.load(format!("c{t}-{i:02}").as_bytes()).unwrap();
            assert_eq!(c.is_some(), committed);
        }
    }
    db.verify().unwrap();
}
