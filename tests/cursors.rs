use tempfile::tempdir;

use tupl::{Config, Database};

fn open_small(dir: &std::path::Path, name: &str) -> Database {
    Database::open(
        Config::new()
            .base_path(dir.join(name))
            .page_size(512),
    )
    .unwrap()
}

#[test]
fn forward_scan_in_key_order() {
    let tmp = tempdir().unwrap();
    let db = open_small(tmp.path(), "scan");
    let idx = db.open_index(b"t").unwrap();

    // Insert out of order; the scan must come back sorted.
    let mut keys: Vec<Vec<u8>> = (0..500u32)
        .map(|i| format!("key{:05}", (i * 7919) % 100000).into_bytes())
        .collect();
    for k in &keys {
        idx.store(k, b"v").unwrap();
    }
    keys.sort();
    keys.dedup();

    let mut cursor = idx.cursor();
    let mut seen = Vec::new();
    if cursor.first().unwrap() {
        seen.push(cursor.key().unwrap().to_vec());
        while cursor.next().unwrap() {
            seen.push(cursor.key().unwrap().to_vec());
        }
    }
    assert_eq!(seen, keys);
}

#[test]
fn backward_scan_mirrors_forward() {
    let tmp = tempdir().unwrap();
    let db = open_small(tmp.path(), "back");
    let idx = db.open_index(b"t").unwrap();
    for i in 0..300u32 {
        idx.store(format!("k{i:04}").as_bytes(), b"v").unwrap();
    }

    let mut cursor = idx.cursor();
    let mut seen = Vec::new();
    if cursor.last().unwrap() {
        seen.push(cursor.key().unwrap().to_vec());
        while cursor.previous().unwrap() {
            seen.push(cursor.key().unwrap().to_vec());
        }
    }
    seen.reverse();
    let want: Vec<Vec<u8>> = (0..300u32)
        .map(|i| format!("k{i:04}").into_bytes())
        .collect();
    assert_eq!(seen, want);
}

#[test]
fn find_positions_for_iteration() {
    let tmp = tempdir().unwrap();
    let db = open_small(tmp.path(), "find");
    let idx = db.open_index(b"t").unwrap();
    for i in (0..100u32).step_by(2) {
        idx.store(format!("k{i:03}").as_bytes(), format!("{i}").as_bytes())
            .unwrap();
    }

    let mut cursor = idx.cursor();
    // Exact hit.
    assert_eq!(cursor.find(b"k050").unwrap(), Some(b"50".to_vec()));
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.key().unwrap(), b"k052");

    // Miss lands between: next continues at the successor.
    assert_eq!(cursor.find(b"k051").unwrap(), None);
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.key().unwrap(), b"k052");

    // Miss past the end: nothing follows.
    assert_eq!(cursor.find(b"zzz").unwrap(), None);
    assert!(!cursor.next().unwrap());
}

#[test]
fn find_nearby_matches_full_find() {
    let tmp = tempdir().unwrap();
    let db = open_small(tmp.path(), "nearby");
    let idx = db.open_index(b"t").unwrap();
    for i in 0..400u32 {
        idx.store(format!("k{i:04}").as_bytes(), format!("{i}").as_bytes())
            .unwrap();
    }

    let mut cursor = idx.cursor();
    cursor.find(b"k0100").unwrap();
    // Sequential keys stay within the same leaf most of the time.
    for i in 101..160u32 {
        let got = cursor.find_nearby(format!("k{i:04}").as_bytes()).unwrap();
        assert_eq!(got, Some(format!("{i}").into_bytes()));
    }
    // A far jump falls back to a full descent.
    let got = cursor.find_nearby(b"k0350").unwrap();
    assert_eq!(got, Some(b"350".to_vec()));
}

#[test]
fn cursor_survives_splits_underneath() {
    let tmp = tempdir().unwrap();
    let db = open_small(tmp.path(), "split-under");
    let idx = db.open_index(b"t").unwrap();
    for i in 0..50u32 {
        idx.store(format!("k{i:04}").as_bytes(), b"v").unwrap();
    }

    let mut cursor = idx.cursor();
    cursor.find(b"k0000").unwrap();
    // Push plenty of inserts through while the cursor is parked; splits
    // must rebind its frames rather than strand it.
    for i in 50..600u32 {
        idx.store(format!("k{i:04}").as_bytes(), b"v").unwrap();
    }
    let mut count = 1;
    while cursor.next().unwrap() {
        count += 1;
    }
    assert_eq!(count, 600);
}

#[test]
fn scan_skips_ghosts() {
    let tmp = tempdir().unwrap();
    let db = open_small(tmp.path(), "ghosts");
    let idx = db.open_index(b"t").unwrap();
    for i in 0..20u32 {
        idx.store(format!("k{i:02}").as_bytes(), b"v").unwrap();
    }
    let mut txn = db.begin().unwrap();
    for i in (0..20u32).step_by(2) {
        txn.delete(&idx, format!("k{i:02}").as_bytes()).unwrap();
    }

    let mut cursor = idx.cursor();
    let mut seen = Vec::new();
    if cursor.first().unwrap() {
        seen.push(cursor.key().unwrap().to_vec());
        while cursor.next().unwrap() {
            seen.push(cursor.key().unwrap().to_vec());
        }
    }
    let want: Vec<Vec<u8>> = (0..20u32)
        .filter(|i| i % 2 == 1)
        .map(|i| format!("k{i:02}").into_bytes())
        .collect();
    assert_eq!(seen, want);
    txn.rollback().unwrap();
}

#[test]
fn random_key_stays_in_bounds() {
    let tmp = tempdir().unwrap();
    let db = open_small(tmp.path(), "random");
    let idx = db.open_index(b"t").unwrap();
    for i in 0..200u32 {
        idx.store(format!("k{i:03}").as_bytes(), b"v").unwrap();
    }
    for _ in 0..50 {
        let k = idx.random_key(None, None).unwrap().unwrap();
        assert!(idx.load(&k).unwrap().is_some());
    }
}
