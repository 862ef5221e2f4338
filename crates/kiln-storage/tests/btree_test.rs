//! Integration tests for the B+ tree index: structural scenarios on a
//! tiny-order tree, range scans, persistence, eviction pressure, a
//! randomized workload checked against a reference model, and concurrent
//! workloads over OS threads.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::{tempdir, TempDir};

use kiln_buffer::{BufferPool, BufferPoolConfig};
use kiln_common::KilnError;
use kiln_storage::{
    BTreeIndex, ColumnSpec, DiskManager, DiskManagerConfig, IndexScan, KeySchema, Rid, Transaction,
};

const FILE_ID: u32 = 1;

fn test_env(num_frames: usize) -> (TempDir, Arc<DiskManager>, Arc<BufferPool>) {
    let dir = tempdir().unwrap();
    let disk = Arc::new(
        DiskManager::new(DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        })
        .unwrap(),
    );
    let pool = Arc::new(BufferPool::new(BufferPoolConfig { num_frames }));
    (dir, disk, pool)
}

/// Single int column: order 339.
fn int_tree(disk: &Arc<DiskManager>, pool: &Arc<BufferPool>) -> BTreeIndex {
    let schema = KeySchema::new(vec![ColumnSpec::int()]).unwrap();
    BTreeIndex::create(Arc::clone(disk), Arc::clone(pool), FILE_ID, schema).unwrap()
}

/// Wide char column sized so four keys fill a node: order 4, min size 2.
fn tiny_order_tree(disk: &Arc<DiskManager>, pool: &Arc<BufferPool>) -> BTreeIndex {
    let schema = KeySchema::new(vec![ColumnSpec::char(1000)]).unwrap();
    BTreeIndex::create(Arc::clone(disk), Arc::clone(pool), FILE_ID, schema).unwrap()
}

/// Char column sized so five keys fill a node: order 5, min size 3. An odd
/// order makes twice the half-fill bound exceed capacity by one.
fn odd_order_tree(disk: &Arc<DiskManager>, pool: &Arc<BufferPool>) -> BTreeIndex {
    let schema = KeySchema::new(vec![ColumnSpec::char(800)]).unwrap();
    BTreeIndex::create(Arc::clone(disk), Arc::clone(pool), FILE_ID, schema).unwrap()
}

fn ik(v: i32) -> [u8; 4] {
    v.to_le_bytes()
}

/// Zero-padded decimal rendering keeps numeric and lexicographic order
/// aligned for the wide char keys.
fn wk(v: u32) -> Vec<u8> {
    let mut buf = format!("{v:012}").into_bytes();
    buf.resize(1000, 0);
    buf
}

/// Same encoding at the odd-order key width.
fn mk(v: u32) -> Vec<u8> {
    let mut buf = format!("{v:012}").into_bytes();
    buf.resize(800, 0);
    buf
}

fn r(v: u32) -> Rid {
    Rid::new(v, v)
}

/// Drains a scan into the rid page numbers (tests store the key value
/// there).
fn scan_values(scan: IndexScan<'_>) -> Vec<u32> {
    scan.map(|item| item.unwrap().page_num).collect()
}

#[test]
fn test_single_leaf_insert_and_lookup() {
    let (_dir, disk, pool) = test_env(64);
    let tree = tiny_order_tree(&disk, &pool);
    let txn = Transaction::new();

    assert!(tree.is_empty());
    for v in [10, 20, 30] {
        assert!(tree.insert_entry(&wk(v), r(v), &txn).unwrap().is_some());
    }
    assert!(!tree.is_empty());

    assert_eq!(tree.get_value(&wk(20), &txn).unwrap(), vec![r(20)]);
    assert_eq!(tree.get_value(&wk(25), &txn).unwrap(), vec![]);

    // Everything still fits in the leaf root
    let begin = tree.leaf_begin().unwrap();
    let end = tree.leaf_end().unwrap();
    assert_eq!(begin.page_num, end.page_num);
    assert_eq!(end.slot_num, 3);

    tree.check_integrity().unwrap();
}

#[test]
fn test_leaf_split_on_fill() {
    let (_dir, disk, pool) = test_env(64);
    let tree = tiny_order_tree(&disk, &pool);
    let txn = Transaction::new();

    // The fourth insert fills the leaf root and forces the first split
    for v in [10, 20, 30, 40] {
        tree.insert_entry(&wk(v), r(v), &txn).unwrap();
    }
    let begin = tree.leaf_begin().unwrap();
    let end = tree.leaf_end().unwrap();
    assert_ne!(begin.page_num, end.page_num);

    // A new global minimum descends the leftmost path
    assert!(tree.insert_entry(&wk(5), r(5), &txn).unwrap().is_some());

    for v in [5, 10, 20, 30, 40] {
        assert_eq!(tree.get_value(&wk(v), &txn).unwrap(), vec![r(v)]);
    }
    assert_eq!(tree.get_value(&wk(15), &txn).unwrap(), vec![]);

    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    assert_eq!(scan_values(scan), vec![5, 10, 20, 30, 40]);

    tree.check_integrity().unwrap();
}

#[test]
fn test_delete_coalesces_back_to_single_leaf() {
    let (_dir, disk, pool) = test_env(64);
    let tree = tiny_order_tree(&disk, &pool);
    let txn = Transaction::new();

    for v in [10, 20, 30, 40] {
        tree.insert_entry(&wk(v), r(v), &txn).unwrap();
    }
    tree.insert_entry(&wk(5), r(5), &txn).unwrap();

    // The right leaf underflows, borrows, then merges; the root collapses
    assert!(tree.delete_entry(&wk(40), &txn).unwrap());
    tree.check_integrity().unwrap();
    assert!(tree.delete_entry(&wk(30), &txn).unwrap());
    tree.check_integrity().unwrap();

    let begin = tree.leaf_begin().unwrap();
    let end = tree.leaf_end().unwrap();
    assert_eq!(begin.page_num, end.page_num);

    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    assert_eq!(scan_values(scan), vec![5, 10, 20]);

    // Deleting a missing key is a clean no-op
    assert!(!tree.delete_entry(&wk(40), &txn).unwrap());

    // Drain the tree completely and come back
    for v in [5, 10, 20] {
        assert!(tree.delete_entry(&wk(v), &txn).unwrap());
    }
    assert!(tree.is_empty());
    tree.check_integrity().unwrap();

    assert!(tree.insert_entry(&wk(7), r(7), &txn).unwrap().is_some());
    assert_eq!(tree.get_value(&wk(7), &txn).unwrap(), vec![r(7)]);
    tree.check_integrity().unwrap();
}

#[test]
fn test_deep_tree_and_global_minimum_paths() {
    let (_dir, disk, pool) = test_env(256);
    let tree = tiny_order_tree(&disk, &pool);
    let txn = Transaction::new();

    // Order 4 makes ~200 keys a multi-level tree
    for v in (100..300).rev() {
        tree.insert_entry(&wk(v), r(v), &txn).unwrap();
    }
    tree.check_integrity().unwrap();

    // New global minimum, then delete it again: both take the
    // leftmost-path descent
    tree.insert_entry(&wk(1), r(1), &txn).unwrap();
    tree.check_integrity().unwrap();
    assert_eq!(tree.get_value(&wk(1), &txn).unwrap(), vec![r(1)]);
    assert!(tree.delete_entry(&wk(1), &txn).unwrap());
    tree.check_integrity().unwrap();

    // Deleting below the global minimum is rejected by the probe
    assert!(!tree.delete_entry(&wk(50), &txn).unwrap());

    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    let expected: Vec<u32> = (100..300).collect();
    assert_eq!(scan_values(scan), expected);
}

#[test]
fn test_odd_order_merge_at_capacity() {
    let (_dir, disk, pool) = test_env(64);
    let tree = odd_order_tree(&disk, &pool);
    let txn = Transaction::new();

    assert_eq!(tree.order(), 5);

    // Six ascending inserts leave leaves [1,2,3] and [4,5,6] under one root
    for v in 1..=6 {
        tree.insert_entry(&mk(v), r(v), &txn).unwrap();
    }
    let begin = tree.leaf_begin().unwrap();
    let end = tree.leaf_end().unwrap();
    assert_ne!(begin.page_num, end.page_num);
    tree.check_integrity().unwrap();

    // Deleting 1 underflows the left leaf at a combined occupancy of
    // exactly five, one short of twice the half-fill bound: the leaves
    // coalesce into a single capacity-full leaf and the root collapses
    assert!(tree.delete_entry(&mk(1), &txn).unwrap());
    let begin = tree.leaf_begin().unwrap();
    let end = tree.leaf_end().unwrap();
    assert_eq!(begin.page_num, end.page_num);
    assert_eq!(end.slot_num, 5);

    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    assert_eq!(scan_values(scan), vec![2, 3, 4, 5, 6]);
    tree.check_integrity().unwrap();

    // A duplicate aimed at the full leaf stays a clean no-op
    assert!(tree.insert_entry(&mk(4), r(40), &txn).unwrap().is_none());
    assert_eq!(tree.get_value(&mk(4), &txn).unwrap(), vec![r(4)]);
    assert_eq!(
        tree.leaf_begin().unwrap().page_num,
        tree.leaf_end().unwrap().page_num
    );

    // A fresh insert has to make room first: the full leaf splits before
    // accepting the key
    assert!(tree.insert_entry(&mk(7), r(7), &txn).unwrap().is_some());
    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    assert_eq!(scan_values(scan), vec![2, 3, 4, 5, 6, 7]);
    for v in 2..=7 {
        assert_eq!(tree.get_value(&mk(v), &txn).unwrap(), vec![r(v)]);
    }
    tree.check_integrity().unwrap();
}

#[test]
fn test_randomized_odd_order_against_model() {
    let (_dir, disk, pool) = test_env(256);
    let tree = odd_order_tree(&disk, &pool);
    let txn = Transaction::new();

    let mut rng = StdRng::seed_from_u64(0x0DD5);
    let mut model: BTreeMap<u32, Rid> = BTreeMap::new();

    for step in 1..=1500 {
        let v = rng.gen_range(0..300u32);
        if rng.gen_bool(0.55) {
            let inserted = tree.insert_entry(&mk(v), r(v), &txn).unwrap().is_some();
            let fresh = model.insert(v, r(v)).is_none();
            assert_eq!(inserted, fresh, "insert {v} diverged at step {step}");
        } else {
            let deleted = tree.delete_entry(&mk(v), &txn).unwrap();
            let present = model.remove(&v).is_some();
            assert_eq!(deleted, present, "delete {v} diverged at step {step}");
        }

        if step % 250 == 0 {
            let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
            let got = scan_values(scan);
            let expected: Vec<u32> = model.keys().copied().collect();
            assert_eq!(got, expected, "scan diverged at step {step}");
            tree.check_integrity().unwrap();
        }
    }

    for v in 0..300u32 {
        let got = tree.get_value(&mk(v), &txn).unwrap();
        match model.get(&v) {
            Some(&rid) => assert_eq!(got, vec![rid]),
            None => assert_eq!(got, vec![]),
        }
    }
    tree.check_integrity().unwrap();
}

#[test]
fn test_sequential_insert_and_range_scan() {
    let (_dir, disk, pool) = test_env(64);
    let tree = int_tree(&disk, &pool);
    let txn = Transaction::new();

    for v in 1..=100 {
        tree.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
    }

    // [10, 20) in key order
    let scan = tree
        .scan_range(Some(&ik(10)), true, Some(&ik(20)), false, &txn)
        .unwrap();
    let expected: Vec<u32> = (10..20).collect();
    assert_eq!(scan_values(scan), expected);

    tree.check_integrity().unwrap();
}

#[test]
fn test_scan_bound_inclusivity() {
    let (_dir, disk, pool) = test_env(64);
    let tree = int_tree(&disk, &pool);
    let txn = Transaction::new();

    for v in (2..=20).step_by(2) {
        tree.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
    }

    let range = |lo: Option<i32>, lo_inc: bool, hi: Option<i32>, hi_inc: bool| {
        let lo_key = lo.map(ik);
        let hi_key = hi.map(ik);
        let scan = tree
            .scan_range(
                lo_key.as_ref().map(|k| &k[..]),
                lo_inc,
                hi_key.as_ref().map(|k| &k[..]),
                hi_inc,
                &txn,
            )
            .unwrap();
        scan_values(scan)
    };

    // Bounds on present keys
    assert_eq!(range(Some(6), true, Some(14), true), vec![6, 8, 10, 12, 14]);
    assert_eq!(range(Some(6), false, Some(14), true), vec![8, 10, 12, 14]);
    assert_eq!(range(Some(6), true, Some(14), false), vec![6, 8, 10, 12]);
    assert_eq!(range(Some(6), false, Some(14), false), vec![8, 10, 12]);

    // Bounds between keys: inclusivity no longer matters
    assert_eq!(range(Some(7), true, Some(15), true), vec![8, 10, 12, 14]);
    assert_eq!(range(Some(7), false, Some(15), false), vec![8, 10, 12, 14]);

    // Open ends
    assert_eq!(range(None, true, Some(10), true), vec![2, 4, 6, 8, 10]);
    assert_eq!(range(Some(16), true, None, true), vec![16, 18, 20]);
    assert_eq!(
        range(None, true, None, true),
        vec![2, 4, 6, 8, 10, 12, 14, 16, 18, 20]
    );

    // Entirely above and entirely below the stored keys
    assert_eq!(range(Some(30), true, Some(40), true), Vec::<u32>::new());
    assert_eq!(range(Some(0), true, Some(1), true), Vec::<u32>::new());
}

#[test]
fn test_empty_tree_operations() {
    let (_dir, disk, pool) = test_env(64);
    let tree = int_tree(&disk, &pool);
    let txn = Transaction::new();

    assert!(tree.is_empty());
    assert_eq!(tree.get_value(&ik(1), &txn).unwrap(), vec![]);
    assert!(!tree.delete_entry(&ik(1), &txn).unwrap());

    // begin == end: nothing to scan
    assert_eq!(tree.leaf_begin().unwrap(), tree.leaf_end().unwrap());
    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    assert_eq!(scan_values(scan), Vec::<u32>::new());

    let scan = tree
        .scan_range(Some(&ik(1)), true, Some(&ik(9)), true, &txn)
        .unwrap();
    assert_eq!(scan_values(scan), Vec::<u32>::new());

    tree.check_integrity().unwrap();
}

#[test]
fn test_duplicate_insert_ignored() {
    let (_dir, disk, pool) = test_env(64);
    let tree = int_tree(&disk, &pool);
    let txn = Transaction::new();

    assert!(tree.insert_entry(&ik(7), r(7), &txn).unwrap().is_some());
    // Same key again, even with a different rid: rejected
    assert!(tree.insert_entry(&ik(7), r(99), &txn).unwrap().is_none());

    assert_eq!(tree.get_value(&ik(7), &txn).unwrap(), vec![r(7)]);
    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    assert_eq!(scan_values(scan).len(), 1);

    // Duplicate of a key sitting in a full leaf must not split anything
    for v in 1..=200 {
        tree.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
    }
    assert!(tree.insert_entry(&ik(100), r(1000), &txn).unwrap().is_none());
    assert_eq!(tree.get_value(&ik(100), &txn).unwrap(), vec![r(100)]);
    tree.check_integrity().unwrap();
}

#[test]
fn test_delete_then_reinsert() {
    let (_dir, disk, pool) = test_env(64);
    let tree = int_tree(&disk, &pool);
    let txn = Transaction::new();

    for v in 1..=50 {
        tree.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
    }

    assert!(tree.delete_entry(&ik(25), &txn).unwrap());
    assert_eq!(tree.get_value(&ik(25), &txn).unwrap(), vec![]);

    // Reinsert under a fresh rid behaves as if the key was never there
    assert!(tree.insert_entry(&ik(25), r(2500), &txn).unwrap().is_some());
    assert_eq!(tree.get_value(&ik(25), &txn).unwrap(), vec![r(2500)]);

    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    let expected: Vec<u32> = (1..=50).collect();
    assert_eq!(scan_values(scan), expected);
    tree.check_integrity().unwrap();
}

#[test]
fn test_get_rid_and_bound_positions() {
    let (_dir, disk, pool) = test_env(64);
    let tree = int_tree(&disk, &pool);
    let txn = Transaction::new();

    for v in 1..=5 {
        tree.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
    }

    let iid = tree.lower_bound(&ik(3), &txn).unwrap();
    assert_eq!(tree.get_rid(iid).unwrap(), r(3));

    // upper_bound lands one past the equal key
    let iid = tree.upper_bound(&ik(3), &txn).unwrap();
    assert_eq!(tree.get_rid(iid).unwrap(), r(4));

    // Past the last key, both bounds collapse to leaf_end, which holds no
    // rid
    let end = tree.leaf_end().unwrap();
    assert_eq!(tree.lower_bound(&ik(100), &txn).unwrap(), end);
    assert!(matches!(
        tree.get_rid(end),
        Err(KilnError::BadSlot { .. })
    ));
}

#[test]
fn test_scan_drop_releases_latches() {
    let (_dir, disk, pool) = test_env(64);
    let tree = int_tree(&disk, &pool);
    let txn = Transaction::new();

    for v in 1..=600 {
        tree.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
    }

    {
        let mut scan = tree.scan_range(None, true, None, true, &txn).unwrap();
        // Consume a few entries, then drop mid-leaf
        for _ in 0..3 {
            scan.next().unwrap().unwrap();
        }
        assert!(!scan.is_done());
    }

    // A write into the leaf the scan was parked on must go through
    assert!(tree.delete_entry(&ik(2), &txn).unwrap());
    assert!(tree.insert_entry(&ik(2), r(2), &txn).unwrap().is_some());
    tree.check_integrity().unwrap();
}

#[test]
fn test_persistence_roundtrip() {
    let dir = tempdir().unwrap();
    let config = DiskManagerConfig {
        data_dir: dir.path().to_path_buf(),
        fsync_enabled: false,
    };

    {
        let disk = Arc::new(DiskManager::new(config.clone()).unwrap());
        let pool = Arc::new(BufferPool::new(BufferPoolConfig { num_frames: 64 }));
        let tree = int_tree(&disk, &pool);
        let txn = Transaction::new();

        for v in 1..=200 {
            tree.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
        }
        tree.delete_entry(&ik(50), &txn).unwrap();
        tree.flush().unwrap();
    }

    // Fresh disk manager and a cold buffer pool: everything comes back
    // from the file
    let disk = Arc::new(DiskManager::new(config).unwrap());
    let pool = Arc::new(BufferPool::new(BufferPoolConfig { num_frames: 64 }));
    let tree = BTreeIndex::open(Arc::clone(&disk), Arc::clone(&pool), FILE_ID).unwrap();
    let txn = Transaction::new();

    assert_eq!(tree.order(), 339);
    assert_eq!(tree.get_value(&ik(17), &txn).unwrap(), vec![r(17)]);
    assert_eq!(tree.get_value(&ik(50), &txn).unwrap(), vec![]);

    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    let expected: Vec<u32> = (1..=200).filter(|&v| v != 50).collect();
    assert_eq!(scan_values(scan), expected);
    tree.check_integrity().unwrap();

    // The reopened index keeps working as a live index
    tree.insert_entry(&ik(201), r(201), &txn).unwrap();
    tree.insert_entry(&ik(50), r(5000), &txn).unwrap();
    assert_eq!(tree.get_value(&ik(50), &txn).unwrap(), vec![r(5000)]);
    tree.check_integrity().unwrap();
}

#[test]
fn test_open_rejects_foreign_file() {
    let (_dir, disk, pool) = test_env(64);
    // File 9 exists but holds zeroes, not an index header
    disk.allocate_page(9).unwrap();
    let result = BTreeIndex::open(Arc::clone(&disk), Arc::clone(&pool), 9);
    assert!(matches!(result, Err(KilnError::BTreeCorrupted(_))));
}

#[test]
fn test_small_pool_spills_to_disk() {
    // Eight frames cannot hold the ~10 pages this workload creates, so
    // fetches continually go through eviction and reload
    let (_dir, disk, pool) = test_env(8);
    let tree = int_tree(&disk, &pool);
    let txn = Transaction::new();

    for v in 1..=2000 {
        tree.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
    }

    for v in (1..=2000).step_by(97) {
        assert_eq!(tree.get_value(&ik(v), &txn).unwrap(), vec![r(v as u32)]);
    }

    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    let expected: Vec<u32> = (1..=2000).collect();
    assert_eq!(scan_values(scan), expected);
    tree.check_integrity().unwrap();
}

#[test]
fn test_randomized_against_model() {
    let (_dir, disk, pool) = test_env(256);
    let tree = tiny_order_tree(&disk, &pool);
    let txn = Transaction::new();

    let mut rng = StdRng::seed_from_u64(0xB17E5);
    let mut model: BTreeMap<u32, Rid> = BTreeMap::new();

    for step in 1..=1500 {
        let v = rng.gen_range(0..400u32);
        if rng.gen_bool(0.55) {
            let inserted = tree.insert_entry(&wk(v), r(v), &txn).unwrap().is_some();
            let fresh = model.insert(v, r(v)).is_none();
            assert_eq!(inserted, fresh, "insert {v} diverged at step {step}");
        } else {
            let deleted = tree.delete_entry(&wk(v), &txn).unwrap();
            let present = model.remove(&v).is_some();
            assert_eq!(deleted, present, "delete {v} diverged at step {step}");
        }

        if step % 250 == 0 {
            let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
            let got = scan_values(scan);
            let expected: Vec<u32> = model.keys().copied().collect();
            assert_eq!(got, expected, "scan diverged at step {step}");
            tree.check_integrity().unwrap();
        }
    }

    for v in 0..400u32 {
        let got = tree.get_value(&wk(v), &txn).unwrap();
        match model.get(&v) {
            Some(&rid) => assert_eq!(got, vec![rid]),
            None => assert_eq!(got, vec![]),
        }
    }
    tree.check_integrity().unwrap();
}

#[test]
fn test_concurrent_disjoint_inserts() {
    let (_dir, disk, pool) = test_env(512);
    let tree = int_tree(&disk, &pool);

    std::thread::scope(|s| {
        let low = &tree;
        let high = &tree;
        s.spawn(move || {
            let txn = Transaction::new();
            for v in 1..=10_000 {
                low.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
            }
        });
        s.spawn(move || {
            let txn = Transaction::new();
            for v in 10_001..=20_000 {
                high.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
            }
        });
    });

    let txn = Transaction::new();
    for v in (1..=20_000).step_by(71) {
        assert_eq!(tree.get_value(&ik(v), &txn).unwrap(), vec![r(v as u32)]);
    }

    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    let all = scan_values(scan);
    let expected: Vec<u32> = (1..=20_000).collect();
    assert_eq!(all, expected);

    tree.check_integrity().unwrap();
}

#[test]
fn test_concurrent_readers_and_writers() {
    let (_dir, disk, pool) = test_env(512);
    let tree = int_tree(&disk, &pool);

    {
        let txn = Transaction::new();
        for v in 1..=5_000 {
            tree.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
        }
    }

    std::thread::scope(|s| {
        let writer = &tree;
        s.spawn(move || {
            let txn = Transaction::new();
            for v in 5_001..=8_000 {
                writer.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
            }
        });
        for _ in 0..3 {
            let reader = &tree;
            s.spawn(move || {
                let txn = Transaction::new();
                for v in (1..=5_000).step_by(13) {
                    assert_eq!(reader.get_value(&ik(v), &txn).unwrap(), vec![r(v as u32)]);
                }
            });
        }
    });

    tree.check_integrity().unwrap();
}

#[test]
fn test_concurrent_deletes_with_scan() {
    let (_dir, disk, pool) = test_env(512);
    let tree = int_tree(&disk, &pool);

    {
        let txn = Transaction::new();
        for v in 1..=1000 {
            tree.insert_entry(&ik(v), r(v as u32), &txn).unwrap();
        }
    }

    let seen = std::thread::scope(|s| {
        let deleter = &tree;
        s.spawn(move || {
            let txn = Transaction::new();
            for v in (1..=999).step_by(2) {
                deleter.delete_entry(&ik(v), &txn).unwrap();
            }
        });

        let txn = Transaction::new();
        let scan = tree
            .scan_range(Some(&ik(1)), true, Some(&ik(1000)), true, &txn)
            .unwrap();
        scan_values(scan)
    });

    // The scan ran against a moving tree: strictly ascending, no
    // duplicates, nothing outside the stored range, and no even key
    // skipped (they were never deleted)
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert!(seen.iter().all(|&v| (1..=1000).contains(&v)));
    for v in (2..=1000).step_by(2) {
        assert!(seen.contains(&v), "scan lost even key {v}");
    }

    // After the deleter drains, exactly the evens remain
    let txn = Transaction::new();
    let scan = tree.scan_range(None, true, None, true, &txn).unwrap();
    let expected: Vec<u32> = (2..=1000).step_by(2).collect();
    assert_eq!(scan_values(scan), expected);
    tree.check_integrity().unwrap();
}
