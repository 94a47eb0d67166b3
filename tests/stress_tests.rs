//! Stress tests for concurrent tree operations.
//!
//! These tests are designed to expose race conditions through:
//! - High thread counts over disjoint and overlapping key ranges
//! - SMO-hostile thresholds so splits, merges, and consolidations churn
//! - Mixed read/write workloads
//! - Post-join full verification of content and structure
//!
//! Run with:
//! ```bash
//! cargo test --test stress_tests --release
//! ```

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use bwtree::{BwTree, BwTreeConfig, InsertError};

fn churny_config() -> BwTreeConfig {
    BwTreeConfig {
        split_threshold: 8,
        merge_threshold: 3,
        consolidate_threshold: 4,
        mapping_table_slots: 1 << 20,
    }
}

/// Verify all expected keys are findable, panic with details if any missing.
fn verify_all_keys(tree: &BwTree<u64, u64>, keys: impl Iterator<Item = u64>, test_name: &str) {
    let mut missing = Vec::new();

    for k in keys {
        if tree.lookup(&k).is_none() {
            missing.push(k);
        }
    }

    if !missing.is_empty() {
        let sample: Vec<_> = missing.iter().take(20).collect();
        panic!(
            "{}: missing {} keys (showing first 20): {:?}, tree.len()={}",
            test_name,
            missing.len(),
            sample,
            tree.len(),
        );
    }
}

// =============================================================================
// DISJOINT-RANGE WRITERS
// =============================================================================

#[test]
fn stress_disjoint_inserts_8_threads() {
    common::init_tracing();

    const NUM_THREADS: u64 = 8;
    const KEYS_PER_THREAD: u64 = 2000;

    let tree = Arc::new(BwTree::new(churny_config()));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for i in 0..KEYS_PER_THREAD {
                    let key = t * KEYS_PER_THREAD + i;
                    tree.insert(key, key * 10).unwrap();

                    // Immediate read-your-write verification.
                    assert_eq!(tree.lookup(&key), Some(key * 10), "lost own write {key}");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    tree.check_invariants();
    verify_all_keys(
        &tree,
        0..NUM_THREADS * KEYS_PER_THREAD,
        "stress_disjoint_inserts",
    );
    assert_eq!(tree.len(), (NUM_THREADS * KEYS_PER_THREAD) as usize);
}

#[test]
fn stress_interleaved_inserts_4_threads() {
    common::init_tracing();

    const NUM_THREADS: u64 = 4;
    const TOTAL_KEYS: u64 = 8000;

    let tree = Arc::new(BwTree::new(churny_config()));

    // Thread t inserts keys congruent to t mod NUM_THREADS, so neighbouring
    // keys come from different threads and every leaf sees contention.
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut k = t;
                while k < TOTAL_KEYS {
                    tree.insert(k, k).unwrap();
                    k += NUM_THREADS;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    tree.check_invariants();
    verify_all_keys(&tree, 0..TOTAL_KEYS, "stress_interleaved_inserts");

    let ordered: Vec<_> = tree.scan(..).map(|(k, _)| k).collect();
    assert_eq!(ordered, (0..TOTAL_KEYS).collect::<Vec<_>>());
}

// =============================================================================
// SAME-KEY CONTENTION
// =============================================================================

#[test]
fn stress_same_key_contention() {
    common::init_tracing();

    const NUM_THREADS: usize = 8;
    const KEYS: u64 = 512;

    let tree = Arc::new(BwTree::new(churny_config()));
    let wins = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let wins = Arc::clone(&wins);
            thread::spawn(move || {
                for k in 0..KEYS {
                    match tree.insert(k, t as u64) {
                        Ok(()) => {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }

                        Err(InsertError::KeyExists) => {}
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Exactly one thread won each key; nobody overwrote anybody.
    assert_eq!(wins.load(Ordering::Relaxed), KEYS as usize);
    assert_eq!(tree.len(), KEYS as usize);
    tree.check_invariants();
}

// =============================================================================
// MIXED READERS AND WRITERS
// =============================================================================

#[test]
fn stress_readers_during_writes() {
    common::init_tracing();

    const WRITERS: u64 = 4;
    const READERS: usize = 4;
    const KEYS_PER_WRITER: u64 = 2000;

    let tree = Arc::new(BwTree::new(churny_config()));

    let writer_handles: Vec<_> = (0..WRITERS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for i in 0..KEYS_PER_WRITER {
                    let key = t * KEYS_PER_WRITER + i;
                    tree.insert(key, key).unwrap();
                }
            })
        })
        .collect();

    let reader_handles: Vec<_> = (0..READERS)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                // Readers sweep while the tree is growing; any value they do
                // see must be the one its writer inserted, and scans must
                // always come out ordered and duplicate-free.
                for _ in 0..20 {
                    for key in 0..WRITERS * KEYS_PER_WRITER {
                        if let Some(v) = tree.lookup(&key) {
                            assert_eq!(v, key, "torn read for key {key}");
                        }
                    }

                    let snapshot: Vec<_> = tree.scan(..).map(|(k, _)| k).collect();
                    assert!(
                        snapshot.windows(2).all(|w| w[0] < w[1]),
                        "unordered or duplicated scan output"
                    );
                }
            })
        })
        .collect();

    for handle in writer_handles {
        handle.join().unwrap();
    }
    for handle in reader_handles {
        handle.join().unwrap();
    }

    tree.check_invariants();
    verify_all_keys(&tree, 0..WRITERS * KEYS_PER_WRITER, "stress_readers");
}

// =============================================================================
// GROW THEN SHRINK
// =============================================================================

#[test]
fn stress_concurrent_drain() {
    common::init_tracing();

    const NUM_THREADS: u64 = 4;
    const TOTAL_KEYS: u64 = 4000;

    let tree = Arc::new(BwTree::new(churny_config()));
    for k in 0..TOTAL_KEYS {
        tree.insert(k, k).unwrap();
    }

    // Each thread drains its own residue class; merges cascade everywhere.
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut k = t;
                while k < TOTAL_KEYS {
                    tree.remove(&k, &k).unwrap();
                    k += NUM_THREADS;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    tree.check_invariants();
    assert_eq!(tree.len(), 0);
    assert_eq!(tree.scan(..).count(), 0);
}

#[test]
fn stress_repeated_grow_shrink_cycles() {
    common::init_tracing();

    const KEYS: u64 = 1500;

    let tree = Arc::new(BwTree::new(churny_config()));

    for round in 0..4u64 {
        let insert_tree = Arc::clone(&tree);
        let inserter = thread::spawn(move || {
            for k in 0..KEYS {
                insert_tree.insert(k, round).unwrap();
            }
        });
        inserter.join().unwrap();

        let handles: Vec<_> = (0..2)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    let mut k = t;
                    while k < KEYS {
                        tree.remove(&k, &round).unwrap();
                        k += 2;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tree.len(), 0, "round {round} left residue");
        tree.check_invariants();
    }
}
