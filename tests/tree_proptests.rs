//! Property-based tests for the tree.
//!
//! These tests verify invariants and properties that should hold for all
//! inputs. Uses differential testing against `BTreeMap` as an oracle: the
//! tree is driven with random operation sequences under SMO-hostile
//! thresholds (tiny split/merge/consolidate limits) so that chains, splits,
//! and merges churn constantly, and every observable result is compared.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

use std::collections::BTreeMap;

use bwtree::{BwTree, BwTreeConfig, InsertError, RemoveError};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

// ============================================================================
//  Strategies
// ============================================================================

/// Keys from a small domain so operations collide often.
fn small_key() -> impl Strategy<Value = u64> {
    0u64..128
}

/// Operations for random testing.
#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u64),
    Remove(u64),
    RemoveWrongValue(u64),
    Lookup(u64),
    Scan(u64, u64),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            4 => (small_key(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
            2 => small_key().prop_map(Op::Remove),
            1 => small_key().prop_map(Op::RemoveWrongValue),
            2 => small_key().prop_map(Op::Lookup),
            1 => (small_key(), small_key()).prop_map(|(a, b)| Op::Scan(a.min(b), a.max(b))),
        ],
        0..=max_ops,
    )
}

fn hostile_tree() -> BwTree<u64, u64> {
    BwTree::new(BwTreeConfig {
        split_threshold: 4,
        merge_threshold: 2,
        consolidate_threshold: 2,
        mapping_table_slots: 1 << 16,
    })
}

/// Drive the tree and the oracle with the same operations, comparing every
/// observable outcome.
fn run_differential(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let tree = hostile_tree();
    let mut oracle: BTreeMap<u64, u64> = BTreeMap::new();

    for op in ops {
        match op {
            Op::Insert(k, v) => {
                if oracle.contains_key(&k) {
                    prop_assert_eq!(tree.insert(k, v), Err(InsertError::KeyExists));
                } else {
                    prop_assert_eq!(tree.insert(k, v), Ok(()));
                    oracle.insert(k, v);
                }
            }

            Op::Remove(k) => match oracle.get(&k).copied() {
                Some(v) => {
                    prop_assert_eq!(tree.remove(&k, &v), Ok(()));
                    oracle.remove(&k);
                }

                None => {
                    prop_assert_eq!(tree.remove(&k, &0), Err(RemoveError::KeyNotFound));
                }
            },

            Op::RemoveWrongValue(k) => {
                if let Some(v) = oracle.get(&k).copied() {
                    let wrong = v.wrapping_add(1);
                    prop_assert_eq!(tree.remove(&k, &wrong), Err(RemoveError::ValueMismatch));
                    // Nothing may have changed.
                    prop_assert_eq!(tree.lookup(&k), Some(v));
                }
            }

            Op::Lookup(k) => {
                prop_assert_eq!(tree.lookup(&k), oracle.get(&k).copied());
            }

            Op::Scan(lo, hi) => {
                let got: Vec<_> = tree.scan(lo..hi).collect();
                let want: Vec<_> = oracle.range(lo..hi).map(|(k, v)| (*k, *v)).collect();
                prop_assert_eq!(got, want);
            }
        }
    }

    // Final full sweep and structural audit.
    let got: Vec<_> = tree.scan(..).collect();
    let want: Vec<_> = oracle.iter().map(|(k, v)| (*k, *v)).collect();
    prop_assert_eq!(got, want);
    prop_assert_eq!(tree.len(), oracle.len());
    tree.check_invariants();

    Ok(())
}

// ============================================================================
//  Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// The tree agrees with a BTreeMap on every observable outcome.
    #[test]
    fn differential_against_btreemap(ops in operations(300)) {
        run_differential(ops)?;
    }

    /// Every inserted key is retrievable.
    #[test]
    fn insert_then_lookup_returns_value(key in any::<u64>(), value: u64) {
        let tree = hostile_tree();
        tree.insert(key, value).unwrap();

        prop_assert_eq!(tree.lookup(&key), Some(value));
    }

    /// Insert then matching delete leaves the key absent.
    #[test]
    fn insert_delete_lookup_is_absent(key in any::<u64>(), value: u64) {
        let tree = hostile_tree();
        tree.insert(key, value).unwrap();
        tree.remove(&key, &value).unwrap();

        prop_assert_eq!(tree.lookup(&key), None);
        prop_assert_eq!(tree.len(), 0);
    }

    /// A failed insert changes nothing observable.
    #[test]
    fn failed_insert_is_a_noop(keys in prop::collection::btree_set(small_key(), 1..32)) {
        let tree = hostile_tree();
        for &k in &keys {
            tree.insert(k, k).unwrap();
        }

        for &k in &keys {
            prop_assert_eq!(tree.insert(k, k + 1), Err(InsertError::KeyExists));
        }

        let content: Vec<_> = tree.scan(..).collect();
        let want: Vec<_> = keys.iter().map(|&k| (k, k)).collect();
        prop_assert_eq!(content, want);
    }

    /// Scans emit strictly ascending keys whatever the window.
    #[test]
    fn scan_is_strictly_ascending(
        keys in prop::collection::btree_set(any::<u64>(), 0..256),
        lo in any::<u64>(),
        hi in any::<u64>(),
    ) {
        let tree = hostile_tree();
        for &k in &keys {
            tree.insert(k, k).unwrap();
        }

        let window: Vec<_> = tree.scan(lo.min(hi)..lo.max(hi)).map(|(k, _)| k).collect();
        prop_assert!(window.windows(2).all(|w| w[0] < w[1]));
    }

    /// Growing then draining in random order always ends empty and valid.
    #[test]
    fn grow_then_drain(mut keys in prop::collection::vec(small_key(), 1..128)) {
        let tree = hostile_tree();

        keys.sort_unstable();
        keys.dedup();

        for &k in &keys {
            tree.insert(k, k).unwrap();
        }
        keys.reverse();
        for &k in &keys {
            tree.remove(&k, &k).unwrap();
        }

        prop_assert_eq!(tree.scan(..).count(), 0);
        prop_assert_eq!(tree.len(), 0);
        tree.check_invariants();
    }
}
