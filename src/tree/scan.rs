//! Range scans: lazy, ordered, leaf-at-a-time.
//!
//! A scan materialises one leaf per step with the consolidation collect
//! (without installing anything), emits the in-range entries, then
//! re-descends for the leaf's high bound to reach the right neighbour.
//!
//! Consistency: each leaf is a snapshot taken at its load; there is no
//! total order across leaves. The cursor filter (`key >= previous high`)
//! means a key is never emitted twice, even when a merge moves content
//! left between leaf reads; a key migrating rightward across the cursor
//! through a concurrent split may be skipped.

use std::ops::{Bound, RangeBounds};

use seize::LocalGuard;

use crate::bound::BoundKey;
use crate::tree::BwTree;

use super::consolidate::collect_leaf;
use super::traverse::Target;

// ============================================================================
//  Scan
// ============================================================================

/// Lazy ascending iterator over a key range. Created by [`BwTree::scan`].
///
/// Holds an epoch guard for its whole lifetime, so leaf snapshots stay
/// cheap; drop the scan promptly on long-lived threads to let reclamation
/// advance.
pub struct Scan<'t, K, V> {
    tree: &'t BwTree<K, V>,
    guard: LocalGuard<'t>,
    items: std::vec::IntoIter<(K, V)>,
    /// Low bound of the next leaf to fetch; `None` when exhausted.
    cursor: Option<BoundKey<K>>,
    lo: Bound<K>,
    hi: Bound<K>,
}

fn clone_bound<K: Clone>(bound: Bound<&K>) -> Bound<K> {
    match bound {
        Bound::Included(k) => Bound::Included(k.clone()),

        Bound::Excluded(k) => Bound::Excluded(k.clone()),

        Bound::Unbounded => Bound::Unbounded,
    }
}

fn above_lo<K: Ord>(lo: &Bound<K>, key: &K) -> bool {
    match lo {
        Bound::Included(b) => *key >= *b,

        Bound::Excluded(b) => *key > *b,

        Bound::Unbounded => true,
    }
}

fn below_hi<K: Ord>(hi: &Bound<K>, key: &K) -> bool {
    match hi {
        Bound::Included(b) => *key <= *b,

        Bound::Excluded(b) => *key < *b,

        Bound::Unbounded => true,
    }
}

/// Could a leaf starting at `next_low` still contain an emittable key?
fn reachable<K: Ord>(hi: &Bound<K>, next_low: &K) -> bool {
    match hi {
        Bound::Included(b) => *next_low <= *b,

        Bound::Excluded(b) => *next_low < *b,

        Bound::Unbounded => true,
    }
}

impl<K, V> BwTree<K, V>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    /// Scan a key range in ascending order.
    ///
    /// The sequence is lazy and finite. See the module docs for the exact
    /// consistency contract under concurrent updates.
    ///
    /// ```
    /// use bwtree::{BwTree, BwTreeConfig};
    ///
    /// let tree = BwTree::new(BwTreeConfig::default());
    /// for (k, v) in [(5u64, 'a'), (3, 'b'), (7, 'c')] {
    ///     tree.insert(k, v).unwrap();
    /// }
    ///
    /// let hits: Vec<_> = tree.scan(3..7).collect();
    /// assert_eq!(hits, vec![(3, 'b'), (5, 'a')]);
    /// ```
    pub fn scan<R: RangeBounds<K>>(&self, range: R) -> Scan<'_, K, V> {
        let lo = clone_bound(range.start_bound());
        let hi = clone_bound(range.end_bound());

        let cursor = Some(match &lo {
            Bound::Included(k) | Bound::Excluded(k) => BoundKey::Key(k.clone()),

            Bound::Unbounded => BoundKey::NegInf,
        });

        Scan {
            tree: self,
            guard: self.epoch.enter(),
            items: Vec::new().into_iter(),
            cursor,
            lo,
            hi,
        }
    }
}

impl<K, V> Iterator for Scan<'_, K, V>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if let Some((key, value)) = self.items.next() {
                if !below_hi(&self.hi, &key) {
                    // Sorted output: nothing later can qualify either.
                    self.cursor = None;
                    self.items = Vec::new().into_iter();
                    return None;
                }

                if !above_lo(&self.lo, &key) {
                    // Only reachable on the first leaf of an excluded start.
                    continue;
                }

                return Some((key, value));
            }

            let target = self.cursor.take()?;
            let descend_target = match &target {
                BoundKey::NegInf => Target::Min,

                BoundKey::Key(k) => Target::Key(k),

                BoundKey::PosInf => return None,
            };

            let descent = self.tree.descend_to_leaf(descend_target, &self.guard);

            // SAFETY: the leaf head is protected by the scan's guard.
            let high = unsafe { &*descent.leaf_head }.meta.high.clone();
            // SAFETY: as above; the descent never returns a removed node.
            let entries = unsafe { collect_leaf(descent.leaf_head) };

            // The cursor filter keeps keys that slid left through a merge
            // from being emitted a second time.
            let fresh: Vec<(K, V)> = entries
                .into_iter()
                .filter(|(k, _)| target.admits_low(k))
                .collect();
            self.items = fresh.into_iter();

            self.cursor = match high {
                BoundKey::PosInf => None,

                BoundKey::Key(h) => reachable(&self.hi, &h).then_some(BoundKey::Key(h)),

                BoundKey::NegInf => unreachable!("high bound is never -inf"),
            };
        }
    }
}

impl<K, V> std::iter::FusedIterator for Scan<'_, K, V>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::{BwTree, BwTreeConfig};

    fn populated(keys: impl IntoIterator<Item = u64>) -> BwTree<u64, u64> {
        let tree = BwTree::new(BwTreeConfig {
            split_threshold: 4,
            merge_threshold: 2,
            consolidate_threshold: 3,
            mapping_table_slots: 1 << 16,
        });

        for k in keys {
            tree.insert(k, k * 10).unwrap();
        }
        tree
    }

    #[test]
    fn test_scan_empty_tree() {
        let tree = populated([]);

        assert_eq!(tree.scan(..).count(), 0);
    }

    #[test]
    fn test_scan_half_open_window() {
        let tree = populated([5, 3, 7, 1, 9]);

        let hits: Vec<_> = tree.scan(2..8).collect();
        assert_eq!(hits, vec![(3, 30), (5, 50), (7, 70)]);
    }

    #[test]
    fn test_scan_unbounded_both_sides() {
        let tree = populated(0..64);

        let hits: Vec<_> = tree.scan(..).collect();
        assert_eq!(hits.len(), 64);
        assert!(hits.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_scan_excluded_start_included_end() {
        let tree = populated([1, 2, 3, 4, 5]);

        use std::ops::Bound;
        let hits: Vec<_> = tree
            .scan((Bound::Excluded(2), Bound::Included(4)))
            .map(|(k, _)| k)
            .collect();
        assert_eq!(hits, vec![3, 4]);
    }

    #[test]
    fn test_scan_crosses_leaf_boundaries() {
        // Enough keys to force several splits at threshold 4.
        let tree = populated(0..100);

        let hits: Vec<_> = tree.scan(10..90).map(|(k, _)| k).collect();
        assert_eq!(hits, (10..90).collect::<Vec<_>>());
    }

    #[test]
    fn test_scan_range_beyond_content() {
        let tree = populated([1, 2, 3]);

        assert_eq!(tree.scan(10..20).count(), 0);
    }
}
