//! Immutable sorted entry storage for base nodes.
//!
//! A base node's payload is a single contiguous allocation of sorted,
//! unique-key entries. Leaf bases store `(K, V)` pairs; inner bases store
//! `(BoundKey<K>, NodeId)` separators, where the first separator's key
//! equals the node's low bound. Entries are only reachable through the
//! accessors here; no raw pointer into the storage ever escapes.

use std::cmp::Ordering;

use crate::bound::BoundKey;
use crate::mapping::NodeId;

// ============================================================================
//  BaseNode
// ============================================================================

/// Sorted immutable entry array backing one base node.
///
/// # Type Parameters
///
/// * `Q` - The stored key type: `K` for leaves, `BoundKey<K>` for inner nodes
/// * `E` - The stored entry type: a value for leaves, a child [`NodeId`] for
///   inner nodes
///
/// # Invariants
///
/// - Keys are strictly ascending (unique).
/// - The array is immutable after construction; splits copy, never mutate.
pub(crate) struct BaseNode<Q, E> {
    entries: Box<[(Q, E)]>,
}

impl<Q: Ord, E> BaseNode<Q, E> {
    /// Build a base from entries already sorted by strictly ascending key.
    pub(crate) fn from_sorted(entries: Vec<(Q, E)>) -> Self {
        debug_assert!(
            entries.windows(2).all(|w| w[0].0 < w[1].0),
            "base node entries must be strictly sorted"
        );

        Self {
            entries: entries.into_boxed_slice(),
        }
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Key at `index`.
    #[inline]
    pub(crate) fn key_at(&self, index: usize) -> &Q {
        &self.entries[index].0
    }

    /// Entry payload at `index`.
    #[inline]
    pub(crate) fn entry_at(&self, index: usize) -> &E {
        &self.entries[index].1
    }

    /// All entries, in key order.
    #[inline]
    pub(crate) fn entries(&self) -> &[(Q, E)] {
        &self.entries
    }

    /// Exact-match search. Returns the index of `key` if present.
    pub(crate) fn point_search(&self, key: &Q) -> Option<usize> {
        self.entries.binary_search_by(|(q, _)| q.cmp(key)).ok()
    }

    /// Split off the upper half.
    ///
    /// The pivot is the middle entry's key; the returned half contains every
    /// entry from the pivot upward (its low bound). `self` is left
    /// untouched: the lower half stays in place and the caller narrows the
    /// original node's high bound with a split delta.
    ///
    /// Requires at least two entries, so the pivot is always strictly above
    /// the first key.
    pub(crate) fn split(&self) -> (Q, Self)
    where
        Q: Clone,
        E: Clone,
    {
        assert!(self.entries.len() > 1, "cannot split a base with < 2 entries");

        let pivot_index = self.entries.len() / 2;
        let pivot = self.entries[pivot_index].0.clone();
        let upper = self.entries[pivot_index..].to_vec();

        (pivot, Self::from_sorted(upper))
    }
}

impl<K: Ord, E> BaseNode<BoundKey<K>, E> {
    /// Route a finite key through an inner separator array.
    ///
    /// Returns the index of the entry with the largest separator `<= key`
    /// (lower-bound tie-break). The first separator equals the node's low
    /// bound, so any in-range key matches at least slot 0.
    pub(crate) fn route(&self, key: &K) -> usize {
        let ub = self
            .entries
            .partition_point(|(q, _)| q.cmp_key(key) != Ordering::Greater);

        debug_assert!(ub > 0, "routing key below the node's low bound");
        ub - 1
    }
}

/// Leaf entry array.
pub(crate) type LeafEntries<K, V> = BaseNode<K, V>;

/// Inner separator array.
pub(crate) type InnerEntries<K> = BaseNode<BoundKey<K>, NodeId>;

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::INVALID_NODE_ID;

    fn leaf(entries: &[(u64, u64)]) -> BaseNode<u64, u64> {
        BaseNode::from_sorted(entries.to_vec())
    }

    #[test]
    fn test_point_search_hits_and_misses() {
        let base = leaf(&[(1, 10), (3, 30), (5, 50)]);

        assert_eq!(base.point_search(&3), Some(1));
        assert_eq!(base.point_search(&5), Some(2));
        assert_eq!(base.point_search(&4), None);
        assert_eq!(base.point_search(&0), None);
    }

    #[test]
    fn test_split_copies_upper_half() {
        let base = leaf(&[(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]);
        let (pivot, upper) = base.split();

        assert_eq!(pivot, 3);
        assert_eq!(upper.entries(), &[(3, 30), (4, 40), (5, 50)]);
        // Original untouched
        assert_eq!(base.len(), 5);
    }

    #[test]
    fn test_split_pivot_above_first_key() {
        // The pivot must never equal the node's first key, even at size 2.
        let base = leaf(&[(7, 0), (9, 0)]);
        let (pivot, upper) = base.split();

        assert_eq!(pivot, 9);
        assert_eq!(upper.len(), 1);
        assert!(pivot > *base.key_at(0));
    }

    #[test]
    fn test_route_lower_bound_semantics() {
        let inner: InnerEntries<u64> = BaseNode::from_sorted(vec![
            (BoundKey::NegInf, 1),
            (BoundKey::Key(10), 2),
            (BoundKey::Key(20), 3),
        ]);

        assert_eq!(*inner.entry_at(inner.route(&0)), 1);
        assert_eq!(*inner.entry_at(inner.route(&9)), 1);
        assert_eq!(*inner.entry_at(inner.route(&10)), 2);
        assert_eq!(*inner.entry_at(inner.route(&19)), 2);
        assert_eq!(*inner.entry_at(inner.route(&1000)), 3);
        assert_ne!(*inner.entry_at(inner.route(&1000)), INVALID_NODE_ID);
    }
}
