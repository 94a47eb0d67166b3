//! Filepath: src/tree/traverse.rs
//!
//! Delta-chain traversal: the per-record state machines that resolve a
//! logical question (membership, routing) against one virtual node.
//!
//! The source of truth is the chain head; each step dispatches on the
//! record variant and either answers, redirects, or follows `next`. Merge
//! records branch into the captured sibling chain, which is a plain tail
//! continuation here (only the consolidation collect needs a real stack).

use crate::bound::BoundKey;
use crate::mapping::NodeId;
use crate::node::{NodeRecord, RecordKind};
use crate::ordering::RELAXED;

// ============================================================================
//  Outcomes
// ============================================================================

/// Result of a point lookup over one leaf chain.
pub(crate) enum LeafSearch<V> {
    /// The key is present with this value.
    Present(V),

    /// The key is not in this node.
    Absent,

    /// The key logically lives in the split sibling; re-enter there.
    MovedRight(NodeId),

    /// The node is being absorbed by its left sibling; the caller helps the
    /// merge forward and restarts.
    Removed,
}

/// Result of routing a key through one inner chain.
pub(crate) enum InnerRoute {
    /// Descend into this child.
    Child(NodeId),

    /// The key belongs to the split sibling; re-enter there.
    MovedRight(NodeId),

    /// The node is being absorbed; help and restart.
    Removed,
}

/// Descent target: either a concrete key or the leftmost path.
///
/// Range scans with an unbounded start descend to the first leaf, which is
/// the same walk with a key smaller than every finite key.
pub(crate) enum Target<'a, K> {
    Min,
    Key(&'a K),
}

impl<K> Clone for Target<'_, K> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Target<'_, K> {}

impl<K: Ord> Target<'_, K> {
    /// Is the target inside `[low, high)`?
    #[inline]
    fn within(&self, low: &BoundKey<K>, high: &BoundKey<K>) -> bool {
        match self {
            Self::Min => matches!(low, BoundKey::NegInf),

            Self::Key(k) => low.admits_low(k) && high.admits_high(k),
        }
    }

    /// Is the target at or above this finite key?
    #[inline]
    fn at_or_above(&self, key: &K) -> bool {
        match self {
            Self::Min => false,

            Self::Key(k) => **k >= *key,
        }
    }
}

// ============================================================================
//  Leaf point lookup
// ============================================================================

/// Decide membership of `key` in the virtual node headed by `head`.
///
/// # Safety
///
/// `head` must point to a live chain protected by the caller's epoch guard.
pub(crate) unsafe fn search_leaf_chain<K, V>(head: *mut NodeRecord<K, V>, key: &K) -> LeafSearch<V>
where
    K: Ord,
    V: Clone,
{
    let mut cursor = head;

    loop {
        // SAFETY: cursor is head or reached via next/merge links of a
        // protected chain; the guard keeps every record alive.
        let record = unsafe { &*cursor };

        match &record.kind {
            RecordKind::LeafInsert { key: k, value } => {
                if k == key {
                    return LeafSearch::Present(value.clone());
                }
            }

            RecordKind::LeafDelete { key: k, .. } => {
                if k == key {
                    return LeafSearch::Absent;
                }
            }

            RecordKind::Split { pivot, sibling } => {
                if *key >= *pivot {
                    return LeafSearch::MovedRight(*sibling);
                }
            }

            RecordKind::Merge {
                pivot,
                sibling_head,
                ..
            } => {
                if *key >= *pivot {
                    cursor = *sibling_head;
                    continue;
                }
            }

            RecordKind::Remove { .. } => {
                return LeafSearch::Removed;
            }

            RecordKind::LeafBase(base) => {
                return match base.point_search(key) {
                    Some(index) => LeafSearch::Present(base.entry_at(index).clone()),

                    None => LeafSearch::Absent,
                };
            }

            RecordKind::InnerBase(_)
            | RecordKind::InnerInsert { .. }
            | RecordKind::InnerDelete { .. } => {
                unreachable!("inner record in a leaf chain");
            }
        }

        cursor = record.next.load(RELAXED);
    }
}

// ============================================================================
//  Inner navigation
// ============================================================================

/// Resolve `target` to a child ID through the inner chain headed by `head`.
///
/// Lower-bound tie-break throughout: the child reached is the one whose
/// separator is the largest not exceeding the target.
///
/// # Safety
///
/// `head` must point to a live chain protected by the caller's epoch guard.
pub(crate) unsafe fn route_inner_chain<K, V>(
    head: *mut NodeRecord<K, V>,
    target: Target<'_, K>,
) -> InnerRoute
where
    K: Ord,
{
    let mut cursor = head;

    loop {
        // SAFETY: as in `search_leaf_chain`.
        let record = unsafe { &*cursor };

        match &record.kind {
            RecordKind::InnerInsert {
                sep_key,
                child,
                next_key,
                ..
            } => {
                // The new separator covers [sep_key, next_key).
                if let Target::Key(k) = target {
                    if *k >= *sep_key && next_key.admits_high(k) {
                        return InnerRoute::Child(*child);
                    }
                }
            }

            RecordKind::InnerDelete {
                prev_key,
                prev_child,
                next_key,
                ..
            } => {
                // With the separator gone, [prev_key, next_key) routes left.
                if target.within(prev_key, next_key) {
                    return InnerRoute::Child(*prev_child);
                }
            }

            RecordKind::Split { pivot, sibling } => {
                if target.at_or_above(pivot) {
                    return InnerRoute::MovedRight(*sibling);
                }
            }

            RecordKind::Merge {
                pivot,
                sibling_head,
                ..
            } => {
                if target.at_or_above(pivot) {
                    cursor = *sibling_head;
                    continue;
                }
            }

            RecordKind::Remove { .. } => {
                return InnerRoute::Removed;
            }

            RecordKind::InnerBase(base) => {
                let index = match target {
                    Target::Min => 0,

                    Target::Key(k) => base.route(k),
                };

                return InnerRoute::Child(*base.entry_at(index));
            }

            RecordKind::LeafBase(_)
            | RecordKind::LeafInsert { .. }
            | RecordKind::LeafDelete { .. } => {
                unreachable!("leaf record in an inner chain");
            }
        }

        cursor = record.next.load(RELAXED);
    }
}

// ============================================================================
//  Chain inspection helpers
// ============================================================================

/// Find the pending split in a chain, if any: the topmost split record.
///
/// Used by the SMO coordinator to complete a parent post before the split
/// record is folded away by consolidation. Merge branches are not entered:
/// a captured chain's split was completed before its node was frozen.
///
/// # Safety
///
/// `head` must point to a live chain protected by the caller's epoch guard.
pub(crate) unsafe fn find_split<K: Clone, V>(head: *mut NodeRecord<K, V>) -> Option<(K, NodeId)> {
    let mut cursor = head;

    while !cursor.is_null() {
        // SAFETY: as in `search_leaf_chain`.
        let record = unsafe { &*cursor };

        match &record.kind {
            RecordKind::Split { pivot, sibling } => {
                return Some((pivot.clone(), *sibling));
            }

            RecordKind::Remove { .. } | RecordKind::LeafBase(_) | RecordKind::InnerBase(_) => {
                return None;
            }

            _ => cursor = record.next.load(RELAXED),
        }
    }

    None
}

// ============================================================================
//  Descent engine
// ============================================================================

use seize::LocalGuard;

use crate::node::NodeClass;
use crate::tree::{BwTree, Restart};

/// Where a descent ended up: the leaf whose range covers the target, its
/// protected head, and the inner ancestors walked through (youngest last).
pub(crate) struct Descent<K, V> {
    pub leaf_id: NodeId,
    pub leaf_head: *mut NodeRecord<K, V>,
    pub path: Vec<NodeId>,
}

impl<K, V> BwTree<K, V>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    /// Load the chain head of `id`, helping any in-progress SMO forward
    /// first and consolidating over-tall chains.
    ///
    /// `Err(Restart)` means the caller's view of the tree is stale (the
    /// node is frozen, or a parent post needs a fresher path) and the whole
    /// descent must begin again.
    pub(crate) fn load_node(
        &self,
        id: NodeId,
        path: &[NodeId],
        guard: &LocalGuard<'_>,
    ) -> Result<*mut NodeRecord<K, V>, Restart> {
        let head = self.table.protect(id, guard);
        if head.is_null() {
            return Err(Restart);
        }

        // SAFETY: head is protected by `guard`.
        let head_ref = unsafe { &*head };

        match &head_ref.kind {
            RecordKind::Remove { .. } => {
                let _ = self.help_removed(id, head, path, guard);
                return Err(Restart);
            }

            RecordKind::Split { pivot, sibling } => {
                self.ensure_split_completed(id, pivot, *sibling, path, guard)?;
            }

            RecordKind::Merge { pivot, sibling, .. } => {
                self.ensure_absorb_completed(pivot, *sibling, path, guard)?;
            }

            _ => {}
        }

        if head_ref.meta.height as usize > self.config.consolidate_threshold {
            if let Some(new_head) = self.try_consolidate(id, path, guard) {
                return Ok(new_head);
            }
        }

        Ok(head)
    }

    /// Walk from the root to the leaf whose range covers `target`.
    ///
    /// The returned head is a snapshot: its cached range contained the
    /// target at load time, so a subsequent chain search cannot redirect.
    pub(crate) fn descend_to_leaf(
        &self,
        target: Target<'_, K>,
        guard: &LocalGuard<'_>,
    ) -> Descent<K, V> {
        'restart: loop {
            let mut path: Vec<NodeId> = Vec::new();
            let mut id = self.root_id();

            loop {
                let Ok(head) = self.load_node(id, &path, guard) else {
                    continue 'restart;
                };

                // SAFETY: head is protected by `guard`.
                let head_ref = unsafe { &*head };

                if let Target::Key(k) = target {
                    if !head_ref.meta.low.admits_low(k) {
                        // Routed left of the target: stale path.
                        continue 'restart;
                    }

                    if !head_ref.meta.high.admits_high(k) {
                        // The target migrated right through a split the
                        // parent did not reflect when we routed.
                        // SAFETY: head is protected by `guard`.
                        match unsafe { find_split(head) } {
                            Some((pivot, sibling)) if *k >= pivot => {
                                id = sibling;
                                continue;
                            }

                            _ => continue 'restart,
                        }
                    }
                }

                match head_ref.meta.class {
                    NodeClass::Leaf => {
                        return Descent {
                            leaf_id: id,
                            leaf_head: head,
                            path,
                        };
                    }

                    NodeClass::Inner => {
                        // SAFETY: head is protected by `guard`.
                        match unsafe { route_inner_chain(head, target) } {
                            InnerRoute::Child(child) => {
                                path.push(id);
                                id = child;
                            }

                            InnerRoute::MovedRight(sibling) => {
                                id = sibling;
                            }

                            InnerRoute::Removed => continue 'restart,
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
