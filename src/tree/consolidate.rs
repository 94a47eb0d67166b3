//! Filepath: src/tree/consolidate.rs
//!
//! Consolidation: flattening a delta chain back into a fresh base node.
//!
//! The collect pass walks the whole chain once and materialises the
//! effective sorted content. Per-key resolution is LIFO: the topmost record
//! wins, which `BTreeMap::entry().or_insert()` encodes directly (first
//! decision sticks). Split deltas narrow the segment's high bound on the
//! way down so migrated keys are excluded; merge deltas push the captured
//! sibling chain as a second segment with its own bound, replacing the
//! source's recursive walk with an explicit stack.
//!
//! Only the *captured* head of a merge is traversed. That is sound because
//! the absorbed node was frozen by its remove delta before capture, so
//! nothing can sit above the captured record.

use std::collections::BTreeMap;

use seize::LocalGuard;

use crate::bound::BoundKey;
use crate::epoch::retire_chain;
use crate::mapping::NodeId;
use crate::node::base::BaseNode;
use crate::node::{NodeClass, NodeRecord, NodeSize, RecordKind};
use crate::ordering::RELAXED;
use crate::tracing_helpers::debug_log;
use crate::tree::BwTree;

// ============================================================================
//  Collect traversals
// ============================================================================

/// Materialise the effective `(key, value)` content of a leaf virtual node.
///
/// The result is sorted, unique-keyed, and restricted to the node's current
/// range.
///
/// # Safety
///
/// `head` must point to a live, non-removed leaf chain protected by the
/// caller's epoch guard.
pub(crate) unsafe fn collect_leaf<K, V>(head: *mut NodeRecord<K, V>) -> Vec<(K, V)>
where
    K: Ord + Clone,
    V: Clone,
{
    // SAFETY: head is live per the caller contract.
    let head_high = unsafe { &*head }.meta.high.clone();

    let mut decided: BTreeMap<K, Option<V>> = BTreeMap::new();
    let mut segments: Vec<(*mut NodeRecord<K, V>, BoundKey<K>)> = vec![(head, head_high)];

    while let Some((mut cursor, mut seg_high)) = segments.pop() {
        loop {
            // SAFETY: every cursor is reached through next/merge links of a
            // protected chain.
            let record = unsafe { &*cursor };

            match &record.kind {
                RecordKind::LeafInsert { key, value } => {
                    if seg_high.admits_high(key) {
                        decided
                            .entry(key.clone())
                            .or_insert_with(|| Some(value.clone()));
                    }
                }

                RecordKind::LeafDelete { key, .. } => {
                    if seg_high.admits_high(key) {
                        decided.entry(key.clone()).or_insert(None);
                    }
                }

                RecordKind::Split { pivot, .. } => {
                    // Keys at or above the pivot migrated to the sibling.
                    if seg_high.admits_high(pivot) {
                        seg_high = BoundKey::Key(pivot.clone());
                    }
                }

                RecordKind::Merge {
                    pivot,
                    sibling_head,
                    ..
                } => {
                    segments.push((*sibling_head, seg_high.clone()));
                    if seg_high.admits_high(pivot) {
                        seg_high = BoundKey::Key(pivot.clone());
                    }
                }

                RecordKind::LeafBase(base) => {
                    for (k, v) in base.entries() {
                        if seg_high.admits_high(k) {
                            decided.entry(k.clone()).or_insert_with(|| Some(v.clone()));
                        }
                    }
                    break;
                }

                RecordKind::Remove { .. } => {
                    unreachable!("collect over a removed node");
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

    decided
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect()
}

/// Materialise the effective separator array of an inner virtual node.
///
/// # Safety
///
/// `head` must point to a live, non-removed inner chain protected by the
/// caller's epoch guard.
pub(crate) unsafe fn collect_inner<K, V>(head: *mut NodeRecord<K, V>) -> Vec<(BoundKey<K>, NodeId)>
where
    K: Ord + Clone,
{
    // SAFETY: head is live per the caller contract.
    let head_high = unsafe { &*head }.meta.high.clone();

    let mut decided: BTreeMap<BoundKey<K>, Option<NodeId>> = BTreeMap::new();
    let mut segments: Vec<(*mut NodeRecord<K, V>, BoundKey<K>)> = vec![(head, head_high)];

    while let Some((mut cursor, mut seg_high)) = segments.pop() {
        loop {
            // SAFETY: as in `collect_leaf`.
            let record = unsafe { &*cursor };

            match &record.kind {
                RecordKind::InnerInsert { sep_key, child, .. } => {
                    if seg_high.admits_high(sep_key) {
                        decided
                            .entry(BoundKey::Key(sep_key.clone()))
                            .or_insert(Some(*child));
                    }
                }

                RecordKind::InnerDelete { sep_key, .. } => {
                    if seg_high.admits_high(sep_key) {
                        decided.entry(BoundKey::Key(sep_key.clone())).or_insert(None);
                    }
                }

                RecordKind::Split { pivot, .. } => {
                    if seg_high.admits_high(pivot) {
                        seg_high = BoundKey::Key(pivot.clone());
                    }
                }

                RecordKind::Merge {
                    pivot,
                    sibling_head,
                    ..
                } => {
                    segments.push((*sibling_head, seg_high.clone()));
                    if seg_high.admits_high(pivot) {
                        seg_high = BoundKey::Key(pivot.clone());
                    }
                }

                RecordKind::InnerBase(base) => {
                    for (q, child) in base.entries() {
                        if *q < seg_high {
                            decided.entry(q.clone()).or_insert(Some(*child));
                        }
                    }
                    break;
                }

                RecordKind::Remove { .. } => {
                    unreachable!("collect over a removed node");
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

    decided
        .into_iter()
        .filter_map(|(q, c)| c.map(|c| (q, c)))
        .collect()
}

// ============================================================================
//  Installation
// ============================================================================

impl<K, V> BwTree<K, V>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    /// Flatten the chain of `id` into a fresh base node and install it with
    /// a single CAS.
    ///
    /// Returns the new head on success. A pending split in the chain is
    /// completed first so its parent post cannot be folded away. Losing the
    /// CAS abandons the attempt silently: the discarded base was never
    /// published, the chain stays as it was.
    pub(crate) fn try_consolidate(
        &self,
        id: NodeId,
        path: &[NodeId],
        guard: &LocalGuard<'_>,
    ) -> Option<*mut NodeRecord<K, V>> {
        let head = self.table.protect(id, guard);
        if head.is_null() {
            return None;
        }

        // SAFETY: head is protected by `guard`.
        let head_ref = unsafe { &*head };

        if matches!(head_ref.kind, RecordKind::Remove { .. }) {
            return None;
        }

        if head_ref.meta.height == 0 {
            // Already a base; hand it back so a caller wanting to split can
            // proceed directly.
            return Some(head);
        }

        // A split folded into a base leaves no trace for helpers; make sure
        // the parent separator landed before erasing the evidence.
        // SAFETY: head is protected by `guard`.
        if let Some((pivot, sibling)) = unsafe { super::traverse::find_split(head) } {
            if self
                .ensure_split_completed(id, &pivot, sibling, path, guard)
                .is_err()
            {
                return None;
            }
        }

        let meta = &head_ref.meta;
        let (size, kind) = match meta.class {
            NodeClass::Leaf => {
                // SAFETY: non-removed leaf chain protected by `guard`.
                let entries = unsafe { collect_leaf(head) };
                (
                    entries.len() as NodeSize,
                    RecordKind::LeafBase(BaseNode::from_sorted(entries)),
                )
            }

            NodeClass::Inner => {
                // SAFETY: non-removed inner chain protected by `guard`.
                let entries = unsafe { collect_inner(head) };
                (
                    entries.len() as NodeSize,
                    RecordKind::InnerBase(BaseNode::from_sorted(entries)),
                )
            }
        };

        debug_assert_eq!(
            size, meta.size,
            "cached size diverged from effective content"
        );

        let new_base = NodeRecord::base(
            meta.class,
            size,
            meta.low.clone(),
            meta.high.clone(),
            kind,
        )
        .into_raw();

        if self.table.cas(id, head, new_base) {
            debug_log!(node = id, size, "consolidated chain");

            // SAFETY: the CAS made the whole old chain unreachable; it is
            // retired exactly once, by the winner.
            unsafe { retire_chain(guard, head) };
            Some(new_base)
        } else {
            // SAFETY: the new base was never published.
            unsafe { drop(NodeRecord::reclaim_unpublished(new_base)) };
            None
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
