//! Filepath: src/tree/smo.rs
//!
//! Structure-modification operations: split, merge, remove, and helping.
//!
//! Every SMO is a sequence of single-slot CAS steps. A thread that posts
//! step N may stall before step N+1; the protocol stays live because any
//! traversal that observes the partial state performs the outstanding step
//! itself before retrying its own operation (obstruction freedom — there
//! are no other liveness mechanisms).
//!
//! Split: (1) build the upper-half base and allocate its ID, (2) CAS a
//! split delta narrowing the original, (3) post the separator into the
//! parent (or grow a new root).
//!
//! Merge: (1) CAS a remove delta freezing the victim, (2) CAS a merge delta
//! capturing the frozen chain onto the left sibling, (3) post a separator
//! delete into the parent (and collapse the root when it thins out).
//!
//! Helpers decide how far a merge has progressed from bounds alone: the
//! left sibling's high bound equals the victim's low bound until step 2
//! lands and lies beyond it afterwards, a test that survives consolidation
//! of the sibling in between.
//!
//! Merges can abort. A parent split can strand a frozen victim as the
//! leftmost child of the new right half, where no left sibling exists to
//! absorb it; the remove record's claim flag lets a helper unfreeze such a
//! node instead of looping forever.

use std::sync::atomic::AtomicU8;

use seize::LocalGuard;

use crate::bound::BoundKey;
use crate::epoch::retire_record;
use crate::mapping::{INVALID_NODE_ID, NodeId};
use crate::node::{NodeRecord, NodeSize, RecordKind, merge_state};
use crate::node::base::BaseNode;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED, WRITE_ORD};
use crate::tracing_helpers::{debug_log, trace_log, warn_log};
use crate::tree::{BwTree, Restart};

use super::consolidate::collect_inner;

/// Find the index of the separator covering `key` in a sorted view:
/// the largest separator `<= key`. Returns the count of separators at or
/// below `key`; the covering index is one less.
fn cover_position<K: Ord>(view: &[(BoundKey<K>, NodeId)], key: &K) -> usize {
    view.partition_point(|(q, _)| q.cmp_key(key) != std::cmp::Ordering::Greater)
}

impl<K, V> BwTree<K, V>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    // ========================================================================
    //  Threshold dispatch
    // ========================================================================

    /// Re-examine a node after a successful delta install and run whatever
    /// SMO its new state calls for. `head` is the record just installed;
    /// `path` holds the ancestor IDs, youngest last.
    pub(crate) fn maybe_adjust(
        &self,
        id: NodeId,
        head: *mut NodeRecord<K, V>,
        path: &[NodeId],
        guard: &LocalGuard<'_>,
    ) {
        // SAFETY: head was just published under `guard`.
        let meta = unsafe { &(*head).meta };
        let size = meta.size as usize;

        if size > self.config.split_threshold {
            // Splitting needs a base at the head; consolidate on demand.
            let base = if meta.height == 0 {
                Some(head)
            } else {
                self.try_consolidate(id, path, guard)
            };

            if let Some(base_ptr) = base {
                self.try_split(id, base_ptr, path, guard);
            }
        } else if size < self.config.merge_threshold {
            self.try_merge(id, head, path, guard);
        }
    }

    // ========================================================================
    //  Split
    // ========================================================================

    /// Run the split protocol on a node whose chain head is a base record.
    ///
    /// Step failures are cheap: losing the split-delta CAS just unpublishes
    /// the would-be sibling (its ID never became reachable) and gives up;
    /// the size check will fire again on the next update.
    pub(crate) fn try_split(
        &self,
        id: NodeId,
        base_ptr: *mut NodeRecord<K, V>,
        path: &[NodeId],
        guard: &LocalGuard<'_>,
    ) {
        // SAFETY: base_ptr is protected by `guard`.
        let base_ref = unsafe { &*base_ptr };

        if base_ref.meta.height != 0 || base_ref.meta.size as usize <= self.config.split_threshold {
            return;
        }

        // Step 1: copy out the upper half and install it under a fresh ID.
        let (pivot, upper_size, upper_kind) = match &base_ref.kind {
            RecordKind::LeafBase(base) => {
                if base.len() < 2 {
                    return;
                }
                let (pivot, upper) = base.split();
                (
                    pivot,
                    upper.len() as NodeSize,
                    RecordKind::LeafBase(upper),
                )
            }

            RecordKind::InnerBase(base) => {
                if base.len() < 2 {
                    return;
                }
                let (pivot, upper) = base.split();
                let BoundKey::Key(pivot) = pivot else {
                    unreachable!("split pivot sits above the first separator")
                };
                (
                    pivot,
                    upper.len() as NodeSize,
                    RecordKind::InnerBase(upper),
                )
            }

            _ => return,
        };

        let sibling_rec = NodeRecord::base(
            base_ref.meta.class,
            upper_size,
            BoundKey::Key(pivot.clone()),
            base_ref.meta.high.clone(),
            upper_kind,
        );
        let sibling = self.allocate_or_abort(sibling_rec);

        // Step 2: narrow this node with a split delta.
        let delta = NodeRecord::delta(
            base_ref,
            base_ptr,
            base_ref.meta.size - upper_size,
            base_ref.meta.low.clone(),
            BoundKey::Key(pivot.clone()),
            RecordKind::Split {
                pivot: pivot.clone(),
                sibling,
            },
        )
        .into_raw();

        if !self.table.cas(id, base_ptr, delta) {
            // Lost the race. Nobody has seen the sibling's ID, so both
            // records can be reclaimed directly; the ID itself leaks (slots
            // are never recycled).
            let sibling_head = self.table.protect(sibling, guard);
            self.table.store(sibling, std::ptr::null_mut());

            // SAFETY: neither record was ever reachable by another thread.
            unsafe {
                drop(NodeRecord::reclaim_unpublished(delta));
                drop(NodeRecord::reclaim_unpublished(sibling_head));
            }
            return;
        }

        debug_log!(node = id, sibling, "posted split delta");

        // Step 3: make the sibling reachable from the parent.
        let _ = self.ensure_split_completed(id, &pivot, sibling, path, guard);
    }

    /// Make sure the parent of `id` carries the separator installed by a
    /// split at `pivot`. Safe to call repeatedly and from any thread; this
    /// is the help path for step 3.
    pub(crate) fn ensure_split_completed(
        &self,
        id: NodeId,
        pivot: &K,
        sibling: NodeId,
        path: &[NodeId],
        guard: &LocalGuard<'_>,
    ) -> Result<(), Restart> {
        match path.split_last() {
            None => self.split_root(id, pivot, sibling, guard),

            Some((&parent_id, ancestors)) => {
                self.post_separator_insert(parent_id, ancestors, id, pivot, sibling, guard)
            }
        }
    }

    /// Grow a new root above a root that split.
    fn split_root(
        &self,
        old_root: NodeId,
        pivot: &K,
        sibling: NodeId,
        guard: &LocalGuard<'_>,
    ) -> Result<(), Restart> {
        if self.root_id() != old_root {
            // Someone else already grew the root (or the path was stale).
            return Err(Restart);
        }

        let entries = vec![
            (BoundKey::NegInf, old_root),
            (BoundKey::Key(pivot.clone()), sibling),
        ];
        let new_root = NodeRecord::base(
            crate::node::NodeClass::Inner,
            2,
            BoundKey::NegInf,
            BoundKey::PosInf,
            RecordKind::InnerBase(BaseNode::from_sorted(entries)),
        );
        let new_root_id = self.allocate_or_abort(new_root);

        if self
            .root
            .compare_exchange(old_root, new_root_id, CAS_SUCCESS, CAS_FAILURE)
            .is_err()
        {
            // Lost the root race; unpublish our candidate.
            let head = self.table.protect(new_root_id, guard);
            self.table.store(new_root_id, std::ptr::null_mut());

            // SAFETY: the candidate root was never reachable.
            unsafe { drop(NodeRecord::reclaim_unpublished(head)) };
            return Err(Restart);
        }

        debug_log!(old_root, new_root = new_root_id, "grew new root");
        Ok(())
    }

    /// Post the separator `pivot -> sibling` into `parent_id` unless it is
    /// already there.
    fn post_separator_insert(
        &self,
        parent_id: NodeId,
        ancestors: &[NodeId],
        child: NodeId,
        pivot: &K,
        sibling: NodeId,
        guard: &LocalGuard<'_>,
    ) -> Result<(), Restart> {
        loop {
            let parent_head = self.table.protect(parent_id, guard);
            if parent_head.is_null() {
                return Err(Restart);
            }

            // SAFETY: parent_head is protected by `guard`.
            let parent_ref = unsafe { &*parent_head };

            if matches!(parent_ref.kind, RecordKind::Remove { .. }) {
                return Err(Restart);
            }

            if !parent_ref.meta.contains(pivot) {
                // The parent no longer covers the pivot; a fresher path is
                // needed (its own split moved the range).
                return Err(Restart);
            }

            // SAFETY: non-removed inner chain protected by `guard`.
            let view = unsafe { collect_inner(parent_head) };
            let pos = cover_position(&view, pivot);

            if pos > 0 && view[pos - 1].0.cmp_key(pivot) == std::cmp::Ordering::Equal {
                // Separator already posted (by the splitter or a helper).
                return Ok(());
            }

            if pos == 0 || view[pos - 1].1 != child {
                // The separator covering the pivot does not route to the
                // splitting child: the view is stale.
                return Err(Restart);
            }

            // Never resurrect a sibling that has since been merged away: if
            // it is frozen, the separator delete already won.
            let sibling_head = self.table.protect(sibling, guard);
            if sibling_head.is_null() {
                return Err(Restart);
            }
            // SAFETY: sibling_head is protected by `guard`.
            if matches!(unsafe { &*sibling_head }.kind, RecordKind::Remove { .. }) {
                return Err(Restart);
            }

            let (next_key, next_child) = match view.get(pos) {
                Some((q, c)) => (q.clone(), *c),

                None => (parent_ref.meta.high.clone(), INVALID_NODE_ID),
            };

            let delta = NodeRecord::delta(
                parent_ref,
                parent_head,
                parent_ref.meta.size + 1,
                parent_ref.meta.low.clone(),
                parent_ref.meta.high.clone(),
                RecordKind::InnerInsert {
                    sep_key: pivot.clone(),
                    child: sibling,
                    next_key,
                    next_child,
                },
            )
            .into_raw();

            if self.table.cas(parent_id, parent_head, delta) {
                trace_log!(parent = parent_id, child = sibling, "posted separator insert");

                // The parent grew; cascade its own thresholds.
                self.maybe_adjust(parent_id, delta, ancestors, guard);
                return Ok(());
            }

            // SAFETY: the delta was never published.
            unsafe { drop(NodeRecord::reclaim_unpublished(delta)) };
        }
    }

    // ========================================================================
    //  Merge
    // ========================================================================

    /// Run the merge protocol: freeze `id` and absorb it into its left
    /// sibling. Gives up silently when no left sibling exists under the
    /// same parent.
    pub(crate) fn try_merge(
        &self,
        id: NodeId,
        head: *mut NodeRecord<K, V>,
        path: &[NodeId],
        guard: &LocalGuard<'_>,
    ) {
        if id == self.root_id() {
            return;
        }

        // SAFETY: head is protected by `guard`.
        let head_ref = unsafe { &*head };

        if matches!(
            head_ref.kind,
            RecordKind::Remove { .. } | RecordKind::Split { .. } | RecordKind::Merge { .. }
        ) {
            // Another SMO is in flight on this node; let it finish first.
            return;
        }

        // The leftmost node of a level has nothing to merge into.
        let BoundKey::Key(low) = head_ref.meta.low.clone() else {
            return;
        };

        let Some((&parent_id, _)) = path.split_last() else {
            return;
        };

        // Verify a left sibling exists under the same parent before
        // freezing; helping revalidates everything afterwards.
        {
            let parent_head = self.table.protect(parent_id, guard);
            if parent_head.is_null() {
                return;
            }
            // SAFETY: parent_head is protected by `guard`.
            let parent_ref = unsafe { &*parent_head };
            if matches!(parent_ref.kind, RecordKind::Remove { .. }) {
                return;
            }

            // SAFETY: non-removed inner chain protected by `guard`.
            let view = unsafe { collect_inner(parent_head) };
            let pos = cover_position(&view, &low);
            let routes_here = pos > 0
                && view[pos - 1].0.cmp_key(&low) == std::cmp::Ordering::Equal
                && view[pos - 1].1 == id;

            if !routes_here || pos - 1 == 0 {
                return;
            }
        }

        // Step 1: freeze the node.
        let remove = NodeRecord::delta(
            head_ref,
            head,
            head_ref.meta.size,
            head_ref.meta.low.clone(),
            head_ref.meta.high.clone(),
            RecordKind::Remove {
                node: id,
                merge_state: AtomicU8::new(merge_state::PENDING),
            },
        )
        .into_raw();

        if !self.table.cas(id, head, remove) {
            // SAFETY: the remove delta was never published.
            unsafe { drop(NodeRecord::reclaim_unpublished(remove)) };
            return;
        }

        debug_log!(node = id, "posted remove delta");

        // Steps 2 and 3 (with helping semantics built in).
        let _ = self.help_removed(id, remove, path, guard);
    }

    /// Drive a partially merged node to completion. This is both the tail
    /// of [`try_merge`] and the help path for traversals that land on a
    /// remove record.
    pub(crate) fn help_removed(
        &self,
        victim: NodeId,
        remove_ptr: *mut NodeRecord<K, V>,
        path: &[NodeId],
        guard: &LocalGuard<'_>,
    ) -> Result<(), Restart> {
        // SAFETY: remove_ptr is protected by `guard`.
        let remove_ref = unsafe { &*remove_ptr };

        let RecordKind::Remove { node, merge_state: state } = &remove_ref.kind else {
            return Err(Restart);
        };
        debug_assert_eq!(*node, victim);

        let Some(v_low) = remove_ref.meta.low.as_key().cloned() else {
            // Leftmost nodes are never frozen.
            return Err(Restart);
        };
        let v_high = remove_ref.meta.high.clone();
        let v_size = remove_ref.meta.size;
        let captured = remove_ref.next.load(RELAXED);

        let Some((&parent_id, ancestors)) = path.split_last() else {
            return Err(Restart);
        };

        loop {
            let parent_head = self.table.protect(parent_id, guard);
            if parent_head.is_null() {
                return Err(Restart);
            }

            // SAFETY: parent_head is protected by `guard`.
            let parent_ref = unsafe { &*parent_head };

            if matches!(parent_ref.kind, RecordKind::Remove { .. }) {
                return Err(Restart);
            }

            if !parent_ref.meta.contains(&v_low) {
                return Err(Restart);
            }

            // SAFETY: non-removed inner chain protected by `guard`.
            let view = unsafe { collect_inner(parent_head) };
            let pos = cover_position(&view, &v_low);
            let has_separator = pos > 0
                && view[pos - 1].0.cmp_key(&v_low) == std::cmp::Ordering::Equal
                && view[pos - 1].1 == victim;

            if !has_separator {
                // Step 3 already landed; the merge is complete.
                return Ok(());
            }

            if pos - 1 == 0 {
                // The victim became the leftmost child of its (possibly
                // new, post-split) parent, so no left sibling can absorb
                // it. If no merge delta claimed the frozen chain yet, the
                // merge is unfinishable: abort it and unfreeze the node.
                if state
                    .compare_exchange(
                        merge_state::PENDING,
                        merge_state::ABORTED,
                        CAS_SUCCESS,
                        CAS_FAILURE,
                    )
                    .is_ok()
                {
                    // The ABORTED claim excludes any future merge post, so
                    // the captured chain has exactly one owner again.
                    let unfroze = self.table.cas(victim, remove_ptr, captured);
                    debug_assert!(unfroze, "a remove record can only leave the slot here");

                    if unfroze {
                        warn_log!(victim, "aborted unfinishable merge");

                        // SAFETY: the remove record left its slot and no
                        // chain links to it; nothing can reach it anew.
                        unsafe { retire_record(guard, remove_ptr) };
                    }
                }

                return Err(Restart);
            }

            let left = view[pos - 2].1;
            let left_head = self.table.protect(left, guard);
            if left_head.is_null() {
                return Err(Restart);
            }

            // SAFETY: left_head is protected by `guard`.
            let left_ref = unsafe { &*left_head };

            if matches!(left_ref.kind, RecordKind::Remove { .. }) {
                // The left sibling is itself being merged away; retry from
                // a fresh descent once that settles.
                return Err(Restart);
            }

            match left_ref.meta.high.cmp_key(&v_low) {
                std::cmp::Ordering::Equal => {
                    // Step 2 outstanding. Claim the frozen chain first: a
                    // helper with a stale view must not post a second merge
                    // after an earlier one landed (the sibling can split
                    // back to this exact high bound), and the abort path
                    // must not unfreeze a chain that a merge references.
                    if state
                        .compare_exchange(
                            merge_state::PENDING,
                            merge_state::POSTED,
                            CAS_SUCCESS,
                            CAS_FAILURE,
                        )
                        .is_err()
                    {
                        return Err(Restart);
                    }

                    let merge = NodeRecord::delta(
                        left_ref,
                        left_head,
                        left_ref.meta.size + v_size,
                        left_ref.meta.low.clone(),
                        v_high.clone(),
                        RecordKind::Merge {
                            pivot: v_low.clone(),
                            sibling: victim,
                            sibling_head: captured,
                        },
                    )
                    .into_raw();

                    if self.table.cas(left, left_head, merge) {
                        debug_log!(left, victim, "posted merge delta");
                    } else {
                        // Lost the sibling CAS; release the claim so any
                        // helper (including this loop) can retry.
                        state.store(merge_state::PENDING, WRITE_ORD);

                        // SAFETY: the merge delta was never published.
                        unsafe { drop(NodeRecord::reclaim_unpublished(merge)) };
                    }
                    // Either way, re-examine: the next round posts step 3.
                }

                std::cmp::Ordering::Greater => {
                    // Step 2 done (even if consolidation folded the delta);
                    // post step 3.
                    let (next_key, next_child) = match view.get(pos) {
                        Some((q, c)) => (q.clone(), *c),

                        None => (parent_ref.meta.high.clone(), INVALID_NODE_ID),
                    };

                    let delta = NodeRecord::delta(
                        parent_ref,
                        parent_head,
                        parent_ref.meta.size - 1,
                        parent_ref.meta.low.clone(),
                        parent_ref.meta.high.clone(),
                        RecordKind::InnerDelete {
                            sep_key: v_low.clone(),
                            child: victim,
                            prev_key: view[pos - 2].0.clone(),
                            prev_child: left,
                            next_key,
                            next_child,
                        },
                    )
                    .into_raw();

                    if self.table.cas(parent_id, parent_head, delta) {
                        trace_log!(parent = parent_id, victim, "posted separator delete");

                        self.maybe_adjust(parent_id, delta, ancestors, guard);
                        self.maybe_collapse_root(parent_id, guard);
                        return Ok(());
                    }

                    // SAFETY: the delta was never published.
                    unsafe { drop(NodeRecord::reclaim_unpublished(delta)) };
                }

                std::cmp::Ordering::Less => {
                    // The view's left sibling does not even reach the
                    // victim: stale snapshot.
                    return Err(Restart);
                }
            }
        }
    }

    /// Make sure the separator delete for an absorbed sibling has landed.
    /// Help path for traversals whose chain head is a merge record.
    pub(crate) fn ensure_absorb_completed(
        &self,
        pivot: &K,
        victim: NodeId,
        path: &[NodeId],
        guard: &LocalGuard<'_>,
    ) -> Result<(), Restart> {
        let Some((&parent_id, ancestors)) = path.split_last() else {
            // The absorbing node is the root; there is no separator above.
            return Ok(());
        };

        loop {
            let parent_head = self.table.protect(parent_id, guard);
            if parent_head.is_null() {
                return Err(Restart);
            }

            // SAFETY: parent_head is protected by `guard`.
            let parent_ref = unsafe { &*parent_head };

            if matches!(parent_ref.kind, RecordKind::Remove { .. }) {
                return Err(Restart);
            }

            // SAFETY: non-removed inner chain protected by `guard`.
            let view = unsafe { collect_inner(parent_head) };
            let pos = cover_position(&view, pivot);
            let has_separator = pos > 0
                && view[pos - 1].0.cmp_key(pivot) == std::cmp::Ordering::Equal
                && view[pos - 1].1 == victim;

            if !has_separator {
                return Ok(());
            }

            if pos - 1 == 0 {
                return Err(Restart);
            }

            let (next_key, next_child) = match view.get(pos) {
                Some((q, c)) => (q.clone(), *c),

                None => (parent_ref.meta.high.clone(), INVALID_NODE_ID),
            };

            let delta = NodeRecord::delta(
                parent_ref,
                parent_head,
                parent_ref.meta.size - 1,
                parent_ref.meta.low.clone(),
                parent_ref.meta.high.clone(),
                RecordKind::InnerDelete {
                    sep_key: pivot.clone(),
                    child: victim,
                    prev_key: view[pos - 2].0.clone(),
                    prev_child: view[pos - 2].1,
                    next_key,
                    next_child,
                },
            )
            .into_raw();

            if self.table.cas(parent_id, parent_head, delta) {
                trace_log!(parent = parent_id, victim, "posted separator delete (absorb help)");

                self.maybe_adjust(parent_id, delta, ancestors, guard);
                self.maybe_collapse_root(parent_id, guard);
                return Ok(());
            }

            // SAFETY: the delta was never published.
            unsafe { drop(NodeRecord::reclaim_unpublished(delta)) };
        }
    }

    /// Collapse a root that routes everything to a single child.
    pub(crate) fn maybe_collapse_root(&self, candidate: NodeId, guard: &LocalGuard<'_>) {
        if candidate != self.root_id() {
            return;
        }

        let head = self.table.protect(candidate, guard);
        if head.is_null() {
            return;
        }

        // SAFETY: head is protected by `guard`.
        let head_ref = unsafe { &*head };

        if head_ref.meta.class != crate::node::NodeClass::Inner
            || head_ref.meta.size != 1
            || matches!(head_ref.kind, RecordKind::Remove { .. })
        {
            return;
        }

        // SAFETY: non-removed inner chain protected by `guard`.
        let view = unsafe { collect_inner(head) };
        let [(BoundKey::NegInf, child)] = view.as_slice() else {
            return;
        };

        if self
            .root
            .compare_exchange(candidate, *child, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
        {
            debug_log!(old_root = candidate, new_root = *child, "collapsed root");
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
