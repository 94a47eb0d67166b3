//! Debug surface: the tree dumper and the structural invariant checker.
//!
//! Both are informational. The checker is meant for quiescent states (unit
//! tests, after joins); running it concurrently with writers can observe a
//! half-finished SMO and report a spurious violation.

use std::fmt::Write as _;
use std::fmt as StdFmt;

use crate::bound::BoundKey;
use crate::mapping::{INVALID_NODE_ID, NodeId};
use crate::node::{NodeClass, RecordKind};
use crate::ordering::RELAXED;
use crate::tree::BwTree;

use super::consolidate::{collect_inner, collect_leaf};
use super::traverse::Target;

impl<K, V> BwTree<K, V>
where
    K: Ord + Clone + StdFmt::Debug + 'static,
    V: Clone + PartialEq + StdFmt::Debug + 'static,
{
    /// Walk the whole tree and panic on the first structural violation.
    ///
    /// Checks, for every reachable virtual node:
    /// 1. the children of an inner node partition its range exactly
    ///    (so any key is covered by at most one leaf);
    /// 2. leaf content is strictly sorted and unique;
    /// 3. separators are strictly sorted, the first equals the node's low
    ///    bound, and each child's cached bounds match its separator window;
    /// 4. the cached height equals the number of delta records along `next`;
    /// 5. the cached size equals the effective content count;
    /// 6. every referenced child ID resolves to a live mapping slot.
    pub fn check_invariants(&self) {
        let guard = self.epoch.enter();

        let mut stack: Vec<(NodeId, BoundKey<K>, BoundKey<K>)> =
            vec![(self.root_id(), BoundKey::NegInf, BoundKey::PosInf)];

        while let Some((id, low, high)) = stack.pop() {
            assert!(
                (id as usize) < self.table.capacity() && id < self.table.allocated(),
                "node {id} outside the allocated ID range"
            );

            let head = self.table.protect(id, &guard);
            assert!(!head.is_null(), "node {id} has an empty mapping slot");

            // SAFETY: head is protected by `guard`.
            let head_ref = unsafe { &*head };

            assert!(
                !matches!(head_ref.kind, RecordKind::Remove { .. }),
                "node {id} is frozen in a quiescent tree"
            );

            assert_eq!(
                head_ref.meta.low, low,
                "node {id}: cached low bound disagrees with its separator window"
            );
            assert_eq!(
                head_ref.meta.high, high,
                "node {id}: cached high bound disagrees with its separator window"
            );

            // Height consistency: count non-base records along `next`.
            let mut cursor = head;
            let mut height: u64 = 0;
            loop {
                // SAFETY: the chain is protected by `guard`.
                let record = unsafe { &*cursor };
                if record.kind.is_base() {
                    break;
                }
                height += 1;
                cursor = record.next.load(RELAXED);
            }
            assert_eq!(
                height,
                u64::from(head_ref.meta.height),
                "node {id}: cached height diverged from the chain"
            );

            match head_ref.meta.class {
                NodeClass::Leaf => {
                    // SAFETY: non-removed leaf chain protected by `guard`.
                    let entries = unsafe { collect_leaf(head) };

                    assert_eq!(
                        entries.len(),
                        head_ref.meta.size as usize,
                        "leaf {id}: cached size diverged from content"
                    );

                    assert!(
                        entries.windows(2).all(|w| w[0].0 < w[1].0),
                        "leaf {id}: content not strictly sorted"
                    );

                    for (k, _) in &entries {
                        assert!(
                            low.admits_low(k) && high.admits_high(k),
                            "leaf {id}: key {k:?} outside [{low:?}, {high:?})"
                        );
                    }
                }

                NodeClass::Inner => {
                    // SAFETY: non-removed inner chain protected by `guard`.
                    let view = unsafe { collect_inner(head) };

                    assert_eq!(
                        view.len(),
                        head_ref.meta.size as usize,
                        "inner {id}: cached size diverged from content"
                    );

                    assert!(!view.is_empty(), "inner {id}: no separators");

                    assert_eq!(
                        view[0].0, low,
                        "inner {id}: first separator must equal the low bound"
                    );

                    assert!(
                        view.windows(2).all(|w| w[0].0 < w[1].0),
                        "inner {id}: separators not strictly sorted"
                    );

                    for (i, (sep, child)) in view.iter().enumerate() {
                        assert_ne!(*child, INVALID_NODE_ID, "inner {id}: dangling separator");

                        assert!(
                            *sep < high,
                            "inner {id}: separator {sep:?} at or above high bound {high:?}"
                        );

                        let child_high = match view.get(i + 1) {
                            Some((next_sep, _)) => next_sep.clone(),

                            None => high.clone(),
                        };
                        stack.push((*child, sep.clone(), child_high));
                    }
                }
            }
        }
    }

    /// Serialise every reachable virtual node as
    /// `(node_id, class, height, size, low, high, chain...)`, one per line.
    /// Informational only; the format is not stable.
    #[must_use]
    pub fn dump(&self) -> String {
        let guard = self.epoch.enter();
        let mut out = String::new();

        let mut stack: Vec<NodeId> = vec![self.root_id()];

        while let Some(id) = stack.pop() {
            let head = self.table.protect(id, &guard);
            if head.is_null() {
                let _ = writeln!(out, "({id}, <empty>)");
                continue;
            }

            // SAFETY: head is protected by `guard`.
            let head_ref = unsafe { &*head };
            let meta = &head_ref.meta;

            let class = match meta.class {
                NodeClass::Leaf => "leaf",

                NodeClass::Inner => "inner",
            };

            let _ = write!(
                out,
                "({id}, {class}, h={}, size={}, low={:?}, high={:?}, chain=[",
                meta.height, meta.size, meta.low, meta.high
            );

            let mut cursor = head;
            let mut first = true;
            loop {
                // SAFETY: the chain is protected by `guard`.
                let record = unsafe { &*cursor };

                if !first {
                    let _ = write!(out, " ");
                }
                first = false;

                match &record.kind {
                    RecordKind::LeafInsert { key, value } => {
                        let _ = write!(out, "Insert({key:?}={value:?})");
                    }

                    RecordKind::LeafDelete { key, value } => {
                        let _ = write!(out, "Delete({key:?}={value:?})");
                    }

                    RecordKind::InnerInsert {
                        sep_key,
                        child,
                        next_key,
                        next_child,
                    } => {
                        let _ = write!(
                            out,
                            "SepInsert({sep_key:?}->{child}, next {next_key:?}->{next_child})"
                        );
                    }

                    RecordKind::InnerDelete {
                        sep_key,
                        child,
                        prev_key,
                        prev_child,
                        next_key,
                        next_child,
                    } => {
                        let _ = write!(
                            out,
                            "SepDelete({sep_key:?}->{child}, prev {prev_key:?}->{prev_child}, next {next_key:?}->{next_child})"
                        );
                    }

                    RecordKind::Split { pivot, sibling } => {
                        let _ = write!(out, "Split({pivot:?}->{sibling})");
                    }

                    RecordKind::Merge { pivot, sibling, .. } => {
                        let _ = write!(out, "Merge({pivot:?}<-{sibling})");
                    }

                    _ => {
                        let _ = write!(out, "{}", record.kind.tag());
                    }
                }

                if record.kind.is_base() || matches!(record.kind, RecordKind::Remove { .. }) {
                    break;
                }
                cursor = record.next.load(RELAXED);
            }
            let _ = writeln!(out, "])");

            if meta.class == NodeClass::Inner
                && !matches!(head_ref.kind, RecordKind::Remove { .. })
            {
                // SAFETY: non-removed inner chain protected by `guard`.
                for (_, child) in unsafe { collect_inner(head) } {
                    stack.push(child);
                }
            }
        }

        out
    }

    /// Chain height and logical size of the leaf covering `key`.
    ///
    /// Test instrumentation: descends passively, without helping or
    /// consolidating, so it observes the chain exactly as the last
    /// mutation left it. Quiescent trees only.
    #[doc(hidden)]
    #[must_use]
    pub fn leaf_chain_stats(&self, key: &K) -> (u16, u32) {
        let guard = self.epoch.enter();
        let mut id = self.root_id();

        loop {
            let head = self.table.protect(id, &guard);
            assert!(!head.is_null(), "probe hit an empty slot");

            // SAFETY: head is protected by `guard`.
            let head_ref = unsafe { &*head };

            match head_ref.meta.class {
                NodeClass::Leaf => return (head_ref.meta.height, head_ref.meta.size),

                NodeClass::Inner => {
                    // SAFETY: head is protected by `guard`.
                    match unsafe { super::traverse::route_inner_chain(head, Target::Key(key)) } {
                        super::traverse::InnerRoute::Child(child) => id = child,

                        super::traverse::InnerRoute::MovedRight(sibling) => id = sibling,

                        super::traverse::InnerRoute::Removed => {
                            panic!("probe hit a frozen node in a quiescent tree")
                        }
                    }
                }
            }
        }
    }
}
