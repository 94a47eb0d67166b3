//! Epoch client: deferred reclamation of unreachable chain records.
//!
//! The tree never frees a published record directly. When a CAS removes a
//! chain from its mapping slot, the winner retires every record of the old
//! chain here; seize frees them once every guard that could have observed
//! the old head has been dropped.
//!
//! The two-call epoch interface maps onto seize directly: entering an epoch
//! is [`EpochDomain::enter`], leaving it is dropping the returned guard, and
//! the garbage list is fed through [`retire_chain`] / [`retire_record`].

use seize::{Collector, Guard as _, LocalGuard};

use crate::node::{NodeRecord, RecordKind};
use crate::ordering::RELAXED;
use crate::tracing_helpers::trace_log;

// ============================================================================
//  EpochDomain
// ============================================================================

/// Owns the seize collector for one tree.
pub(crate) struct EpochDomain {
    collector: Collector,
}

impl EpochDomain {
    pub(crate) fn new() -> Self {
        Self {
            collector: Collector::new(),
        }
    }

    /// Enter the current epoch. Every tree operation holds one of these for
    /// its full duration; chain pointers loaded through
    /// [`MappingTable::protect`](crate::mapping::MappingTable::protect)
    /// remain valid until the guard drops.
    #[inline]
    pub(crate) fn enter(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }
}

// ============================================================================
//  Reclaimers (seize callback signatures)
// ============================================================================

/// Reclaim a boxed chain record (seize callback).
///
/// # Safety
///
/// - `ptr` must point to a `NodeRecord` allocated via `Box::into_raw`.
/// - Must only be called after seize determines no reader remains.
unsafe fn reclaim_record_boxed<K, V>(ptr: *mut NodeRecord<K, V>, _collector: &Collector) {
    // SAFETY: caller guarantees ptr is valid and from Box::into_raw;
    // seize ensures no readers remain.
    unsafe { drop(Box::from_raw(ptr)) };
}

// ============================================================================
//  Retirement
// ============================================================================

/// Retire a single record that a CAS just made unreachable.
///
/// # Safety
///
/// - `ptr` must have been published and then removed from every mapping
///   slot; no new traversal can reach it.
/// - Must not be retired twice.
pub(crate) unsafe fn retire_record<K, V>(guard: &LocalGuard<'_>, ptr: *mut NodeRecord<K, V>) {
    // SAFETY: forwarded caller contract.
    unsafe { guard.defer_retire(ptr, reclaim_record_boxed::<K, V>) };
}

/// Retire an entire replaced chain: every record from `head` down to and
/// including the base, branching into merge-captured sibling chains.
///
/// Remove records never occur inside a retired chain (they are only ever
/// chain heads, and remove-headed chains are never consolidated).
///
/// # Safety
///
/// - `head` must be the old head a successful CAS just replaced; the whole
///   chain below it is thereby unreachable from the mapping table.
/// - The chain must not be retired twice.
pub(crate) unsafe fn retire_chain<K, V>(guard: &LocalGuard<'_>, head: *mut NodeRecord<K, V>) {
    let mut stack: Vec<*mut NodeRecord<K, V>> = vec![head];
    let mut retired: usize = 0;

    while let Some(ptr) = stack.pop() {
        if ptr.is_null() {
            continue;
        }

        // SAFETY: the record is unreachable but not yet freed; we hold a
        // guard, so seize cannot reclaim it under us.
        let record = unsafe { &*ptr };

        debug_assert!(
            !matches!(record.kind, RecordKind::Remove { .. }),
            "remove records are never part of a retired chain"
        );

        if let RecordKind::Merge { sibling_head, .. } = &record.kind {
            stack.push(*sibling_head);
        }
        stack.push(record.next.load(RELAXED));

        // SAFETY: per the caller contract each record is retired once.
        unsafe { retire_record(guard, ptr) };
        retired += 1;
    }

    trace_log!(retired, "retired replaced chain");
    let _ = retired;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bound::BoundKey;
    use crate::node::{NodeClass, RecordKind};
    use crate::node::base::BaseNode;

    fn base_record() -> NodeRecord<u64, u64> {
        NodeRecord::base(
            NodeClass::Leaf,
            0,
            BoundKey::NegInf,
            BoundKey::PosInf,
            RecordKind::LeafBase(BaseNode::from_sorted(Vec::new())),
        )
    }

    #[test]
    fn test_retire_single_record() {
        let domain = EpochDomain::new();
        let ptr = base_record().into_raw();

        {
            let guard = domain.enter();
            // SAFETY: ptr is unreachable (never published anywhere).
            unsafe { retire_record(&guard, ptr) };
        }
        // Dropping the domain reclaims everything; Miri would catch leaks.
    }

    #[test]
    fn test_retire_chain_walks_to_base() {
        let domain = EpochDomain::new();

        let base_ptr = base_record().into_raw();
        // SAFETY: just leaked, exclusively owned.
        let base_ref = unsafe { &*base_ptr };
        let delta = NodeRecord::delta(
            base_ref,
            base_ptr,
            1,
            BoundKey::NegInf,
            BoundKey::PosInf,
            RecordKind::LeafInsert { key: 7, value: 7 },
        );
        let head = delta.into_raw();

        {
            let guard = domain.enter();
            // SAFETY: the two-record chain is unreachable and retired once.
            unsafe { retire_chain(&guard, head) };
        }
    }
}
