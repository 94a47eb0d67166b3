//! Filepath: src/mapping.rs
//!
//! The mapping table: stable node IDs to atomic physical pointers.
//!
//! Every logical node is addressed by a [`NodeId`] that never changes for
//! the node's lifetime; the table translates it to the current chain head.
//! All structural mutation in the tree funnels through [`MappingTable::cas`]
//! on a single slot, which is what makes delta installation latch-free.
//!
//! The minimal table never recycles IDs: the slot count is a hard cap on
//! the number of nodes ever allocated, and a removed node's slot keeps its
//! final record until the table is dropped.

use std::collections::HashSet;
use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU64};

use seize::{Guard as _, LocalGuard};

use crate::node::{NodeRecord, RecordKind};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

/// Stable identifier of a logical node.
pub type NodeId = u64;

/// Sentinel meaning "no node".
pub const INVALID_NODE_ID: NodeId = NodeId::MAX;

// ============================================================================
//  MappingTable
// ============================================================================

/// Fixed array of atomic slots from node IDs to chain heads.
pub(crate) struct MappingTable<K, V> {
    slots: Box<[AtomicPtr<NodeRecord<K, V>>]>,
    next_slot: AtomicU64,
}

/// The table ran out of slots.
///
/// Slots are never recycled, so this is a lifetime cap, not a live-node
/// count. Structural failure: the tree treats it as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingTableFull {
    /// The fixed slot count of the exhausted table.
    pub slots: usize,
}

impl StdFmt::Display for MappingTableFull {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "mapping table exhausted ({} slots)", self.slots)
    }
}

impl std::error::Error for MappingTableFull {}

impl<K, V> MappingTable<K, V> {
    /// Build a table with a fixed number of slots, all empty.
    pub(crate) fn with_slots(slots: usize) -> Self {
        let mut table = Vec::with_capacity(slots);
        table.resize_with(slots, || AtomicPtr::new(StdPtr::null_mut()));

        Self {
            slots: table.into_boxed_slice(),
            next_slot: AtomicU64::new(0),
        }
    }

    /// Fixed slot count.
    #[inline]
    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of IDs handed out so far.
    #[inline]
    #[must_use]
    pub(crate) fn allocated(&self) -> u64 {
        self.next_slot.load(RELAXED).min(self.slots.len() as u64)
    }

    /// Allocate a fresh ID and publish `head` in its slot.
    ///
    /// The counter only moves forward; a failed allocation still consumes
    /// nothing visible (the slot range is bounds-checked before the store).
    pub(crate) fn allocate(&self, head: NodeRecord<K, V>) -> Result<NodeId, MappingTableFull> {
        let id = self.next_slot.fetch_add(1, CAS_SUCCESS);

        if id as usize >= self.slots.len() {
            return Err(MappingTableFull {
                slots: self.slots.len(),
            });
        }

        self.slots[id as usize].store(head.into_raw(), WRITE_ORD);

        Ok(id)
    }

    /// Load the chain head of `id`, protected by the caller's epoch guard.
    ///
    /// The returned pointer stays valid until the guard is dropped, even if
    /// a concurrent consolidation retires the chain in the meantime.
    #[inline]
    pub(crate) fn protect(
        &self,
        id: NodeId,
        guard: &LocalGuard<'_>,
    ) -> *mut NodeRecord<K, V> {
        guard.protect(&self.slots[id as usize], READ_ORD)
    }

    /// Single-word CAS on the slot of `id`. Returns the success bit; the
    /// caller retries on failure.
    #[inline]
    pub(crate) fn cas(
        &self,
        id: NodeId,
        expected: *mut NodeRecord<K, V>,
        new: *mut NodeRecord<K, V>,
    ) -> bool {
        self.slots[id as usize]
            .compare_exchange(expected, new, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Unconditionally overwrite the slot of `id`.
    ///
    /// Only valid while the slot is invisible to other threads, i.e. for
    /// unpublishing a sibling whose ID no other thread has learned yet.
    #[inline]
    pub(crate) fn store(&self, id: NodeId, ptr: *mut NodeRecord<K, V>) {
        self.slots[id as usize].store(ptr, WRITE_ORD);
    }

    /// Clear every slot and rewind the ID counter, freeing all records.
    ///
    /// Test-only escape hatch; not safe under concurrency (requires
    /// `&mut self`, which already guarantees exclusivity).
    #[allow(dead_code)]
    pub(crate) fn reset(&mut self) {
        // SAFETY: &mut self means no concurrent access; every chain record
        // is freed exactly once below.
        unsafe { free_all_chains(&self.slots) };

        for slot in &*self.slots {
            slot.store(StdPtr::null_mut(), RELAXED);
        }
        self.next_slot.store(0, RELAXED);
    }
}

impl<K, V> Drop for MappingTable<K, V> {
    fn drop(&mut self) {
        // SAFETY: drop has exclusive access; records retired through the
        // epoch are no longer referenced by any slot, so the sets are
        // disjoint and nothing is freed twice.
        unsafe { free_all_chains(&self.slots) };
    }
}

// ============================================================================
//  Teardown
// ============================================================================

/// Free every record reachable from the given slots, exactly once.
///
/// Walks each chain through `next`, branching into merge-captured sibling
/// chains. A remove record's `next` is *not* followed: the chain below it is
/// owned by the left sibling's merge delta and reached through that path
/// instead. A visited set keyed on addresses guards against double-frees on
/// shared structure.
///
/// # Safety
///
/// The caller must have exclusive access: no concurrent traversal may hold
/// a pointer into any of these chains.
unsafe fn free_all_chains<K, V>(slots: &[AtomicPtr<NodeRecord<K, V>>]) {
    let mut visited: HashSet<usize> = HashSet::new();
    let mut stack: Vec<*mut NodeRecord<K, V>> = Vec::with_capacity(64);

    for slot in slots {
        let head = slot.load(RELAXED);
        if !head.is_null() {
            stack.push(head);
        }
    }

    while let Some(ptr) = stack.pop() {
        if ptr.is_null() || !visited.insert(ptr.addr()) {
            continue;
        }

        // SAFETY: ptr came from a published record and has not been freed
        // yet (visited set), and the caller guarantees exclusivity.
        let record = unsafe { &*ptr };

        match &record.kind {
            RecordKind::Remove { merge_state, .. } => {
                // Once the merge landed, the chain below is owned by the
                // absorbing sibling's merge delta (and may already have
                // been retired with it); before that, this slot is its
                // only owner.
                if merge_state.load(RELAXED) != crate::node::merge_state::POSTED {
                    stack.push(record.next.load(RELAXED));
                }
            }

            RecordKind::Merge { sibling_head, .. } => {
                stack.push(*sibling_head);
                stack.push(record.next.load(RELAXED));
            }

            _ => {
                stack.push(record.next.load(RELAXED));
            }
        }

        // SAFETY: every record was allocated via Box::into_raw and is freed
        // exactly once thanks to the visited set.
        unsafe { drop(Box::from_raw(ptr)) };
    }
}

// ============================================================================
//  Tests
// ============================================================================
