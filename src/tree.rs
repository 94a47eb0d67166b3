//! Filepath: src/tree.rs
//!
//! `BwTree` - a latch-free, in-memory ordered index.
//!
//! This module provides the main `BwTree<K, V>` type: point operations,
//! range scans, and the retry loops that tie the mapping table, traversal
//! engine, and SMO coordinator together.

use std::fmt as StdFmt;
use std::sync::atomic::{AtomicU64, AtomicUsize};

use crate::bound::BoundKey;
use crate::config::BwTreeConfig;
use crate::epoch::EpochDomain;
use crate::mapping::{MappingTable, NodeId};
use crate::node::base::BaseNode;
use crate::node::{NodeClass, NodeRecord, RecordKind};
use crate::ordering::{READ_ORD, RELAXED};
use crate::tracing_helpers::trace_log;

mod consolidate;
mod scan;
mod smo;
mod traverse;
mod verify;

pub use scan::Scan;

use traverse::{LeafSearch, Target, search_leaf_chain};

/// Internal control-flow token: the current view of the tree went stale and
/// the operation must re-descend from the root.
pub(crate) struct Restart;

// ============================================================================
//  Errors
// ============================================================================

/// Errors that can occur during insert operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
    /// The key is already present. The tree enforces unique keys;
    /// multiplicity is the host's concern.
    KeyExists,
}

impl StdFmt::Display for InsertError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::KeyExists => write!(f, "key already exists"),
        }
    }
}

impl std::error::Error for InsertError {}

/// Errors that can occur during remove operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveError {
    /// The key is not in the tree.
    KeyNotFound,

    /// The key is present but bound to a different value.
    ValueMismatch,
}

impl StdFmt::Display for RemoveError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::KeyNotFound => write!(f, "key not found"),

            Self::ValueMismatch => write!(f, "value does not match"),
        }
    }
}

impl std::error::Error for RemoveError {}

// ============================================================================
//  BwTree
// ============================================================================

/// A latch-free ordered index from `K` to `V`.
///
/// Logical nodes are addressed through a mapping table of atomic slots;
/// each slot points at an immutable delta chain terminating in a base node.
/// Updates prepend a delta with a single CAS, structure changes run
/// multi-step CAS protocols that any thread can help complete, and memory
/// is reclaimed through epochs, so readers never block and never observe a
/// freed record.
///
/// # Type Parameters
///
/// * `K` - Key type. `Ord` supplies the comparator; `Clone` lets records
///   cache range bounds.
/// * `V` - Value type. `PartialEq` supplies the value-equality check that
///   [`BwTree::remove`] requires.
///
/// # Consistency
///
/// Point operations are linearizable at the CAS that installs their delta
/// (or the load that observed the chain head). Range scans are snapshots
/// per leaf; see [`BwTree::scan`].
pub struct BwTree<K, V> {
    pub(crate) table: MappingTable<K, V>,
    pub(crate) root: AtomicU64,
    pub(crate) config: BwTreeConfig,
    pub(crate) epoch: EpochDomain,
    count: AtomicUsize,
}

// SAFETY: all shared state is either atomic (mapping slots, root, count) or
// immutable after publication (chain records); cross-thread handoff of keys
// and values happens only through those records, guarded by the epoch
// domain. The raw pointers inside records are an implementation detail of
// that protocol.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for BwTree<K, V> {}
// SAFETY: as above.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for BwTree<K, V> {}

impl<K, V> BwTree<K, V>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    /// Build an empty tree.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid; see
    /// [`BwTreeConfig::validate`].
    #[must_use]
    pub fn new(config: BwTreeConfig) -> Self {
        if let Err(err) = config.validate() {
            panic!("invalid bw-tree configuration: {err}");
        }

        let table = MappingTable::with_slots(config.mapping_table_slots);
        let root_record = NodeRecord::base(
            NodeClass::Leaf,
            0,
            BoundKey::NegInf,
            BoundKey::PosInf,
            RecordKind::LeafBase(BaseNode::from_sorted(Vec::new())),
        );
        let root = match table.allocate(root_record) {
            Ok(id) => id,

            Err(err) => panic!("bw-tree structural failure: {err}"),
        };

        Self {
            table,
            root: AtomicU64::new(root),
            config,
            epoch: EpochDomain::new(),
            count: AtomicUsize::new(0),
        }
    }

    /// Current root node ID.
    #[inline]
    pub(crate) fn root_id(&self) -> NodeId {
        self.root.load(READ_ORD)
    }

    /// Allocate a mapping slot or die trying: running out of slots is a
    /// structural contract violation, not a recoverable condition.
    pub(crate) fn allocate_or_abort(&self, record: NodeRecord<K, V>) -> NodeId {
        match self.table.allocate(record) {
            Ok(id) => id,

            Err(err) => panic!("bw-tree structural failure: {err}"),
        }
    }

    /// Approximate number of live entries.
    ///
    /// Maintained with relaxed counters on successful inserts and removes;
    /// exact only in quiescent states.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(RELAXED)
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configuration this tree was built with.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BwTreeConfig {
        &self.config
    }

    // ========================================================================
    //  Point operations
    // ========================================================================

    /// Look up `key`, returning its value if present.
    #[must_use]
    pub fn lookup(&self, key: &K) -> Option<V> {
        let guard = self.epoch.enter();

        loop {
            let descent = self.descend_to_leaf(Target::Key(key), &guard);

            // SAFETY: the leaf head is protected by `guard` and its range
            // covered the key at load time.
            match unsafe { search_leaf_chain(descent.leaf_head, key) } {
                LeafSearch::Present(value) => return Some(value),

                LeafSearch::Absent => return None,

                // The descent pinned the key inside the node's range, so
                // these only surface from stale snapshots; re-descend.
                LeafSearch::MovedRight(_) | LeafSearch::Removed => continue,
            }
        }
    }

    /// Insert `(key, value)`. Fails if the key is already present.
    ///
    /// A failed insert leaves the tree logically identical to its pre-call
    /// state.
    pub fn insert(&self, key: K, value: V) -> Result<(), InsertError> {
        let guard = self.epoch.enter();
        let mut key = key;
        let mut value = value;

        loop {
            let descent = self.descend_to_leaf(Target::Key(&key), &guard);

            // SAFETY: the leaf head is protected by `guard`.
            match unsafe { search_leaf_chain(descent.leaf_head, &key) } {
                LeafSearch::Present(_) => return Err(InsertError::KeyExists),

                LeafSearch::Absent => {}

                LeafSearch::MovedRight(_) | LeafSearch::Removed => continue,
            }

            let head = descent.leaf_head;
            // SAFETY: as above.
            let head_ref = unsafe { &*head };

            let delta = NodeRecord::delta(
                head_ref,
                head,
                head_ref.meta.size + 1,
                head_ref.meta.low.clone(),
                head_ref.meta.high.clone(),
                RecordKind::LeafInsert { key, value },
            )
            .into_raw();

            if self.table.cas(descent.leaf_id, head, delta) {
                trace_log!(node = descent.leaf_id, "installed insert delta");

                self.count.fetch_add(1, RELAXED);
                self.maybe_adjust(descent.leaf_id, delta, &descent.path, &guard);
                return Ok(());
            }

            // CAS lost: take the key and value back out of the unpublished
            // record and retry from a fresh descent.
            // SAFETY: the delta was never published.
            let unpublished = unsafe { NodeRecord::reclaim_unpublished(delta) };
            match unpublished.kind {
                RecordKind::LeafInsert { key: k, value: v } => {
                    key = k;
                    value = v;
                }

                _ => unreachable!("reclaimed record is the insert delta we built"),
            }
        }
    }

    /// Remove `(key, value)`. The stored value must compare equal to
    /// `value`, otherwise nothing is removed.
    pub fn remove(&self, key: &K, value: &V) -> Result<(), RemoveError> {
        let guard = self.epoch.enter();

        loop {
            let descent = self.descend_to_leaf(Target::Key(key), &guard);

            // SAFETY: the leaf head is protected by `guard`.
            match unsafe { search_leaf_chain(descent.leaf_head, key) } {
                LeafSearch::Absent => return Err(RemoveError::KeyNotFound),

                LeafSearch::Present(stored) => {
                    if stored != *value {
                        return Err(RemoveError::ValueMismatch);
                    }
                }

                LeafSearch::MovedRight(_) | LeafSearch::Removed => continue,
            }

            let head = descent.leaf_head;
            // SAFETY: as above.
            let head_ref = unsafe { &*head };

            let delta = NodeRecord::delta(
                head_ref,
                head,
                head_ref.meta.size - 1,
                head_ref.meta.low.clone(),
                head_ref.meta.high.clone(),
                RecordKind::LeafDelete {
                    key: key.clone(),
                    value: value.clone(),
                },
            )
            .into_raw();

            if self.table.cas(descent.leaf_id, head, delta) {
                trace_log!(node = descent.leaf_id, "installed delete delta");

                self.count.fetch_sub(1, RELAXED);
                self.maybe_adjust(descent.leaf_id, delta, &descent.path, &guard);
                return Ok(());
            }

            // SAFETY: the delta was never published.
            unsafe { drop(NodeRecord::reclaim_unpublished(delta)) };
        }
    }
}

impl<K, V> Default for BwTree<K, V>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    fn default() -> Self {
        Self::new(BwTreeConfig::default())
    }
}

impl<K, V> StdFmt::Debug for BwTree<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("BwTree")
            .field("root", &self.root.load(READ_ORD))
            .field("len", &self.count.load(RELAXED))
            .field("nodes", &self.table.allocated())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Tests
// ============================================================================
