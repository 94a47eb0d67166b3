//! # bwtree
//!
//! A latch-free, in-memory ordered index based on the Bw-Tree design:
//! logical nodes behind a mapping table, updates as immutable delta records
//! installed by CAS, and cooperative multi-step structure changes.
//!
//! ## Design
//!
//! - A **mapping table** translates stable node IDs to the physical head of
//!   each node's **delta chain**, a linked stack of immutable records over
//!   an immutable sorted **base node**.
//! - All mutation is a single-word CAS on a mapping slot. There are no node
//!   latches; readers never block and writers never block readers.
//! - Structure changes (split, merge, remove) are multi-step CAS protocols.
//!   Any thread that observes a half-done step completes it before
//!   retrying, so a stalled thread cannot block the tree (obstruction
//!   freedom).
//! - Chains are periodically **consolidated** back into fresh base nodes;
//!   replaced records are reclaimed through epochs, which also closes the
//!   ABA window on slot CAS.
//!
//! ## Consistency
//!
//! Point lookups, inserts, and removes are linearizable. Range scans are
//! snapshots per leaf: ascending, duplicate-free, with no ordering
//! guarantee across leaves under concurrent updates.
//!
//! ## Example
//!
//! ```
//! use bwtree::{BwTree, BwTreeConfig};
//!
//! let tree: BwTree<u64, &str> = BwTree::new(BwTreeConfig::default());
//!
//! tree.insert(3, "b").unwrap();
//! tree.insert(5, "a").unwrap();
//!
//! assert_eq!(tree.lookup(&3), Some("b"));
//! assert_eq!(tree.scan(..).count(), 2);
//! ```

pub mod bound;
pub mod config;
pub mod mapping;
pub mod tree;

pub(crate) mod epoch;
pub(crate) mod node;
pub(crate) mod ordering;
pub(crate) mod tracing_helpers;

pub use bound::BoundKey;
pub use config::{BwTreeConfig, ConfigError};
pub use mapping::{INVALID_NODE_ID, MappingTableFull, NodeId};
pub use tree::{BwTree, InsertError, RemoveError, Scan};
