//! Standard memory orderings for mapping-table and chain access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for loading a mapping slot or the root ID.
/// Pairs with the Release half of a successful CAS.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing a record into a freshly allocated slot.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success on a mapping slot or the root ID.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for relaxed loads and counter updates.
/// Safe for `next` links (immutable after publication) and statistics.
pub const RELAXED: Ordering = Ordering::Relaxed;
