//! Filepath: src/bound.rs
//!
//! Node range bounds with infinite sentinels.
//!
//! Every virtual node covers a half-open key range `[low, high)`. The
//! leftmost node's low bound and the rightmost node's high bound are
//! infinite, so bounds are a sum type rather than a bare key: the derived
//! ordering (`NegInf < Key(_) < PosInf`) gives the sentinels their
//! comparison semantics with no special-casing at use sites.
//!
//! Inner separator arrays use [`BoundKey`] as their key type directly: the
//! first separator's key equals the node's low bound, which is `NegInf` in
//! the leftmost inner node of each level.

use std::cmp::Ordering;
use std::fmt as StdFmt;

// ============================================================================
//  BoundKey
// ============================================================================

/// A key extended with `-inf` / `+inf` sentinels.
///
/// Low bounds are inclusive and never `PosInf`; high bounds are exclusive
/// and never `NegInf`. The variant order is load-bearing: the derived
/// `Ord` must sort `NegInf` below every `Key` and `PosInf` above.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BoundKey<K> {
    /// Smaller than every key. Low bound of the leftmost node.
    NegInf,

    /// A concrete, finite key.
    Key(K),

    /// Larger than every key. High bound of the rightmost node.
    PosInf,
}

impl<K: Ord> BoundKey<K> {
    /// Check whether this bound is one of the infinite sentinels.
    #[inline]
    #[must_use]
    pub const fn is_infinite(&self) -> bool {
        !matches!(self, Self::Key(_))
    }

    /// Compare this bound against a finite key.
    ///
    /// `NegInf` is strictly less and `PosInf` strictly greater than every
    /// finite key.
    #[inline]
    pub fn cmp_key(&self, key: &K) -> Ordering {
        match self {
            Self::NegInf => Ordering::Less,

            Self::Key(k) => k.cmp(key),

            Self::PosInf => Ordering::Greater,
        }
    }

    /// Treating `self` as an inclusive low bound, does the range admit `key`?
    #[inline]
    pub fn admits_low(&self, key: &K) -> bool {
        self.cmp_key(key) != Ordering::Greater
    }

    /// Treating `self` as an exclusive high bound, does the range admit `key`?
    #[inline]
    pub fn admits_high(&self, key: &K) -> bool {
        self.cmp_key(key) == Ordering::Greater
    }

    /// Get the finite key, if any.
    #[inline]
    #[must_use]
    pub const fn as_key(&self) -> Option<&K> {
        match self {
            Self::Key(k) => Some(k),

            _ => None,
        }
    }
}

impl<K: StdFmt::Debug> StdFmt::Debug for BoundKey<K> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::NegInf => write!(f, "-inf"),

            Self::Key(k) => write!(f, "{k:?}"),

            Self::PosInf => write!(f, "+inf"),
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
