use core::cmp::Ordering;
use indexmap::IndexMap as _IndexMap;
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

/// Presentation timestamp of a frame.
///
/// Timestamps are opaque 64-bit values supplied by the caller. They are
/// compared with wrap-around semantics (see [`compare_timestamps`]) so a
/// stream may run past `u64::MAX` without reordering.
pub type Timestamp = u64;

/// Maximum number of image planes a picture or frame carries.
pub const MAX_PLANES: usize = 3;

/// Number of levels of quality in the upscale cascade (LOQ0, LOQ1, LOQ2).
pub const NUM_LOQS: usize = 3;

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;

/// Orders two timestamps by their signed distance.
///
/// `lhs` is later than `rhs` when `lhs - rhs`, taken modulo 2^64 and read as
/// a signed value, is positive.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn compare_timestamps(lhs: Timestamp, rhs: Timestamp) -> Ordering {
    (lhs.wrapping_sub(rhs) as i64).cmp(&0)
}

/// Index of a level of quality in the cascade.
///
/// `Loq0` is the output resolution, `Loq2` the base resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub enum Loq {
    /// Output resolution.
    #[display("LOQ0")]
    Loq0 = 0,
    /// Intermediate resolution.
    #[display("LOQ1")]
    Loq1 = 1,
    /// Base resolution.
    #[display("LOQ2")]
    Loq2 = 2,
}

impl Loq {
    /// Position of this level in per-LOQ arrays.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_compare_across_wrap() {
        assert_eq!(compare_timestamps(11, 10), Ordering::Greater);
        assert_eq!(compare_timestamps(10, 11), Ordering::Less);
        assert_eq!(compare_timestamps(7, 7), Ordering::Equal);
        assert_eq!(compare_timestamps(2, u64::MAX - 1), Ordering::Greater);
        assert_eq!(compare_timestamps(u64::MAX, 0), Ordering::Less);
    }
}
