//! Integer range sets
//!
//! A sorted set of disjoint, non-adjacent inclusive ranges. Adjacent or
//! overlapping insertions are coalesced, so the representation of a given
//! set of integers is unique.

use alloc::vec::Vec;
use core::ops::RangeInclusive;
use num_traits::PrimInt;

/// Set of inclusive integer ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet<T: PrimInt> {
    /// Disjoint ranges sorted by start, `(first, last)` inclusive
    ranges: Vec<(T, T)>,
}

impl<T: PrimInt> Default for RangeSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PrimInt> RangeSet<T> {
    /// Create an empty range set
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Check whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Remove every range
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Iterate over the ranges in ascending order
    pub fn iter(&self) -> impl Iterator<Item = RangeInclusive<T>> + '_ {
        self.ranges.iter().map(|&(s, e)| s..=e)
    }

    /// Add `[first, last]` to the set
    ///
    /// Adding integers that are already present is a no-op.
    pub fn add_range(&mut self, first: T, last: T) {
        if first > last {
            return;
        }

        let mut first = first;
        let mut last = last;

        // Index of the first range that ends at or after `first - 1`.
        let start_idx = self.ranges.partition_point(|&(_, e)| {
            e < first && e.checked_add(&T::one()).map_or(true, |n| n < first)
        });

        let mut end_idx = start_idx;
        while end_idx < self.ranges.len() {
            let (s, e) = self.ranges[end_idx];
            let touches = match last.checked_add(&T::one()) {
                Some(next) => s <= next,
                None => true,
            };
            if !touches {
                break;
            }
            first = first.min(s);
            last = last.max(e);
            end_idx += 1;
        }

        self.ranges.splice(start_idx..end_idx, [(first, last)]);
    }

    /// Remove `[first, last]` from the set
    ///
    /// Removing integers that are not present is a no-op.
    pub fn remove_range(&mut self, first: T, last: T) {
        if first > last {
            return;
        }

        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e < first || s > last {
                kept.push((s, e));
                continue;
            }
            if s < first {
                kept.push((s, first - T::one()));
            }
            if e > last {
                kept.push((last + T::one(), e));
            }
        }
        self.ranges = kept;
    }

    /// Check whether every integer of `[first, last]` is in the set
    pub fn contains_range(&self, first: T, last: T) -> bool {
        if first > last {
            return false;
        }
        let idx = self.ranges.partition_point(|&(_, e)| e < first);
        self.ranges
            .get(idx)
            .map_or(false, |&(s, e)| s <= first && last <= e)
    }

    /// Check whether any integer of `[first, last]` is in the set
    pub fn overlaps_range(&self, first: T, last: T) -> bool {
        if first > last {
            return false;
        }
        let idx = self.ranges.partition_point(|&(_, e)| e < first);
        self.ranges.get(idx).map_or(false, |&(s, _)| s <= last)
    }

    /// Check whether a single integer is in the set
    pub fn contains(&self, value: T) -> bool {
        self.contains_range(value, value)
    }

    /// Add every range of `other` to this set
    pub fn merge(&mut self, other: &RangeSet<T>) {
        for &(s, e) in &other.ranges {
            self.add_range(s, e);
        }
    }
}
