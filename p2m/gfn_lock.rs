//! Guest frame range locks
//!
//! Mutual exclusion over aligned ranges of guest frames, layered above the
//! table lock. Anyone doing a read-then-conditionally-write sequence on a
//! range holds its range lock across both steps. Locks are owned by a
//! holder id (the executing CPU) and nest: a holder may lock a range that
//! overlaps ranges it already holds, and must unlock every acquisition.

use crate::sync::{cpu_relax, CpuId, SpinLock};
use crate::order_mask;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeldRange {
    first: u64,
    last: u64,
    holder: CpuId,
}

impl HeldRange {
    fn overlaps(&self, first: u64, last: u64) -> bool {
        self.first <= last && first <= self.last
    }
}

/// Aligned range covering `gfn` at `order`
fn aligned_range(gfn: u64, order: u32) -> (u64, u64) {
    let first = gfn & !order_mask!(order);
    (first, first + order_mask!(order))
}

/// Per-view range lock table
#[derive(Debug, Default)]
pub struct GfnLockManager {
    held: SpinLock<Vec<HeldRange>>,
}

impl GfnLockManager {
    /// Create an empty lock table
    pub const fn new() -> Self {
        Self { held: SpinLock::new(Vec::new()) }
    }

    /// Lock the `order`-aligned range containing `gfn`
    ///
    /// Spins while another holder owns an overlapping range.
    pub fn lock(&self, holder: CpuId, gfn: u64, order: u32) {
        let (first, last) = aligned_range(gfn, order);
        loop {
            {
                let mut held = self.held.lock();
                let contended = held
                    .iter()
                    .any(|r| r.holder != holder && r.overlaps(first, last));
                if !contended {
                    held.push(HeldRange { first, last, holder });
                    return;
                }
            }
            cpu_relax();
        }
    }

    /// Try to lock without spinning
    pub fn try_lock(&self, holder: CpuId, gfn: u64, order: u32) -> bool {
        let (first, last) = aligned_range(gfn, order);
        let mut held = self.held.lock();
        if held.iter().any(|r| r.holder != holder && r.overlaps(first, last)) {
            return false;
        }
        held.push(HeldRange { first, last, holder });
        true
    }

    /// Release one acquisition of the range
    ///
    /// # Panics
    ///
    /// Panics if `holder` does not hold exactly this range.
    pub fn unlock(&self, holder: CpuId, gfn: u64, order: u32) {
        let (first, last) = aligned_range(gfn, order);
        let mut held = self.held.lock();
        let pos = held
            .iter()
            .rposition(|r| r.holder == holder && r.first == first && r.last == last);
        match pos {
            Some(pos) => {
                held.remove(pos);
            }
            None => panic!(
                "cpu {} unlocking gfn range {:#x}-{:#x} it does not hold",
                holder, first, last
            ),
        }
    }

    /// Whether `holder` holds a range covering `gfn`
    pub fn is_locked_by(&self, holder: CpuId, gfn: u64) -> bool {
        self.held
            .lock()
            .iter()
            .any(|r| r.holder == holder && r.first <= gfn && gfn <= r.last)
    }

    /// Whether any holder holds a range covering `gfn`
    pub fn is_locked(&self, gfn: u64) -> bool {
        self.held.lock().iter().any(|r| r.first <= gfn && gfn <= r.last)
    }

    /// Lock a range for the lifetime of the returned guard
    pub fn lock_range(&self, holder: CpuId, gfn: u64, order: u32) -> GfnRangeGuard<'_> {
        self.lock(holder, gfn, order);
        GfnRangeGuard { locks: self, holder, gfn, order }
    }
}

/// Scoped range lock
#[must_use = "the range is unlocked when the guard is dropped"]
pub struct GfnRangeGuard<'a> {
    locks: &'a GfnLockManager,
    holder: CpuId,
    gfn: u64,
    order: u32,
}

impl GfnRangeGuard<'_> {
    /// Holder of the lock
    pub fn holder(&self) -> CpuId {
        self.holder
    }
}

impl Drop for GfnRangeGuard<'_> {
    fn drop(&mut self) {
        self.locks.unlock(self.holder, self.gfn, self.order);
    }
}
