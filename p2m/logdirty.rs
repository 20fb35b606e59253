//! Log-dirty range tracking
//!
//! Records which guest frames have been retyped read-only for live
//! migration, either per range or globally for the whole view, and the
//! domain level controls that retype the host view and every active
//! alternate view together.

use crate::p2m::{P2mDomain, P2mType, Progress};
use crate::utils::{Preempt, RangeSet};
use crate::{Error, Result};
use core::ops::Range;

/// Tri-state answer of [`LogDirtyTracker::is_logdirty_range`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirtyState {
    /// No frame of the range is tracked
    Untracked,
    /// Every frame of the range is tracked
    Tracked,
    /// Some frames are tracked; treat as possibly dirty
    Partial,
}

impl LogDirtyState {
    /// Conventional integer form: 1, 0 or -1
    pub const fn as_raw(self) -> i32 {
        match self {
            LogDirtyState::Tracked => 1,
            LogDirtyState::Untracked => 0,
            LogDirtyState::Partial => -1,
        }
    }
}

/// Per-view log-dirty state
///
/// Ranges are half-open guest frame ranges. Adding tracked frames or
/// removing untracked ones is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogDirtyTracker {
    ranges: RangeSet<u64>,
    global: bool,
}

impl LogDirtyTracker {
    /// Create a tracker with nothing tracked
    pub const fn new() -> Self {
        Self { ranges: RangeSet::new(), global: false }
    }

    /// Create a tracker with a copy of `ranges`
    pub fn from_ranges(ranges: &RangeSet<u64>) -> Self {
        Self { ranges: ranges.clone(), global: false }
    }

    /// Every frame counts as tracked
    pub fn is_global(&self) -> bool {
        self.global
    }

    /// Set or clear whole-view tracking
    pub fn set_global(&mut self, global: bool) {
        self.global = global;
    }

    /// Tracked ranges
    pub fn ranges(&self) -> &RangeSet<u64> {
        &self.ranges
    }

    /// Start tracking `range`
    pub fn track(&mut self, range: Range<u64>) {
        if range.start < range.end {
            self.ranges.add_range(range.start, range.end - 1);
        }
    }

    /// Stop tracking `range`
    pub fn untrack(&mut self, range: Range<u64>) {
        if range.start < range.end {
            self.ranges.remove_range(range.start, range.end - 1);
        }
    }

    /// Forget every tracked range
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Whether `range` is tracked
    pub fn is_logdirty_range(&self, range: Range<u64>) -> LogDirtyState {
        if self.global {
            return LogDirtyState::Tracked;
        }
        if range.start >= range.end {
            return LogDirtyState::Untracked;
        }

        let (first, last) = (range.start, range.end - 1);
        if self.ranges.contains_range(first, last) {
            LogDirtyState::Tracked
        } else if self.ranges.overlaps_range(first, last) {
            LogDirtyState::Partial
        } else {
            LogDirtyState::Untracked
        }
    }
}

impl P2mDomain {
    /// Retype `old` frames in `gfns` to `new` in every view
    ///
    /// The host view goes first, then each active alternate view, all
    /// clipped to the host view's highest mapped frame. Nested views are
    /// flushed once at the end instead of on every host change. A backend
    /// failure leaves types and dirty ranges out of step, so the domain is
    /// crashed.
    pub fn change_type_range(&self, gfns: Range<u64>, old: P2mType, new: P2mType) -> Result<()> {
        if old == new || !old.is_changeable() || !new.is_changeable() {
            return Err(Error::InvalidArgument);
        }
        if gfns.start >= gfns.end {
            return Ok(());
        }
        let (first, last) = (gfns.start, gfns.end - 1);

        let mut host = self.host().lock_write();
        host.set_defer_nested_flush(true);

        let host_max = host.max_mapped_gfn();
        let mut result = host.change_type_range(old, new, first, last, host_max);

        if self.altp2m_active() {
            self.altp2m.for_each_active(|table| {
                let r = table.lock_write().change_type_range(old, new, first, last, host_max);
                if result.is_ok() {
                    result = r;
                }
            });
        }

        host.set_defer_nested_flush(false);
        if self.config().nested_virt {
            self.flush_nested_all();
        }
        drop(host);

        result.map_err(|_| {
            self.crash();
            Error::DomainCrashed
        })
    }

    /// Retype every `old` frame to `new` in the host and active alternate views
    ///
    /// Whole-view log-dirty tracking follows `new` whenever the types
    /// differ; `old == new` only refreshes the entries.
    pub fn change_entry_type_global(&self, old: P2mType, new: P2mType) -> Result<()> {
        if !old.is_changeable() || !new.is_changeable() {
            return Err(Error::InvalidArgument);
        }

        let mut host = self.host().lock_write();
        let mut result = host.change_type_global(old, new);

        if self.altp2m_active() {
            self.altp2m.for_each_active(|table| {
                let r = table.lock_write().change_type_global(old, new);
                if result.is_ok() {
                    result = r;
                }
            });
        }

        if old != new && self.config().nested_virt {
            self.flush_nested_all();
        }
        result
    }

    /// Start tracking writes to every frame of the domain
    pub fn enable_logdirty(&self) -> Result<()> {
        log::info!("d{}: log-dirty enabled", self.id());
        self.change_entry_type_global(P2mType::RamRw, P2mType::RamLogdirty)
    }

    /// Stop whole-domain write tracking
    ///
    /// Ranges tracked with [`P2mDomain::change_type_range`] stay tracked.
    pub fn disable_logdirty(&self) -> Result<()> {
        log::info!("d{}: log-dirty disabled", self.id());
        self.change_entry_type_global(P2mType::RamLogdirty, P2mType::RamRw)
    }

    /// Copy of the host view's log-dirty state
    pub fn logdirty_snapshot(&self) -> LogDirtyTracker {
        self.host().lock_read().logdirty().cloned().unwrap_or_default()
    }

    /// Whether `gfns` is tracked in the host view
    pub fn is_logdirty_range(&self, gfns: Range<u64>) -> LogDirtyState {
        match self.host().lock_read().logdirty() {
            Some(logdirty) => logdirty.is_logdirty_range(gfns),
            None => LogDirtyState::Untracked,
        }
    }

    /// Retype every tracked range from frame `start` on back to `ram_rw`
    ///
    /// Checks `preempt` after each range; on preemption `next` is the frame
    /// to resume from.
    pub fn clear_logdirty_ranges(&self, start: u64, preempt: &dyn Preempt) -> Result<Progress> {
        let snapshot = self.logdirty_snapshot();
        let mut ranges = snapshot
            .ranges()
            .iter()
            .filter(|r| *r.end() >= start)
            .map(|r| (*r.start()).max(start)..*r.end() + 1)
            .peekable();

        while let Some(range) = ranges.next() {
            let next = range.end;
            self.change_type_range(range, P2mType::RamLogdirty, P2mType::RamRw)?;
            if ranges.peek().is_some() && preempt.should_yield() {
                return Ok(Progress::Preempted { next });
            }
        }

        Ok(Progress::Done)
    }
}
