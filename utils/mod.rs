//! Utility functions and data structures
//!
//! This module contains the small helpers used throughout the translation
//! layer: integer range sets and the preemption hook consulted by long
//! running bulk operations.

pub mod rangeset;

// Re-export commonly used utilities
pub use self::rangeset::RangeSet;

/// Preemption check consulted by long bulk operations
///
/// Returning `true` asks the operation to stop at the next frame boundary
/// and hand a resumption cursor back to its caller.
pub trait Preempt {
    /// Whether the current operation should yield
    fn should_yield(&self) -> bool;
}

impl<F: Fn() -> bool> Preempt for F {
    fn should_yield(&self) -> bool {
        self()
    }
}

/// Never preempt
pub struct NoPreempt;

impl Preempt for NoPreempt {
    fn should_yield(&self) -> bool {
        false
    }
}

/// Utility macros
#[macro_export]
macro_rules! order_mask {
    ($order:expr) => {
        ((1u64 << $order) - 1)
    };
}
