//! Synchronization primitives
//!
//! Spin-based locks usable in the hypervisor environment. Nothing in the
//! translation layer sleeps, so every lock here busy-waits.

pub use spin::{
    Mutex as SpinLock, MutexGuard as SpinLockGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

/// Identifier of the physical CPU (or other execution context) holding a lock
pub type CpuId = usize;

/// Number of physical CPUs a per-view dirty mask can describe
pub const MAX_CPUS: usize = 64;

/// Relax the CPU while spinning on a contended lock
#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop();
}
