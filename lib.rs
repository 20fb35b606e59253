//! Ferrovisor P2M - guest-physical to host-physical translation
//!
//! This library implements the physical-to-machine (P2M) layer of the
//! Ferrovisor hypervisor: for every virtual machine it tracks which host
//! frame backs each guest frame, the type of object occupying it and the
//! access permissions that apply.
//!
//! The crate is organised as:
//! - `mm` - frame identifiers, the paging-structure frame pool and a
//!   software G-stage backend
//! - `p2m` - translation tables, range locks, log-dirty tracking, nested
//!   and alternate views, physmap glue and the per-domain control surface
//! - `config` - per-domain P2M configuration
//! - `sync` / `utils` - locking primitives and small data structures

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Core modules
pub mod config;
pub mod sync;
pub mod utils;

// Memory management
pub mod mm;

// Translation layer
pub mod p2m;

pub use config::P2mConfig;
pub use mm::{DomainId, Gfn, Mfn, PAGE_ORDER_1G, PAGE_ORDER_2M, PAGE_ORDER_4K};
pub use p2m::{
    P2mAccess, P2mDomain, P2mEntry, P2mEnv, P2mTable, P2mType, Progress, QueryFlags,
    TypedSetOutcome, ViewId, ViewKind,
};

/// Ferrovisor P2M version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the translation layer
///
/// There is no global state to set up; this only announces the layer so
/// boot logs show which P2M implementation is linked in.
pub fn init() -> Result<()> {
    log::info!("Ferrovisor P2M v{} initialized", VERSION);
    Ok(())
}

/// Common error type for the translation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument,
    /// No free paging-structure frame
    OutOfMemory,
    /// No free nested or alternate view slot
    NoFreeSlot,
    /// Not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Resource busy
    Busy,
    /// Transient race, the caller may retry
    Retry,
    /// Entries do not match the expected host frames
    Sequence,
    /// Invalid state
    InvalidState,
    /// The owning domain has been crashed
    DomainCrashed,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::InvalidArgument => "invalid argument",
            Error::OutOfMemory => "out of paging memory",
            Error::NoFreeSlot => "no free view slot",
            Error::NotFound => "not found",
            Error::PermissionDenied => "permission denied",
            Error::Busy => "resource busy",
            Error::Retry => "transient contention, retry",
            Error::Sequence => "entry does not match expected frame",
            Error::InvalidState => "invalid state",
            Error::DomainCrashed => "domain crashed",
        };
        f.write_str(msg)
    }
}

/// Result type for the translation layer
pub type Result<T> = core::result::Result<T, Error>;
