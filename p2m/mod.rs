//! Physical-to-machine translation
//!
//! A domain owns one host view (the ground truth guest-frame to host-frame
//! mapping), a small pool of nested views caching second-level translations
//! for nested virtualization, and a set of alternate views that may diverge
//! from the host view per virtual CPU. Every view is a [`P2mTable`] driving
//! a [`P2mBackend`] that encodes the actual paging structures.
//!
//! Lock order, outermost first: guest frame range lock, host table, alternate
//! list, alternate table. The nested list lock is taken before a nested table.

use crate::mm::{DomainId, Mfn, PAGE_ORDER_1G};
use crate::{Error, Result};
use bitflags::bitflags;
use core::fmt;

pub mod altp2m;
pub mod backend;
pub mod domain;
pub mod env;
pub mod gfn_lock;
pub mod logdirty;
pub mod nested;
pub mod physmap;
pub mod registry;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use altp2m::{AltLookup, AltVcpu};
pub use backend::{BackendCaps, P2mBackend, Paging};
pub use domain::{P2mDomain, VcpuP2m};
pub use env::{FrameOwner, IommuFlags, MappingObserver, MemSharing, P2mEnv, PageOwnership};
pub use gfn_lock::{GfnLockManager, GfnRangeGuard};
pub use logdirty::{LogDirtyState, LogDirtyTracker};
pub use nested::{NestedVcpu, ScheduleDir};
pub use physmap::GfnRef;
pub use registry::DomainRegistry;
pub use table::{EntrySource, P2mReadGuard, P2mReader, P2mTable, P2mWriteGuard, TableState};

/// Type of the object occupying a guest frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum P2mType {
    /// Nothing mapped
    Invalid = 0,
    /// Normal read/write guest RAM
    RamRw = 1,
    /// Read-only RAM tracked for live migration
    RamLogdirty = 2,
    /// Read-only RAM
    RamRo = 3,
    /// Shared copy-on-write RAM
    RamShared = 4,
    /// RAM being paged back in
    RamPagingIn = 5,
    /// RAM selected to be paged out
    RamPagingOut = 6,
    /// RAM paged out, no backing frame
    RamPaged = 7,
    /// Backed lazily on first touch
    PopulateOnDemand = 8,
    /// Directly mapped device memory
    MmioDirect = 9,
    /// Emulated by the device model
    MmioDm = 10,
    /// Frame owned by another domain
    MapForeign = 11,
    /// Grant table mapping
    Grant = 12,
    /// Hardware reported memory error
    Broken = 13,
}

impl P2mType {
    /// All types, in encoding order
    pub const ALL: [P2mType; 14] = [
        P2mType::Invalid,
        P2mType::RamRw,
        P2mType::RamLogdirty,
        P2mType::RamRo,
        P2mType::RamShared,
        P2mType::RamPagingIn,
        P2mType::RamPagingOut,
        P2mType::RamPaged,
        P2mType::PopulateOnDemand,
        P2mType::MmioDirect,
        P2mType::MmioDm,
        P2mType::MapForeign,
        P2mType::Grant,
        P2mType::Broken,
    ];

    /// Decode a type from its encoding
    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Encoding of the type
    pub const fn raw(self) -> u8 {
        self as u8
    }

    /// May take part in bulk global/range retype operations
    pub const fn is_changeable(self) -> bool {
        matches!(
            self,
            P2mType::RamRw
                | P2mType::RamLogdirty
                | P2mType::RamPagingIn
                | P2mType::RamPagingOut
                | P2mType::RamPaged
        )
    }

    /// Installed and removed only through dedicated entry points
    pub const fn is_special(self) -> bool {
        matches!(self, P2mType::MapForeign | P2mType::Grant | P2mType::MmioDirect)
    }

    /// Guest RAM of any flavour
    pub const fn is_ram(self) -> bool {
        matches!(
            self,
            P2mType::RamRw
                | P2mType::RamLogdirty
                | P2mType::RamRo
                | P2mType::RamShared
                | P2mType::RamPagingIn
                | P2mType::RamPagingOut
                | P2mType::RamPaged
        )
    }

    /// Paging in progress or paged out
    pub const fn is_paging(self) -> bool {
        matches!(self, P2mType::RamPagingIn | P2mType::RamPagingOut | P2mType::RamPaged)
    }

    /// Paged out
    pub const fn is_paged(self) -> bool {
        matches!(self, P2mType::RamPaged)
    }

    /// Nothing the guest can use is mapped
    pub const fn is_hole(self) -> bool {
        matches!(self, P2mType::Invalid | P2mType::MmioDm)
    }

    /// Device memory
    pub const fn is_mmio(self) -> bool {
        matches!(self, P2mType::MmioDirect | P2mType::MmioDm)
    }

    /// Shared copy-on-write RAM
    pub const fn is_shared(self) -> bool {
        matches!(self, P2mType::RamShared)
    }

    /// Populate-on-demand placeholder
    pub const fn is_pod(self) -> bool {
        matches!(self, P2mType::PopulateOnDemand)
    }

    /// Foreign mapping
    pub const fn is_foreign(self) -> bool {
        matches!(self, P2mType::MapForeign)
    }

    /// Grant mapping
    pub const fn is_grant(self) -> bool {
        matches!(self, P2mType::Grant)
    }

    /// Hardware reported memory error
    pub const fn is_broken(self) -> bool {
        matches!(self, P2mType::Broken)
    }

    /// Backed by a real frame that must match on removal
    pub const fn is_valid(self) -> bool {
        self.is_ram() || self.is_mmio() || self.is_foreign() || self.is_grant()
    }

    /// RAM, grant or foreign memory
    pub const fn is_any_ram(self) -> bool {
        self.is_ram() || self.is_grant() || self.is_foreign()
    }

    /// Guest cannot write the frame directly
    pub const fn is_readonly(self) -> bool {
        matches!(self, P2mType::RamRo | P2mType::RamLogdirty | P2mType::RamShared)
    }
}

/// Access permissions of a guest frame, orthogonal to its type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum P2mAccess {
    /// No access
    N = 0,
    /// Read
    R = 1,
    /// Write
    W = 2,
    /// Read and write
    Rw = 3,
    /// Execute
    X = 4,
    /// Read and execute
    Rx = 5,
    /// Write and execute
    Wx = 6,
    /// Read, write and execute
    Rwx = 7,
    /// Whatever the view's default access is
    Default = 8,
}

impl P2mAccess {
    /// Decode an access value from its encoding
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => P2mAccess::N,
            1 => P2mAccess::R,
            2 => P2mAccess::W,
            3 => P2mAccess::Rw,
            4 => P2mAccess::X,
            5 => P2mAccess::Rx,
            6 => P2mAccess::Wx,
            7 => P2mAccess::Rwx,
            8 => P2mAccess::Default,
            _ => return None,
        })
    }

    /// Encoding of the access value
    pub const fn raw(self) -> u8 {
        self as u8
    }

    /// Replace the `Default` sentinel with a concrete access value
    pub const fn resolve(self, default: P2mAccess) -> P2mAccess {
        match self {
            P2mAccess::Default => default,
            a => a,
        }
    }

    /// Read permitted
    pub const fn readable(self) -> bool {
        !matches!(self, P2mAccess::Default) && self as u8 & 1 != 0
    }

    /// Write permitted
    pub const fn writable(self) -> bool {
        !matches!(self, P2mAccess::Default) && self as u8 & 2 != 0
    }

    /// Execute permitted
    pub const fn executable(self) -> bool {
        !matches!(self, P2mAccess::Default) && self as u8 & 4 != 0
    }
}

bitflags! {
    /// Side effects a lookup may perform
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        /// Populate holes (fork from the parent, populate-on-demand)
        const ALLOC = 1 << 0;
        /// Break copy-on-write sharing
        const UNSHARE = 1 << 1;
    }
}

/// Result of a lookup
///
/// `mfn` is the host frame backing the looked-up guest frame itself, even
/// when the entry is a superpage; `order` is the order of the mapping that
/// contains it (for holes, of the unmapped region the backend found).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct P2mEntry {
    /// Backing host frame, `None` for an invalid MFN
    pub mfn: Option<Mfn>,
    /// Type of the frame
    pub p2m_type: P2mType,
    /// Access permissions
    pub access: P2mAccess,
    /// Order of the containing mapping
    pub order: u32,
}

impl P2mEntry {
    /// An unmapped region of the given order
    pub const fn hole(order: u32) -> Self {
        Self {
            mfn: None,
            p2m_type: P2mType::Invalid,
            access: P2mAccess::N,
            order,
        }
    }

    /// Whether a host frame backs the entry
    pub const fn is_present(&self) -> bool {
        self.mfn.is_some()
    }
}

/// Outcome of a preemptible or capped bulk operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// All work done
    Done,
    /// Stopped early, call again starting at `next`
    Preempted {
        /// Resumption cursor
        next: u64,
    },
}

/// Outcome of a typed single-entry update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedSetOutcome {
    /// Entry installed
    Done,
    /// Existing mappings are finer grained, retry with this order
    RetryWithOrder(u32),
}

/// Which flavour of view a table is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// The domain's primary view
    Host,
    /// Nested view slot
    Nested(u8),
    /// Alternate view slot
    Alternate(u8),
}

/// Identity of one view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId {
    /// Owning domain
    pub domain: DomainId,
    /// Kind of view
    pub kind: ViewKind,
}

impl ViewId {
    /// Host view of `domain`
    pub const fn host(domain: DomainId) -> Self {
        Self { domain, kind: ViewKind::Host }
    }

    /// Whether this is a host view
    pub const fn is_host(&self) -> bool {
        matches!(self.kind, ViewKind::Host)
    }

    /// Whether this is a nested view
    pub const fn is_nested(&self) -> bool {
        matches!(self.kind, ViewKind::Nested(_))
    }

    /// Whether this is an alternate view
    pub const fn is_alternate(&self) -> bool {
        matches!(self.kind, ViewKind::Alternate(_))
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ViewKind::Host => write!(f, "d{}", self.domain),
            ViewKind::Nested(i) => write!(f, "d{}.np2m{}", self.domain, i),
            ViewKind::Alternate(i) => write!(f, "d{}.altp2m{}", self.domain, i),
        }
    }
}

/// Reject mapping orders larger than a 1G superpage
pub(crate) fn check_order(order: u32) -> Result<()> {
    if order > PAGE_ORDER_1G {
        log::warn!("order {} exceeds the largest mapping size", order);
        return Err(Error::InvalidArgument);
    }
    Ok(())
}
