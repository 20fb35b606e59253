//! Collaborator interfaces
//!
//! The translation layer depends on a handful of subsystems it does not
//! implement: the page ownership and reference-count tracker with its
//! machine-to-phys table, memory sharing and fork population, and the IOMMU
//! layer that mirrors CPU-side mappings. [`P2mEnv`] bundles them for a domain.

use crate::mm::{DomainId, Gfn, Mfn, PagingPool};
use crate::p2m::P2mBackend;
use crate::sync::CpuId;
use crate::Result;
use alloc::sync::Arc;
use bitflags::bitflags;

/// Owner of a host frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOwner {
    /// Owned by a domain
    Domain(DomainId),
    /// Owned by the copy-on-write sharing subsystem
    Cow,
}

/// Page ownership, reference counts and the machine-to-phys table
pub trait PageOwnership: Send + Sync {
    /// Current owner of `mfn`
    fn owner(&self, mfn: Mfn) -> Option<FrameOwner>;

    /// Take a reference on `mfn` if it is owned by `owner`
    fn get_page(&self, mfn: Mfn, owner: FrameOwner) -> bool;

    /// Drop a reference taken with [`PageOwnership::get_page`]
    fn put_page(&self, mfn: Mfn);

    /// Guest frame `mfn` is recorded at in the machine-to-phys table
    fn gfn_of(&self, mfn: Mfn) -> Option<Gfn>;

    /// Update the machine-to-phys table
    fn set_gfn_of(&self, mfn: Mfn, gfn: Option<Gfn>);

    /// Whether `mfn` belongs to the copy-on-write owner
    fn is_cow(&self, mfn: Mfn) -> bool {
        self.owner(mfn) == Some(FrameOwner::Cow)
    }
}

/// Memory sharing and fork population
pub trait MemSharing: Send + Sync {
    /// Break sharing of `gfn`, giving the domain a private copy
    fn unshare(&self, domain: DomainId, cpu: CpuId, gfn: Gfn) -> Result<()>;

    /// Populate a hole in a forked domain from its parent
    fn fork_page(&self, domain: DomainId, cpu: CpuId, gfn: Gfn, unsharing: bool) -> Result<()>;

    /// Report that unsharing failed for lack of memory
    fn notify_enomem(&self, domain: DomainId, gfn: Gfn, can_sleep: bool);
}

bitflags! {
    /// DMA permissions derived from a P2M entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IommuFlags: u32 {
        /// Device may read
        const READ = 1 << 0;
        /// Device may write
        const WRITE = 1 << 1;
    }
}

/// Receiver of host view changes, typically the IOMMU layer
pub trait MappingObserver: Send + Sync {
    /// The host mapping of `[gfn, gfn + 2^order)` changed
    ///
    /// Empty `flags` means the range is no longer DMA accessible.
    fn p2m_entry_changed(
        &self,
        domain: DomainId,
        gfn: Gfn,
        mfn: Option<Mfn>,
        order: u32,
        flags: IommuFlags,
    );
}

fn boot_cpu() -> CpuId {
    0
}

/// Collaborators of one domain's translation layer
#[derive(Clone)]
pub struct P2mEnv {
    /// Entry encoder for every view of the domain
    pub backend: Arc<dyn P2mBackend>,
    /// Frames for paging structures
    pub pool: Arc<dyn PagingPool>,
    /// Page ownership and machine-to-phys table
    pub ownership: Arc<dyn PageOwnership>,
    /// Memory sharing, if the domain uses it
    pub sharing: Option<Arc<dyn MemSharing>>,
    /// Host view change observer
    pub observer: Option<Arc<dyn MappingObserver>>,
    /// Identifier of the executing CPU, used as the range lock holder
    pub current_cpu: fn() -> CpuId,
}

impl P2mEnv {
    /// Create an environment without sharing or observer
    pub fn new(
        backend: Arc<dyn P2mBackend>,
        pool: Arc<dyn PagingPool>,
        ownership: Arc<dyn PageOwnership>,
    ) -> Self {
        Self {
            backend,
            pool,
            ownership,
            sharing: None,
            observer: None,
            current_cpu: boot_cpu,
        }
    }

    /// Attach a memory sharing collaborator
    pub fn with_sharing(mut self, sharing: Arc<dyn MemSharing>) -> Self {
        self.sharing = Some(sharing);
        self
    }

    /// Attach a host view change observer
    pub fn with_observer(mut self, observer: Arc<dyn MappingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Use `current_cpu` to identify range lock holders
    pub fn with_cpu_id(mut self, current_cpu: fn() -> CpuId) -> Self {
        self.current_cpu = current_cpu;
        self
    }
}
