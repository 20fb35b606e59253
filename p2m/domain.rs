//! Per-domain translation state
//!
//! [`P2mDomain`] owns the host view, the nested view pool, the alternate
//! view set and the per-vCPU view selectors of one virtual machine. The
//! operations on it are spread over the sibling modules: physmap glue in
//! `physmap`, nested views in `nested`, alternate views in `altp2m` and
//! log-dirty control in `logdirty`.

use crate::config::P2mConfig;
use crate::mm::{DomainId, Gfn, Mfn};
use crate::p2m::altp2m::AltP2mSet;
use crate::p2m::nested::NestedPool;
use crate::p2m::{
    check_order, AltVcpu, BackendCaps, IommuFlags, NestedVcpu, P2mAccess, P2mEnv, P2mTable, P2mType,
    P2mWriteGuard, ViewId,
};
use crate::sync::{CpuId, SpinLock};
use crate::{Error, Result};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

/// View selection state of one virtual CPU
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcpuP2m {
    /// Nested view bookkeeping
    pub nested: NestedVcpu,
    /// Alternate view selector
    pub alt: AltVcpu,
}

/// Translation state of one domain
pub struct P2mDomain {
    id: DomainId,
    config: P2mConfig,
    env: P2mEnv,
    host: P2mTable,
    pub(crate) nested: NestedPool,
    pub(crate) altp2m: AltP2mSet,
    vcpus: Vec<SpinLock<VcpuP2m>>,
    crashed: AtomicBool,
}

/// Superpage sizes a configuration allows
fn config_caps(config: &P2mConfig) -> BackendCaps {
    let mut caps = BackendCaps::empty();
    if config.hap_2mb {
        caps |= BackendCaps::SUPERPAGE_2M;
    }
    if config.hap_1gb {
        caps |= BackendCaps::SUPERPAGE_1G;
    }
    caps
}

impl P2mDomain {
    /// Create the translation state of domain `id`
    ///
    /// Allocates the host root, plus the nested and alternate view roots
    /// the configuration asks for. Everything allocated so far is returned
    /// to the pool if a later allocation fails.
    pub fn new(id: DomainId, config: P2mConfig, env: P2mEnv) -> Result<Self> {
        config.validate()?;
        let caps = config_caps(&config);

        let host = P2mTable::new(
            ViewId::host(id),
            env.backend.clone(),
            env.pool.clone(),
            config.default_access,
            caps,
        );
        host.lock_write().alloc_table()?;

        let nested = match NestedPool::new(id, &config, &env, caps) {
            Ok(nested) => nested,
            Err(e) => {
                host.lock_write().teardown();
                return Err(e);
            }
        };

        let altp2m = match AltP2mSet::new(id, &config, &env, caps) {
            Ok(altp2m) => altp2m,
            Err(e) => {
                nested.teardown();
                host.lock_write().teardown();
                return Err(e);
            }
        };

        let vcpus = (0..config.vcpus).map(|_| SpinLock::new(VcpuP2m::default())).collect();

        log::info!(
            "d{}: p2m created ({} vcpus, {} nested, {} altp2m, caps {:?})",
            id,
            config.vcpus,
            nested.len(),
            altp2m.len(),
            host.caps()
        );

        Ok(Self {
            id,
            config,
            env,
            host,
            nested,
            altp2m,
            vcpus,
            crashed: AtomicBool::new(false),
        })
    }

    /// Domain identifier
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// Configuration the domain was created with
    pub fn config(&self) -> &P2mConfig {
        &self.config
    }

    /// Collaborators of the domain
    pub fn env(&self) -> &P2mEnv {
        &self.env
    }

    /// Host view
    pub fn host(&self) -> &P2mTable {
        &self.host
    }

    /// Number of virtual CPUs
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub(crate) fn vcpu(&self, vcpu: usize) -> Result<&SpinLock<VcpuP2m>> {
        self.vcpus.get(vcpu).ok_or(Error::InvalidArgument)
    }

    pub(crate) fn vcpu_locks(&self) -> &[SpinLock<VcpuP2m>] {
        &self.vcpus
    }

    /// Copy of the view selection state of `vcpu`
    pub fn vcpu_state(&self, vcpu: usize) -> Result<VcpuP2m> {
        Ok(self.vcpu(vcpu)?.lock().clone())
    }

    pub(crate) fn current_cpu(&self) -> CpuId {
        (self.env.current_cpu)()
    }

    /// Terminate the domain after an unrecoverable inconsistency
    pub fn crash(&self) {
        if !self.crashed.swap(true, Ordering::AcqRel) {
            log::error!("d{}: domain crashed by the p2m layer", self.id);
        }
    }

    /// Whether the domain has been crashed
    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    /// DMA permissions for an entry of type `p2m_type` backed by `mfn`
    pub fn iommu_flags(&self, p2m_type: P2mType, mfn: Option<Mfn>) -> IommuFlags {
        match p2m_type {
            P2mType::RamRw | P2mType::RamLogdirty | P2mType::MapForeign | P2mType::Grant => {
                IommuFlags::READ | IommuFlags::WRITE
            }
            P2mType::RamRo => IommuFlags::READ,
            P2mType::MmioDirect => {
                let read_only = mfn.map_or(false, |m| self.config.mmio_ro_ranges.contains(m.raw()));
                if read_only {
                    IommuFlags::READ
                } else {
                    IommuFlags::READ | IommuFlags::WRITE
                }
            }
            _ => IommuFlags::empty(),
        }
    }

    /// Install an entry in the host view and fan the change out
    ///
    /// The IOMMU observer is told about the change, nested views derived
    /// from the host view are flushed if a present entry was replaced, and
    /// every active alternate view is brought in line. If the install fails
    /// part way, chunks already written stay in the host view and the whole
    /// range is invalidated everywhere else before the error is returned.
    pub fn host_set_entry(
        &self,
        p2m: &mut P2mWriteGuard<'_>,
        gfn: Gfn,
        mfn: Option<Mfn>,
        order: u32,
        p2m_type: P2mType,
        access: P2mAccess,
    ) -> Result<()> {
        debug_assert!(p2m.id().is_host());
        check_order(order)?;
        let access = access.resolve(p2m.default_access());

        if let Err(e) = p2m.set_entry(gfn, mfn, order, p2m_type, access) {
            log::warn!("{}: install at gfn {} order {} failed: {}", p2m.id(), gfn, order, e);
            self.invalidate_derived(gfn, order, access);
            return Err(e);
        }

        if self.config.iommu_sync {
            if let Some(observer) = &self.env.observer {
                let flags = self.iommu_flags(p2m_type, mfn);
                observer.p2m_entry_changed(self.id, gfn, mfn, order, flags);
            }
        }

        if p2m.flush_pending() && self.config.nested_virt && !p2m.defer_nested_flush() {
            self.flush_nested_all();
        }

        self.propagate_change(gfn, mfn, order, p2m_type, access)
    }

    /// Drop `[gfn, gfn + 2^order)` from every view derived from the host
    fn invalidate_derived(&self, gfn: Gfn, order: u32, access: P2mAccess) {
        if self.config.iommu_sync {
            if let Some(observer) = &self.env.observer {
                observer.p2m_entry_changed(self.id, gfn, None, order, IommuFlags::empty());
            }
        }
        if self.config.nested_virt {
            self.flush_nested_all();
        }
        if let Err(e) = self.propagate_change(gfn, None, order, P2mType::Invalid, access) {
            log::warn!("d{}: invalidating gfn {} in alternate views failed: {}", self.id, gfn, e);
        }
    }

    /// Install `[gfn, gfn + 2^order)` in the host view
    ///
    /// Takes the range lock and the host write lock; see
    /// [`P2mDomain::host_set_entry`] for the side effects.
    pub fn set_entry(
        &self,
        gfn: Gfn,
        mfn: Option<Mfn>,
        order: u32,
        p2m_type: P2mType,
        access: P2mAccess,
    ) -> Result<()> {
        check_order(order)?;
        let _range = self.host.gfn_locks().lock_range(self.current_cpu(), gfn.raw(), order);
        let mut p2m = self.host.lock_write();
        self.host_set_entry(&mut p2m, gfn, mfn, order, p2m_type, access)
    }

    /// Populate-on-demand entries in the host view
    pub fn pod_entry_count(&self) -> u64 {
        self.host.lock_read().pod_entry_count()
    }

    /// Paged-out frames of the domain
    pub fn paged_count(&self) -> u64 {
        self.host.lock_read().paged_count()
    }

    /// Release every view of the domain
    ///
    /// Alternate views go first, then nested views, then the host view.
    pub fn final_teardown(&self) {
        self.altp2m.teardown();
        self.nested.teardown();
        self.host.lock_write().teardown();
        log::info!("d{}: p2m torn down", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PagingPool;
    use crate::p2m::testing::{DomainBuilder, RecordingObserver};
    use crate::p2m::{AltLookup, QueryFlags};
    use crate::PAGE_ORDER_4K;
    use alloc::sync::Arc;

    #[test]
    fn test_new_allocates_requested_views() {
        let fx = DomainBuilder::new().nested_virt().altp2m().build();
        let d = &fx.domain;
        assert_eq!(d.nested.len(), d.config().nested_slots);
        assert_eq!(d.altp2m.len(), d.config().altp2m_slots);
        assert_eq!(fx.pool.allocated_frames(), 1 + d.nested.len() + d.altp2m.len());

        d.final_teardown();
        assert_eq!(fx.pool.allocated_frames(), 0);
    }

    #[test]
    fn test_new_rolls_back_on_exhaustion() {
        let fx = DomainBuilder::new().pool_frames(0).build_result();
        assert_eq!(fx.result.err(), Some(Error::OutOfMemory));
        assert_eq!(fx.pool.allocated_frames(), 0);

        let fx = DomainBuilder::new().nested_virt().pool_frames(4).build_result();
        assert_eq!(fx.result.err(), Some(Error::OutOfMemory));
        assert_eq!(fx.pool.allocated_frames(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let fx = DomainBuilder::new().configure(|c| c.nested_slots = 0).build_result();
        assert_eq!(fx.result.err(), Some(Error::InvalidArgument));
    }

    #[test]
    fn test_caps_follow_config() {
        let fx = DomainBuilder::new().configure(|c| c.hap_1gb = false).build();
        assert_eq!(fx.domain.host().caps(), BackendCaps::SUPERPAGE_2M);
    }

    #[test]
    fn test_iommu_flags_by_type() {
        let fx = DomainBuilder::new()
            .configure(|c| c.mmio_ro_ranges.add_range(0xfe000, 0xfefff))
            .build();
        let d = &fx.domain;
        let rw = IommuFlags::READ | IommuFlags::WRITE;
        assert_eq!(d.iommu_flags(P2mType::RamRw, Some(Mfn::new(1))), rw);
        assert_eq!(d.iommu_flags(P2mType::RamLogdirty, Some(Mfn::new(1))), rw);
        assert_eq!(d.iommu_flags(P2mType::RamRo, Some(Mfn::new(1))), IommuFlags::READ);
        assert_eq!(d.iommu_flags(P2mType::MmioDirect, Some(Mfn::new(0xfe010))), IommuFlags::READ);
        assert_eq!(d.iommu_flags(P2mType::MmioDirect, Some(Mfn::new(0x1000))), rw);
        assert_eq!(d.iommu_flags(P2mType::RamShared, Some(Mfn::new(1))), IommuFlags::empty());
        assert_eq!(d.iommu_flags(P2mType::Invalid, None), IommuFlags::empty());
    }

    #[test]
    fn test_host_changes_reach_observer() {
        let observer = Arc::new(RecordingObserver::default());
        let fx = DomainBuilder::new()
            .configure(|c| c.iommu_sync = true)
            .observer(observer.clone())
            .build();
        let d = &fx.domain;

        d.set_entry(Gfn::new(7), Some(Mfn::new(70)), PAGE_ORDER_4K, P2mType::RamRw, P2mAccess::Default)
            .unwrap();
        d.set_entry(Gfn::new(7), None, PAGE_ORDER_4K, P2mType::Invalid, P2mAccess::Default)
            .unwrap();

        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], (1, Gfn::new(7), Some(Mfn::new(70)), 0, IommuFlags::READ | IommuFlags::WRITE));
        assert_eq!(events[1], (1, Gfn::new(7), None, 0, IommuFlags::empty()));
    }

    #[test]
    fn test_observer_silent_without_iommu_sync() {
        let observer = Arc::new(RecordingObserver::default());
        let fx = DomainBuilder::new().observer(observer.clone()).build();
        fx.domain
            .set_entry(Gfn::new(7), Some(Mfn::new(70)), 0, P2mType::RamRw, P2mAccess::Default)
            .unwrap();
        assert!(observer.events().is_empty());
        assert!(fx.domain.host().get_entry(Gfn::new(7), QueryFlags::empty()).is_present());
    }

    #[test]
    fn test_failed_install_invalidates_derived_views() {
        let observer = Arc::new(RecordingObserver::default());
        let fx = DomainBuilder::new()
            .altp2m()
            .configure(|c| c.iommu_sync = true)
            .observer(observer.clone())
            .build();
        let d = &fx.domain;
        d.set_entry(Gfn::new(0x1ff), Some(Mfn::new(0x5000)), PAGE_ORDER_4K, P2mType::RamRw, P2mAccess::Default)
            .unwrap();
        d.enable_altp2m().unwrap();
        d.altp2m_effective_entry(0, Gfn::new(0x1ff), AltLookup::Prepopulate).unwrap();
        let alt = d.altp2m_table(0).unwrap();
        assert_eq!(alt.get_entry(Gfn::new(0x1ff), QueryFlags::empty()).mfn, Some(Mfn::new(0x5000)));

        // The second frame needs a paging structure the pool cannot supply.
        while fx.pool.alloc_page().is_some() {}
        let before = observer.events().len();
        assert_eq!(
            d.set_entry(Gfn::new(0x1ff), Some(Mfn::new(0x9000)), 1, P2mType::RamRw, P2mAccess::Default),
            Err(Error::OutOfMemory)
        );

        // The written chunk stays; nothing else may keep the old frame.
        let host = d.host().get_entry(Gfn::new(0x1ff), QueryFlags::empty());
        assert_eq!(host.mfn, Some(Mfn::new(0x9000)));
        assert!(!alt.get_entry(Gfn::new(0x1ff), QueryFlags::empty()).is_present());
        let events = observer.events();
        assert_eq!(events.len(), before + 1);
        assert_eq!(events[before], (1, Gfn::new(0x1ff), None, 1, IommuFlags::empty()));
    }

    #[test]
    fn test_oversized_order_rejected() {
        let fx = DomainBuilder::new().build();
        let d = &fx.domain;
        assert_eq!(
            d.set_entry(Gfn::new(0), Some(Mfn::new(0)), 64, P2mType::RamRw, P2mAccess::Default),
            Err(Error::InvalidArgument)
        );
        assert_eq!(d.remove_page(Gfn::new(0), None, 70), Err(Error::InvalidArgument));
        assert_eq!(d.mark_populate_on_demand(Gfn::new(0), 19), Err(Error::InvalidArgument));
        assert!(!d.host().get_entry(Gfn::new(0), QueryFlags::empty()).is_present());
    }

    #[test]
    fn test_crash_is_sticky() {
        let fx = DomainBuilder::new().build();
        assert!(!fx.domain.is_crashed());
        fx.domain.crash();
        fx.domain.crash();
        assert!(fx.domain.is_crashed());
    }

    #[test]
    fn test_vcpu_bounds_checked() {
        let fx = DomainBuilder::new().configure(|c| c.vcpus = 2).build();
        assert!(fx.domain.vcpu_state(1).is_ok());
        assert_eq!(fx.domain.vcpu_state(2), Err(Error::InvalidArgument));
    }
}
