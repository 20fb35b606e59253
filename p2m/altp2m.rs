//! Alternate views
//!
//! A fixed set of views that may diverge from the host view per virtual
//! CPU. An alternate view starts out empty and is filled lazily from the
//! host view; explicit remaps make a guest frame point at the backing of
//! another one. Host view changes are propagated into every active view.
//!
//! Slot 0 is the default view every vCPU uses once alternate views are
//! enabled for the domain; it cannot be destroyed on its own.

use crate::config::{P2mConfig, MAX_ALTP2M};
use crate::mm::{DomainId, Gfn, Mfn, PAGE_ORDER_4K};
use crate::p2m::{
    BackendCaps, EntrySource, LogDirtyTracker, P2mAccess, P2mDomain, P2mEntry, P2mEnv, P2mTable,
    P2mType, P2mWriteGuard, Progress, QueryFlags, VcpuP2m, ViewId, ViewKind,
};
use crate::sync::SpinLock;
use crate::utils::Preempt;
use crate::{Error, Result};
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, Ordering};

/// How an alternate view lookup falls back to the host view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltLookup {
    /// Return the host entry without touching the alternate view
    Query,
    /// Also copy the host entry, at its natural alignment, into the view
    Prepopulate,
}

/// Alternate view selector of one vCPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AltVcpu {
    /// Selected view, `None` while alternate views are disabled
    pub p2midx: Option<u8>,
}

#[derive(Debug, Default)]
struct AltP2mList {
    active: [bool; MAX_ALTP2M],
    visible: [bool; MAX_ALTP2M],
}

/// Alternate view slots of one domain
pub(crate) struct AltP2mSet {
    enabled: AtomicBool,
    /// Alternate list lock
    list: SpinLock<AltP2mList>,
    tables: Vec<P2mTable>,
}

impl AltP2mSet {
    /// Create the set; slots only exist for domains allowed to use them
    pub(crate) fn new(
        domain: DomainId,
        config: &P2mConfig,
        env: &P2mEnv,
        caps: BackendCaps,
    ) -> Result<Self> {
        let slots = if config.altp2m { config.altp2m_slots } else { 0 };
        let mut tables: Vec<P2mTable> = Vec::with_capacity(slots);

        for i in 0..slots {
            let table = P2mTable::new(
                ViewId { domain, kind: ViewKind::Alternate(i as u8) },
                env.backend.clone(),
                env.pool.clone(),
                config.default_access,
                caps,
            );
            let allocated = table.lock_write().alloc_table();
            if let Err(e) = allocated {
                for table in &tables {
                    table.lock_write().teardown();
                }
                return Err(e);
            }
            tables.push(table);
        }

        Ok(Self {
            enabled: AtomicBool::new(false),
            list: SpinLock::new(AltP2mList::default()),
            tables,
        })
    }

    /// Number of slots
    pub(crate) fn len(&self) -> usize {
        self.tables.len()
    }

    fn table(&self, idx: u8) -> Result<&P2mTable> {
        self.tables.get(idx as usize).ok_or(Error::InvalidArgument)
    }

    /// Run `f` on every active slot, holding the alternate list lock
    pub(crate) fn for_each_active(&self, mut f: impl FnMut(&P2mTable)) {
        let list = self.list.lock();
        for (i, table) in self.tables.iter().enumerate() {
            if list.active[i] {
                f(table);
            }
        }
    }

    /// Release every slot's paging structures
    pub(crate) fn teardown(&self) {
        let mut list = self.list.lock();
        for (i, table) in self.tables.iter().enumerate() {
            list.active[i] = false;
            list.visible[i] = false;
            table.lock_write().teardown();
        }
        self.enabled.store(false, Ordering::Release);
    }
}

/// Look `gfn` up in an alternate view, falling back to the host view
///
/// The host entry only counts if it is present plain RAM. With
/// [`AltLookup::Prepopulate`] the host entry is copied into the view at
/// its natural alignment, so later faults in the same superpage are served
/// by the view directly.
pub fn effective_entry(
    host: &dyn EntrySource,
    alt: &mut P2mWriteGuard<'_>,
    gfn: Gfn,
    lookup: AltLookup,
) -> Result<P2mEntry> {
    let entry = alt.get_entry(gfn, QueryFlags::empty());
    if entry.is_present() {
        return Ok(entry);
    }

    let entry = host.lookup(gfn, QueryFlags::empty());
    let Some(mfn) = entry.mfn else {
        return Err(Error::NotFound);
    };
    if entry.p2m_type != P2mType::RamRw {
        return Err(Error::NotFound);
    }

    if lookup == AltLookup::Prepopulate {
        let order = entry.order;
        alt.set_entry(
            gfn.align_down(order),
            Some(mfn.align_down(order)),
            order,
            entry.p2m_type,
            entry.access,
        )?;
    }

    Ok(entry)
}

fn record_first(first: &mut Option<Error>, result: Result<()>) {
    if let Err(e) = result {
        first.get_or_insert(e);
    }
}

impl P2mDomain {
    /// Whether alternate views are enabled
    pub fn altp2m_active(&self) -> bool {
        self.altp2m.enabled.load(Ordering::Acquire)
    }

    /// Alternate view slot `idx`
    pub fn altp2m_table(&self, idx: u8) -> Option<&P2mTable> {
        self.altp2m.tables.get(idx as usize)
    }

    /// Alternate view `vcpu` currently uses
    pub fn vcpu_altp2m(&self, vcpu: usize) -> Result<Option<&P2mTable>> {
        let idx = self.vcpu(vcpu)?.lock().alt.p2midx;
        Ok(idx.and_then(|i| self.altp2m_table(i)))
    }

    /// Whether slot `idx` is active
    pub fn altp2m_is_active(&self, idx: u8) -> bool {
        let list = self.altp2m.list.lock();
        list.active.get(idx as usize).copied().unwrap_or(false)
    }

    /// Whether slot `idx` may be selected domain wide
    pub fn altp2m_is_visible(&self, idx: u8) -> bool {
        let list = self.altp2m.list.lock();
        list.visible.get(idx as usize).copied().unwrap_or(false)
    }

    /// Enable alternate views, making view 0 current for every vCPU
    pub fn enable_altp2m(&self) -> Result<()> {
        if !self.config().altp2m {
            return Err(Error::PermissionDenied);
        }
        if self
            .altp2m
            .enabled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        if let Err(e) = self.altp2m_init_by_id(0) {
            self.altp2m.enabled.store(false, Ordering::Release);
            return Err(e);
        }

        let view = self.altp2m.table(0)?;
        for v in self.vcpu_locks() {
            v.lock().alt.p2midx = Some(0);
            view.vcpu_get();
        }

        log::info!("d{}: altp2m enabled", self.id());
        Ok(())
    }

    /// Disable alternate views and deactivate every slot
    pub fn disable_altp2m(&self) -> Result<()> {
        if self
            .altp2m
            .enabled
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        for v in self.vcpu_locks() {
            if let Some(idx) = v.lock().alt.p2midx.take() {
                self.altp2m.table(idx)?.vcpu_put();
            }
        }
        self.altp2m_flush_all();

        log::info!("d{}: altp2m disabled", self.id());
        Ok(())
    }

    /// Empty slot `idx`, and deactivate it if asked
    ///
    /// Every entry is dropped, so the view falls back to host lookups.
    fn altp2m_reset(&self, table: &P2mTable, deactivate: bool) {
        let mut p2m = table.lock_write();
        p2m.flush_table();
        if deactivate {
            p2m.free_logdirty();
        }
        p2m.reset_remapped();
    }

    fn altp2m_activate(
        &self,
        list: &mut AltP2mList,
        idx: u8,
        access: P2mAccess,
        logdirty: LogDirtyTracker,
    ) -> Result<()> {
        let table = self.altp2m.table(idx)?;
        let mut p2m = table.lock_write();
        p2m.init_logdirty(logdirty);
        p2m.set_default_access(access);
        p2m.reset_remapped();

        list.active[idx as usize] = true;
        list.visible[idx as usize] = true;

        log::debug!("{}: activated", table.id());
        Ok(())
    }

    /// Activate slot `idx` with the host view's default access
    pub fn altp2m_init_by_id(&self, idx: u8) -> Result<()> {
        self.altp2m.table(idx)?;
        let access = self.host().lock_read().default_access();
        let logdirty = self.logdirty_snapshot();

        let mut list = self.altp2m.list.lock();
        if list.active[idx as usize] {
            return Err(Error::InvalidArgument);
        }
        self.altp2m_activate(&mut list, idx, access, logdirty)
    }

    /// Activate the first free slot with `access` as its default access
    pub fn altp2m_init_next(&self, access: P2mAccess) -> Result<u8> {
        let access = access.resolve(self.host().lock_read().default_access());
        let logdirty = self.logdirty_snapshot();

        let mut list = self.altp2m.list.lock();
        let idx = (0..self.altp2m.len())
            .find(|&i| !list.active[i])
            .ok_or(Error::NoFreeSlot)? as u8;
        self.altp2m_activate(&mut list, idx, access, logdirty)?;
        Ok(idx)
    }

    /// Deactivate slot `idx`
    ///
    /// Slot 0 and slots some vCPU still uses are refused with `Busy`.
    pub fn altp2m_destroy_by_id(&self, idx: u8) -> Result<()> {
        if idx == 0 {
            return Err(Error::Busy);
        }
        let table = self.altp2m.table(idx)?;

        let mut list = self.altp2m.list.lock();
        if !list.active[idx as usize] || table.active_vcpus() != 0 {
            return Err(Error::Busy);
        }
        self.altp2m_reset(table, true);
        list.active[idx as usize] = false;
        list.visible[idx as usize] = false;

        log::debug!("{}: destroyed", table.id());
        Ok(())
    }

    /// Point `v` at slot `idx`, keeping the active vCPU counts right
    fn altp2m_set_vcpu(&self, v: &mut VcpuP2m, idx: u8) -> Result<bool> {
        if v.alt.p2midx == Some(idx) {
            return Ok(false);
        }
        let new = self.altp2m.table(idx)?;
        if let Some(old) = v.alt.p2midx {
            self.altp2m.table(old)?.vcpu_put();
        }
        v.alt.p2midx = Some(idx);
        new.vcpu_get();
        Ok(true)
    }

    /// Switch one vCPU to active slot `idx`
    pub fn altp2m_switch_vcpu(&self, vcpu: usize, idx: u8) -> Result<()> {
        if !self.altp2m_active() {
            return Err(Error::InvalidState);
        }
        self.altp2m.table(idx)?;

        let list = self.altp2m.list.lock();
        if !list.active[idx as usize] {
            return Err(Error::InvalidArgument);
        }
        let mut v = self.vcpu(vcpu)?.lock();
        self.altp2m_set_vcpu(&mut v, idx)?;
        Ok(())
    }

    /// Switch every vCPU to visible slot `idx`
    pub fn altp2m_switch_domain(&self, idx: u8) -> Result<()> {
        if !self.altp2m_active() {
            return Err(Error::InvalidState);
        }
        self.altp2m.table(idx)?;

        let list = self.altp2m.list.lock();
        if !list.visible[idx as usize] {
            return Err(Error::InvalidArgument);
        }
        for v in self.vcpu_locks() {
            self.altp2m_set_vcpu(&mut v.lock(), idx)?;
        }
        Ok(())
    }

    /// Show or hide active slot `idx` from domain wide switches
    pub fn altp2m_set_visibility(&self, idx: u8, visible: bool) -> Result<()> {
        self.altp2m.table(idx)?;
        let mut list = self.altp2m.list.lock();
        if !list.active[idx as usize] {
            return Err(Error::InvalidArgument);
        }
        list.visible[idx as usize] = visible;
        Ok(())
    }

    /// Remap `old` in slot `idx` to whatever backs `new`
    ///
    /// With `new` of `None` the view's own mapping of `old` is removed and
    /// `old` falls back to the host view again.
    pub fn altp2m_change_gfn(&self, idx: u8, old: Gfn, new: Option<Gfn>) -> Result<()> {
        let table = self.altp2m.table(idx)?;
        let host = self.host().reader();
        let list = self.altp2m.list.lock();
        if !list.active[idx as usize] {
            return Err(Error::InvalidArgument);
        }
        let mut ap2m = table.lock_write();

        let Some(new) = new else {
            if ap2m.get_entry(old, QueryFlags::empty()).is_present() {
                ap2m.set_entry(old, None, PAGE_ORDER_4K, P2mType::Invalid, P2mAccess::Default)?;
            }
            return Ok(());
        };

        effective_entry(&host, &mut ap2m, old, AltLookup::Prepopulate)?;
        let target = effective_entry(&host, &mut ap2m, new, AltLookup::Query)?;
        ap2m.set_entry(old, target.mfn, PAGE_ORDER_4K, target.p2m_type, target.access)?;
        ap2m.widen_remapped(new);

        log::debug!("{}: gfn {} remapped to backing of {}", table.id(), old, new);
        Ok(())
    }

    /// Effective entry of `gfn` in slot `idx`
    pub fn altp2m_effective_entry(&self, idx: u8, gfn: Gfn, lookup: AltLookup) -> Result<P2mEntry> {
        let table = self.altp2m.table(idx)?;
        let host = self.host().reader();
        let list = self.altp2m.list.lock();
        if !list.active[idx as usize] {
            return Err(Error::InvalidArgument);
        }
        let mut ap2m = table.lock_write();
        effective_entry(&host, &mut ap2m, gfn, lookup)
    }

    /// Resolve a fault of `vcpu` on `gfn` in its alternate view
    ///
    /// `host` is the host entry the fault path already looked up. Returns
    /// the view's own entry if it has one (or if the host has nothing to
    /// copy either), with the order clipped to the host entry's. Otherwise
    /// the host entry, access included, is copied into the view and `None`
    /// asks the caller to retry the access.
    pub fn altp2m_get_or_propagate(
        &self,
        vcpu: usize,
        gfn: Gfn,
        host: P2mEntry,
    ) -> Result<Option<P2mEntry>> {
        let idx = self.vcpu(vcpu)?.lock().alt.p2midx.ok_or(Error::InvalidState)?;
        let table = self.altp2m.table(idx)?;
        let mut ap2m = table.lock_write();

        let entry = ap2m.get_entry(gfn, QueryFlags::empty());
        let order = entry.order.min(host.order);
        if entry.is_present() {
            return Ok(Some(P2mEntry { order, ..entry }));
        }
        let Some(mfn) = host.mfn else {
            return Ok(Some(P2mEntry { order, ..host }));
        };

        let copied = ap2m.set_entry(
            gfn.align_down(order),
            Some(mfn.align_down(order)),
            order,
            host.p2m_type,
            host.access,
        );
        drop(ap2m);

        if let Err(e) = copied {
            log::error!(
                "{}: failed to propagate gfn {} mfn {} order {}: {}",
                table.id(),
                gfn,
                mfn,
                order,
                e
            );
            self.crash();
            return Err(Error::DomainCrashed);
        }
        Ok(None)
    }

    /// Bring every active alternate view in line with a host view change
    ///
    /// Removals inside a view's remapped bound reset that view; a second
    /// such view resets every active view and ends the scan. Otherwise a
    /// view that maps the frame gets the same update. A failure on one view
    /// does not stop the others; the first error is returned.
    pub(crate) fn propagate_change(
        &self,
        gfn: Gfn,
        mfn: Option<Mfn>,
        order: u32,
        p2m_type: P2mType,
        access: P2mAccess,
    ) -> Result<()> {
        if !self.altp2m_active() {
            return Ok(());
        }

        let list = self.altp2m.list.lock();
        let mut reset_count = 0;
        let mut last_reset = None;
        let mut ret = Ok(());

        for (i, table) in self.altp2m.tables.iter().enumerate() {
            if !list.active[i] {
                continue;
            }
            let mut p2m = table.lock_write();
            let (min, max) = p2m.remapped_bounds();

            if mfn.is_none() && gfn.raw() + (1u64 << order) > min && gfn.raw() <= max {
                drop(p2m);
                reset_count += 1;
                if reset_count == 1 {
                    self.altp2m_reset(table, false);
                    last_reset = Some(i);
                } else {
                    // At least two views impacted, reset them all.
                    for (j, other) in self.altp2m.tables.iter().enumerate() {
                        if Some(j) != last_reset && list.active[j] {
                            self.altp2m_reset(other, false);
                        }
                    }
                    ret = Ok(());
                    break;
                }
            } else if p2m.get_entry(gfn, QueryFlags::empty()).is_present() {
                if let Err(e) = p2m.set_entry(gfn, mfn, order, p2m_type, access) {
                    log::warn!("{}: propagating gfn {} failed: {}", table.id(), gfn, e);
                    if ret.is_ok() {
                        ret = Err(e);
                    }
                }
            }
        }

        ret
    }

    /// Reset and deactivate every slot
    pub fn altp2m_flush_all(&self) {
        let mut list = self.altp2m.list.lock();
        for (i, table) in self.altp2m.tables.iter().enumerate() {
            self.altp2m_reset(table, true);
            list.active[i] = false;
            list.visible[i] = false;
        }
    }

    /// Change the default access of the host view or of slot `idx`
    pub fn set_default_access(&self, view: Option<u8>, access: P2mAccess) -> Result<()> {
        match view {
            None => self.host().lock_write().set_default_access(access),
            Some(idx) => {
                let table = self.altp2m.table(idx)?;
                let list = self.altp2m.list.lock();
                if !list.active[idx as usize] {
                    return Err(Error::InvalidArgument);
                }
                table.lock_write().set_default_access(access);
            }
        }
        Ok(())
    }

    /// Override the access of every frame in `gfns`
    ///
    /// Works on the host view (`view` of `None`) or on an active alternate
    /// view, which is filled from the host view as needed. Frames without
    /// a mapping are skipped. A failing frame does not stop the others;
    /// the first error is returned once the range is done, or when the
    /// operation is preempted with an error recorded. Otherwise preemption
    /// yields the first frame not yet processed.
    pub fn set_mem_access_multi(
        &self,
        view: Option<u8>,
        gfns: Range<u64>,
        access: P2mAccess,
        preempt: &dyn Preempt,
    ) -> Result<Progress> {
        let mut first_err = None;

        match view {
            None => {
                let mut p2m = self.host().lock_write();
                let access = access.resolve(p2m.default_access());
                for gfn in gfns.clone() {
                    let g = Gfn::new(gfn);
                    let entry = p2m.get_entry(g, QueryFlags::empty());
                    if entry.is_present() {
                        let r = self.host_set_entry(
                            &mut p2m,
                            g,
                            entry.mfn,
                            PAGE_ORDER_4K,
                            entry.p2m_type,
                            access,
                        );
                        record_first(&mut first_err, r);
                    }
                    if gfn + 1 < gfns.end && preempt.should_yield() {
                        return match first_err {
                            Some(e) => Err(e),
                            None => Ok(Progress::Preempted { next: gfn + 1 }),
                        };
                    }
                }
            }
            Some(idx) => {
                let table = self.altp2m.table(idx)?;
                let host = self.host().reader();
                let list = self.altp2m.list.lock();
                if !list.active[idx as usize] {
                    return Err(Error::InvalidArgument);
                }
                let mut ap2m = table.lock_write();
                let access = access.resolve(ap2m.default_access());
                for gfn in gfns.clone() {
                    let g = Gfn::new(gfn);
                    match effective_entry(&host, &mut ap2m, g, AltLookup::Prepopulate) {
                        Ok(entry) => {
                            let r = ap2m.set_entry(
                                g,
                                entry.mfn,
                                PAGE_ORDER_4K,
                                entry.p2m_type,
                                access,
                            );
                            record_first(&mut first_err, r);
                        }
                        // Nothing to override.
                        Err(Error::NotFound) => {}
                        Err(e) => record_first(&mut first_err, Err(e)),
                    }
                    if gfn + 1 < gfns.end && preempt.should_yield() {
                        return match first_err {
                            Some(e) => Err(e),
                            None => Ok(Progress::Preempted { next: gfn + 1 }),
                        };
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(Progress::Done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PAGE_ORDER_2M;
    use crate::p2m::testing::DomainBuilder;
    use crate::utils::NoPreempt;

    fn alt_domain(vcpus: usize) -> crate::p2m::testing::Fixture {
        let fx = DomainBuilder::new().altp2m().configure(|c| c.vcpus = vcpus).build();
        fx.domain.enable_altp2m().unwrap();
        fx
    }

    fn map(d: &P2mDomain, gfn: u64, mfn: u64, order: u32) {
        d.set_entry(Gfn::new(gfn), Some(Mfn::new(mfn)), order, P2mType::RamRw, P2mAccess::Default)
            .unwrap();
    }

    fn alt_entry(d: &P2mDomain, idx: u8, gfn: u64) -> P2mEntry {
        d.altp2m_table(idx).unwrap().get_entry(Gfn::new(gfn), QueryFlags::empty())
    }

    #[test]
    fn test_enable_requires_permission() {
        let fx = DomainBuilder::new().build();
        assert_eq!(fx.domain.enable_altp2m(), Err(Error::PermissionDenied));
        assert!(!fx.domain.altp2m_active());
    }

    #[test]
    fn test_enable_selects_view_zero() {
        let fx = alt_domain(2);
        let d = &fx.domain;
        assert!(d.altp2m_active());
        assert!(d.altp2m_is_active(0));
        assert_eq!(d.vcpu_state(1).unwrap().alt.p2midx, Some(0));
        assert_eq!(d.altp2m_table(0).unwrap().active_vcpus(), 2);

        // Enabling twice is harmless.
        d.enable_altp2m().unwrap();
        assert_eq!(d.altp2m_table(0).unwrap().active_vcpus(), 2);

        d.disable_altp2m().unwrap();
        assert!(!d.altp2m_is_active(0));
        assert_eq!(d.altp2m_table(0).unwrap().active_vcpus(), 0);
        assert_eq!(d.vcpu_state(0).unwrap().alt.p2midx, None);
    }

    #[test]
    fn test_init_and_destroy_lifecycle() {
        let fx = alt_domain(1);
        let d = &fx.domain;

        assert_eq!(d.altp2m_init_by_id(0), Err(Error::InvalidArgument));
        assert_eq!(d.altp2m_init_by_id(MAX_ALTP2M as u8), Err(Error::InvalidArgument));
        d.altp2m_init_by_id(3).unwrap();
        assert_eq!(d.altp2m_init_next(P2mAccess::Rx).unwrap(), 1);
        assert_eq!(d.altp2m_table(1).unwrap().lock_read().default_access(), P2mAccess::Rx);

        let (min, max) = d.altp2m_table(3).unwrap().lock_read().remapped_bounds();
        assert!(min > max);

        assert_eq!(d.altp2m_destroy_by_id(0), Err(Error::Busy));
        assert_eq!(d.altp2m_destroy_by_id(2), Err(Error::Busy));
        d.altp2m_switch_vcpu(0, 3).unwrap();
        assert_eq!(d.altp2m_destroy_by_id(3), Err(Error::Busy));
        d.altp2m_switch_vcpu(0, 0).unwrap();
        d.altp2m_destroy_by_id(3).unwrap();
        assert!(!d.altp2m_is_active(3));
        assert!(d.altp2m_table(3).unwrap().lock_read().logdirty().is_none());
    }

    #[test]
    fn test_init_next_exhaustion() {
        let fx = DomainBuilder::new().altp2m().configure(|c| c.altp2m_slots = 2).build();
        let d = &fx.domain;
        d.enable_altp2m().unwrap();
        assert_eq!(d.altp2m_init_next(P2mAccess::Default).unwrap(), 1);
        assert_eq!(d.altp2m_init_next(P2mAccess::Default), Err(Error::NoFreeSlot));
    }

    #[test]
    fn test_activation_copies_host_logdirty() {
        let fx = DomainBuilder::new().altp2m().build();
        let d = &fx.domain;
        map(d, 0, 0x100, 4);
        d.change_type_range(4..8, P2mType::RamRw, P2mType::RamLogdirty).unwrap();
        d.enable_altp2m().unwrap();

        let p2m = d.altp2m_table(0).unwrap().lock_read();
        let ld = p2m.logdirty().unwrap();
        assert_eq!(ld.is_logdirty_range(4..8), crate::p2m::LogDirtyState::Tracked);
    }

    #[test]
    fn test_switch_vcpu_counts() {
        let fx = alt_domain(2);
        let d = &fx.domain;
        d.altp2m_init_by_id(2).unwrap();

        d.altp2m_switch_vcpu(1, 2).unwrap();
        assert_eq!(d.altp2m_table(0).unwrap().active_vcpus(), 1);
        assert_eq!(d.altp2m_table(2).unwrap().active_vcpus(), 1);
        assert!(core::ptr::eq(d.vcpu_altp2m(1).unwrap().unwrap(), d.altp2m_table(2).unwrap()));

        // Switching to the current view changes nothing.
        d.altp2m_switch_vcpu(1, 2).unwrap();
        assert_eq!(d.altp2m_table(2).unwrap().active_vcpus(), 1);
        assert_eq!(d.altp2m_switch_vcpu(1, 5), Err(Error::InvalidArgument));
        assert_eq!(d.altp2m_switch_vcpu(7, 2), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_switch_domain_requires_visible() {
        let fx = alt_domain(2);
        let d = &fx.domain;
        d.altp2m_init_by_id(1).unwrap();
        d.altp2m_set_visibility(1, false).unwrap();
        assert_eq!(d.altp2m_switch_domain(1), Err(Error::InvalidArgument));

        d.altp2m_set_visibility(1, true).unwrap();
        d.altp2m_switch_domain(1).unwrap();
        assert_eq!(d.altp2m_table(1).unwrap().active_vcpus(), 2);
        assert_eq!(d.altp2m_table(0).unwrap().active_vcpus(), 0);
        assert_eq!(d.altp2m_set_visibility(4, true), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_effective_entry_query_and_prepopulate() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        map(d, 0x200, 0x8_0000, PAGE_ORDER_2M);

        let entry = d.altp2m_effective_entry(0, Gfn::new(0x234), AltLookup::Query).unwrap();
        assert_eq!(entry.mfn, Some(Mfn::new(0x8_0034)));
        assert!(!alt_entry(d, 0, 0x234).is_present());

        d.altp2m_effective_entry(0, Gfn::new(0x234), AltLookup::Prepopulate).unwrap();
        let copied = alt_entry(d, 0, 0x3ff);
        assert_eq!(copied.mfn, Some(Mfn::new(0x8_01ff)));
        assert_eq!(copied.order, PAGE_ORDER_2M);
    }

    #[test]
    fn test_effective_entry_requires_host_ram_rw() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        assert_eq!(
            d.altp2m_effective_entry(0, Gfn::new(5), AltLookup::Query),
            Err(Error::NotFound)
        );
        d.set_entry(Gfn::new(5), Some(Mfn::new(5)), 0, P2mType::RamRo, P2mAccess::Default)
            .unwrap();
        assert_eq!(
            d.altp2m_effective_entry(0, Gfn::new(5), AltLookup::Prepopulate),
            Err(Error::NotFound)
        );
        assert!(!alt_entry(d, 0, 5).is_present());
    }

    #[test]
    fn test_change_gfn_remaps_and_reverts() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        map(d, 10, 1000, 0);
        map(d, 20, 2000, 0);

        d.altp2m_change_gfn(0, Gfn::new(10), Some(Gfn::new(20))).unwrap();
        assert_eq!(alt_entry(d, 0, 10).mfn, Some(Mfn::new(2000)));
        assert_eq!(d.altp2m_table(0).unwrap().lock_read().remapped_bounds(), (20, 20));
        // The host view is untouched.
        assert_eq!(
            d.host().get_entry(Gfn::new(10), QueryFlags::empty()).mfn,
            Some(Mfn::new(1000))
        );

        d.altp2m_change_gfn(0, Gfn::new(10), None).unwrap();
        assert!(!alt_entry(d, 0, 10).is_present());
        assert_eq!(
            d.altp2m_effective_entry(0, Gfn::new(10), AltLookup::Query).unwrap().mfn,
            Some(Mfn::new(1000))
        );
    }

    #[test]
    fn test_change_gfn_errors() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        map(d, 10, 1000, 0);
        assert_eq!(
            d.altp2m_change_gfn(0, Gfn::new(10), Some(Gfn::new(99))),
            Err(Error::NotFound)
        );
        assert_eq!(
            d.altp2m_change_gfn(4, Gfn::new(10), Some(Gfn::new(10))),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_propagate_updates_only_mapped_views() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        d.altp2m_init_by_id(1).unwrap();
        map(d, 10, 1000, 0);
        d.altp2m_effective_entry(0, Gfn::new(10), AltLookup::Prepopulate).unwrap();

        d.set_entry(Gfn::new(10), Some(Mfn::new(1001)), 0, P2mType::RamRw, P2mAccess::Default)
            .unwrap();
        assert_eq!(alt_entry(d, 0, 10).mfn, Some(Mfn::new(1001)));
        assert!(!alt_entry(d, 1, 10).is_present());
    }

    #[test]
    fn test_propagate_single_impacted_view_is_reset() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        d.altp2m_init_by_id(1).unwrap();
        map(d, 10, 1000, 0);
        map(d, 20, 2000, 0);
        map(d, 30, 3000, 0);
        d.altp2m_change_gfn(0, Gfn::new(10), Some(Gfn::new(20))).unwrap();
        d.altp2m_effective_entry(1, Gfn::new(30), AltLookup::Prepopulate).unwrap();

        d.set_entry(Gfn::new(20), None, 0, P2mType::Invalid, P2mAccess::Default).unwrap();

        assert!(!alt_entry(d, 0, 10).is_present());
        let (min, max) = d.altp2m_table(0).unwrap().lock_read().remapped_bounds();
        assert!(min > max);
        // The other view is patched, not reset.
        assert_eq!(alt_entry(d, 1, 30).mfn, Some(Mfn::new(3000)));
    }

    #[test]
    fn test_propagate_multiple_impacted_views_reset_all() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        for idx in 1..=3 {
            d.altp2m_init_by_id(idx).unwrap();
        }
        map(d, 10, 1000, 0);
        map(d, 20, 2000, 0);
        map(d, 30, 3000, 0);
        d.altp2m_change_gfn(1, Gfn::new(10), Some(Gfn::new(20))).unwrap();
        d.altp2m_change_gfn(3, Gfn::new(30), Some(Gfn::new(20))).unwrap();
        d.altp2m_effective_entry(2, Gfn::new(30), AltLookup::Prepopulate).unwrap();

        d.set_entry(Gfn::new(20), None, 0, P2mType::Invalid, P2mAccess::Default).unwrap();

        for idx in 0..=3 {
            let p2m = d.altp2m_table(idx).unwrap().lock_read();
            let (min, max) = p2m.remapped_bounds();
            assert!(min > max, "view {} keeps a remapped bound", idx);
            assert_eq!(p2m.max_mapped_gfn(), 0);
        }
        assert!(!alt_entry(d, 2, 30).is_present());
        assert_eq!(
            d.altp2m_effective_entry(2, Gfn::new(30), AltLookup::Query).unwrap().mfn,
            Some(Mfn::new(3000))
        );
    }

    #[test]
    fn test_get_or_propagate() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        map(d, 0x400, 0x8_0000, PAGE_ORDER_2M);
        let host = d.host().get_entry(Gfn::new(0x410), QueryFlags::empty());

        assert_eq!(d.altp2m_get_or_propagate(0, Gfn::new(0x410), host), Ok(None));
        let copied = alt_entry(d, 0, 0x5ff);
        assert_eq!(copied.mfn, Some(Mfn::new(0x8_01ff)));
        assert_eq!(copied.order, PAGE_ORDER_2M);

        let again = d.altp2m_get_or_propagate(0, Gfn::new(0x410), host).unwrap().unwrap();
        assert_eq!(again.mfn, Some(Mfn::new(0x8_0010)));

        let hole = d.host().get_entry(Gfn::new(0x9000), QueryFlags::empty());
        let entry = d.altp2m_get_or_propagate(0, Gfn::new(0x9000), hole).unwrap().unwrap();
        assert!(!entry.is_present());
        assert!(!alt_entry(d, 0, 0x9000).is_present());
    }

    #[test]
    fn test_get_or_propagate_keeps_host_access() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        d.set_entry(Gfn::new(7), Some(Mfn::new(0x700)), 0, P2mType::RamRw, P2mAccess::R)
            .unwrap();
        let host = d.host().get_entry(Gfn::new(7), QueryFlags::empty());
        assert_eq!(host.access, P2mAccess::R);

        assert_eq!(d.altp2m_get_or_propagate(0, Gfn::new(7), host), Ok(None));
        let copied = alt_entry(d, 0, 7);
        assert_eq!(copied.mfn, Some(Mfn::new(0x700)));
        assert_eq!(copied.access, P2mAccess::R);
    }

    #[test]
    fn test_mem_access_host_and_alt() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        map(d, 0, 0x100, 2);

        // Frames 4 and 5 are holes and are skipped.
        let done = d.set_mem_access_multi(None, 0..6, P2mAccess::Rx, &NoPreempt).unwrap();
        assert_eq!(done, Progress::Done);
        assert_eq!(d.host().get_entry(Gfn::new(3), QueryFlags::empty()).access, P2mAccess::Rx);

        d.altp2m_init_by_id(1).unwrap();
        d.set_mem_access_multi(Some(1), 0..6, P2mAccess::R, &NoPreempt).unwrap();
        assert_eq!(alt_entry(d, 1, 2).access, P2mAccess::R);
        assert!(!alt_entry(d, 1, 5).is_present());
        assert_eq!(d.host().get_entry(Gfn::new(2), QueryFlags::empty()).access, P2mAccess::Rx);
    }

    #[test]
    fn test_mem_access_preemption_cursor() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        map(d, 0, 0x100, 3);
        let calls = core::cell::Cell::new(0);
        let preempt = || {
            calls.set(calls.get() + 1);
            calls.get() == 3
        };

        let progress = d.set_mem_access_multi(None, 0..8, P2mAccess::Rx, &preempt).unwrap();
        assert_eq!(progress, Progress::Preempted { next: 3 });
        assert_eq!(d.host().get_entry(Gfn::new(2), QueryFlags::empty()).access, P2mAccess::Rx);
        assert_eq!(d.host().get_entry(Gfn::new(3), QueryFlags::empty()).access, P2mAccess::Rwx);

        let progress = d.set_mem_access_multi(None, 3..8, P2mAccess::Rx, &NoPreempt).unwrap();
        assert_eq!(progress, Progress::Done);
    }

    #[test]
    fn test_mem_access_inactive_view() {
        let fx = alt_domain(1);
        assert_eq!(
            fx.domain.set_mem_access_multi(Some(6), 0..1, P2mAccess::R, &NoPreempt),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_default_access_per_view() {
        let fx = alt_domain(1);
        let d = &fx.domain;
        d.set_default_access(Some(0), P2mAccess::R).unwrap();
        assert_eq!(d.altp2m_table(0).unwrap().lock_read().default_access(), P2mAccess::R);
        assert_eq!(d.set_default_access(Some(2), P2mAccess::R), Err(Error::InvalidArgument));
        d.set_default_access(None, P2mAccess::Rw).unwrap();
        assert_eq!(d.host().lock_read().default_access(), P2mAccess::Rw);
    }
}
