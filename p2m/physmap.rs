//! Physmap glue
//!
//! Guest-visible operations on the host view: locked lookups with
//! populate/unshare fixups, adding and removing owned pages while keeping
//! the machine-to-phys table coherent, typed entries (MMIO, foreign,
//! identity, shared) with order retry, foreign mappings and paging.
//!
//! Every operation takes the guest frame range lock before the host table
//! lock. Collaborators that may call back into the domain (unsharing, fork
//! population) are only invoked with the range lock held.

use crate::mm::{DomainId, Gfn, Mfn, PAGE_ORDER_2M, PAGE_ORDER_4K};
use crate::p2m::{
    check_order, BackendCaps, DomainRegistry, FrameOwner, GfnRangeGuard, P2mAccess, P2mDomain, P2mEntry,
    P2mType, P2mWriteGuard, Progress, QueryFlags, TypedSetOutcome,
};
use crate::{order_mask, Error, Result};
use core::ops::Deref;

/// Locked lookup result
///
/// Holds the range lock of the looked-up frame until it is dropped or
/// [`GfnRef::put`] is called, so the entry cannot change underneath the
/// caller.
#[must_use = "the frame is unlocked when the reference is dropped"]
pub struct GfnRef<'a> {
    _lock: GfnRangeGuard<'a>,
    entry: P2mEntry,
}

impl GfnRef<'_> {
    /// Entry found by the lookup
    pub fn entry(&self) -> P2mEntry {
        self.entry
    }

    /// Release the frame
    pub fn put(self) {}
}

impl Deref for GfnRef<'_> {
    type Target = P2mEntry;

    fn deref(&self) -> &P2mEntry {
        &self.entry
    }
}

impl P2mDomain {
    fn lock_gfn(&self, gfn: Gfn, order: u32) -> GfnRangeGuard<'_> {
        self.host().gfn_locks().lock_range(self.current_cpu(), gfn.raw(), order)
    }

    /// Host lookup with the side effects `query` asks for
    ///
    /// The caller holds the range lock of `gfn`.
    fn lookup_fixup(&self, gfn: Gfn, query: QueryFlags) -> P2mEntry {
        let mut query = query;
        // Unsharing makes no sense without populating.
        if query.contains(QueryFlags::UNSHARE) {
            query |= QueryFlags::ALLOC;
        }

        let host = self.host();
        let mut entry = host.get_entry(gfn, query);

        if let Some(sharing) = &self.env().sharing {
            let t = entry.p2m_type;
            if query.contains(QueryFlags::ALLOC)
                && (t.is_hole() || t.is_pod())
                && sharing
                    .fork_page(self.id(), self.current_cpu(), gfn, query.contains(QueryFlags::UNSHARE))
                    .is_ok()
            {
                entry = host.get_entry(gfn, query);
            }

            if query.contains(QueryFlags::UNSHARE) && entry.p2m_type.is_shared() {
                if sharing.unshare(self.id(), self.current_cpu(), gfn).is_err() {
                    sharing.notify_enomem(self.id(), gfn, false);
                }
                entry = host.get_entry(gfn, query);
            }
        }

        if entry.p2m_type.is_broken() {
            entry.mfn = None;
            if query.contains(QueryFlags::ALLOC) {
                log::error!("d{}: gfn {} is broken", self.id(), gfn);
                self.crash();
            }
        }

        entry
    }

    /// Look `gfn` up with side effects and keep it locked
    pub fn get_gfn_type_access(&self, gfn: Gfn, query: QueryFlags) -> GfnRef<'_> {
        let lock = self.lock_gfn(gfn, PAGE_ORDER_4K);
        let entry = self.lookup_fixup(gfn, query);
        GfnRef { _lock: lock, entry }
    }

    /// Look `gfn` up, populating it if needed, and keep it locked
    pub fn get_gfn(&self, gfn: Gfn) -> GfnRef<'_> {
        self.get_gfn_type_access(gfn, QueryFlags::ALLOC)
    }

    /// Look `gfn` up, breaking sharing if needed, and keep it locked
    pub fn get_gfn_unshare(&self, gfn: Gfn) -> GfnRef<'_> {
        self.get_gfn_type_access(gfn, QueryFlags::UNSHARE)
    }

    /// Look `gfn` up without side effects and keep it locked
    pub fn get_gfn_query(&self, gfn: Gfn) -> GfnRef<'_> {
        self.get_gfn_type_access(gfn, QueryFlags::empty())
    }

    /// Snapshot of the host entry of `gfn`, without the range lock
    pub fn get_gfn_query_unlocked(&self, gfn: Gfn) -> P2mEntry {
        self.host().get_entry(gfn, QueryFlags::empty())
    }

    /// Look `gfn` up and take a reference on its backing frame
    ///
    /// Returns the entry on success; the caller drops the reference with
    /// [`crate::p2m::PageOwnership::put_page`]. Foreign frames are
    /// referenced against their owner and shared frames against the
    /// copy-on-write owner.
    pub fn get_page_from_gfn(&self, gfn: Gfn, query: QueryFlags) -> Option<P2mEntry> {
        let ownership = &self.env().ownership;

        {
            let p2m = self.host().reader();
            let entry = p2m.get_entry(gfn, QueryFlags::empty());
            let t = entry.p2m_type;

            if let Some(mfn) = entry.mfn {
                if t.is_any_ram() && !(query.contains(QueryFlags::UNSHARE) && t.is_shared()) {
                    let owner = if t.is_foreign() {
                        ownership.owner(mfn).filter(|o| *o != FrameOwner::Domain(self.id()))
                    } else if t.is_shared() {
                        Some(FrameOwner::Cow)
                    } else {
                        Some(FrameOwner::Domain(self.id()))
                    };
                    if owner.map_or(false, |o| ownership.get_page(mfn, o)) {
                        return Some(entry);
                    }
                }
            }

            // Not a suitable frame at all.
            if !t.is_ram() && !t.is_paging() && !t.is_pod() && self.env().sharing.is_none() {
                return None;
            }
        }

        let entry = self.get_gfn_type_access(gfn, query);
        let mfn = entry.mfn?;
        if !entry.p2m_type.is_ram() {
            return None;
        }
        let owner = if entry.p2m_type.is_shared() {
            FrameOwner::Cow
        } else {
            FrameOwner::Domain(self.id())
        };
        ownership.get_page(mfn, owner).then(|| entry.entry())
    }

    /// Bind `[mfn, mfn + 2^order)` to `[gfn, gfn + 2^order)` as `p2m_type`
    ///
    /// Shared frames at the target are unshared first. A host frame that is
    /// already mapped at another guest frame is unmapped there, so no two
    /// guest frames claim it. Special entries at the target are never
    /// overwritten: the domain is crashed instead.
    pub fn add_entry(&self, gfn: Gfn, mfn: Mfn, order: u32, p2m_type: P2mType) -> Result<()> {
        // Foreign frames go through `add_foreign`, device memory through
        // the MMIO calls.
        if p2m_type.is_foreign() || p2m_type == P2mType::MmioDirect {
            return Err(Error::InvalidArgument);
        }

        check_order(order)?;
        let ownership = &self.env().ownership;
        let count = 1u64 << order;
        let _range = self.lock_gfn(gfn, order);

        log::debug!("d{}: adding gfn {} mfn {} order {}", self.id(), gfn, mfn, order);

        for i in 0..count {
            let g = gfn.add(i);
            if !self.host().get_entry(g, QueryFlags::empty()).p2m_type.is_shared() {
                continue;
            }
            let Some(sharing) = &self.env().sharing else {
                return Err(Error::InvalidState);
            };
            if let Err(e) = sharing.unshare(self.id(), self.current_cpu(), g) {
                sharing.notify_enomem(self.id(), g, false);
                return Err(e);
            }
        }

        for i in 0..count {
            if ownership.is_cow(mfn.add(i)) {
                log::error!(
                    "d{}: adding shared mfn {} directly to the physmap is not allowed",
                    self.id(),
                    mfn.add(i)
                );
                return Err(Error::InvalidArgument);
            }
        }

        let mut p2m = self.host().lock_write();
        let mut pod_count = 0;

        for i in 0..count {
            let g = gfn.add(i);
            let old = p2m.get_entry(g, QueryFlags::empty());
            let ot = old.p2m_type;

            if ot.is_shared() {
                // Shared again since the unshare pass.
                return Err(Error::Retry);
            }
            if ot.is_special() {
                log::error!(
                    "d{}: gfn {} ({:?},{:?},{:?}) -> ({},{:?}) not permitted",
                    self.id(),
                    g,
                    old.mfn,
                    ot,
                    old.access,
                    mfn.add(i),
                    p2m_type
                );
                self.crash();
                return Err(Error::PermissionDenied);
            } else if ot.is_ram() && !ot.is_paged() {
                if let Some(omfn) = old.mfn {
                    ownership.set_gfn_of(omfn, None);
                }
            } else if ot.is_pod() {
                pod_count += 1;
            } else if ot.is_paging() && ot != P2mType::RamPagingOut {
                // Plugging the hole a paged-out frame left.
                p2m.sub_paged();
            }
        }

        for i in 0..count {
            let m = mfn.add(i);
            if ownership.owner(m) != Some(FrameOwner::Domain(self.id())) {
                continue;
            }
            let Some(ogfn) = ownership.gfn_of(m) else {
                continue;
            };
            if ogfn == gfn.add(i) {
                continue;
            }

            log::debug!("d{}: aliased mfn {}, old gfn {}, new gfn {}", self.id(), m, ogfn, gfn.add(i));
            let old = p2m.get_entry(ogfn, QueryFlags::empty());
            if old.p2m_type.is_ram() && !old.p2m_type.is_paged() && old.mfn == Some(m) {
                self.remove_entry_locked(&mut p2m, ogfn, Some(m), PAGE_ORDER_4K)?;
            }
        }

        self.host_set_entry(&mut p2m, gfn, Some(mfn), order, p2m_type, P2mAccess::Default)?;

        if pod_count > 0 {
            p2m.sub_pod_entries(pod_count);
        }
        if !p2m_type.is_grant() {
            for i in 0..count {
                ownership.set_gfn_of(mfn.add(i), Some(gfn.add(i)));
            }
        }

        Ok(())
    }

    /// Bind owned RAM `[mfn, mfn + 2^order)` at `gfn`
    pub fn add_page(&self, gfn: Gfn, mfn: Mfn, order: u32) -> Result<()> {
        self.add_entry(gfn, mfn, order, P2mType::RamRw)
    }

    /// Clear `[gfn, gfn + 2^order)` after checking it maps `mfn` onwards
    ///
    /// With `mfn` of `None` only frames without a backing check pass. The
    /// whole range is verified before anything is changed.
    fn remove_entry_locked(
        &self,
        p2m: &mut P2mWriteGuard<'_>,
        gfn: Gfn,
        mfn: Option<Mfn>,
        order: u32,
    ) -> Result<()> {
        let count = 1u64 << order;
        log::debug!("d{}: removing gfn {} mfn {:?} order {}", self.id(), gfn, mfn, order);

        let mut i = 0;
        while i < count {
            let g = gfn.add(i);
            let entry = p2m.get_entry(g, QueryFlags::empty());
            let t = entry.p2m_type;

            if t.is_foreign() {
                return Err(Error::PermissionDenied);
            }
            if t.is_valid()
                && (mfn.is_none() || t == P2mType::MmioDirect || entry.mfn != mfn.map(|m| m.add(i)))
            {
                return Err(Error::Sequence);
            }

            i += (1u64 << entry.order) - (g.raw() & order_mask!(entry.order));
        }

        if let Some(mfn) = mfn {
            let ownership = &self.env().ownership;
            for i in 0..count {
                let t = p2m.get_entry(gfn.add(i), QueryFlags::empty()).p2m_type;
                if !t.is_special() && !t.is_shared() {
                    ownership.set_gfn_of(mfn.add(i), None);
                }
            }
        }

        self.host_set_entry(p2m, gfn, None, order, P2mType::Invalid, P2mAccess::Default)
    }

    /// Unmap `[gfn, gfn + 2^order)`, which must map `mfn` onwards
    ///
    /// A mismatch anywhere in the range fails with `Sequence` and leaves
    /// every frame untouched. Foreign entries are refused; they are removed
    /// with [`P2mDomain::remove_foreign`].
    pub fn remove_page(&self, gfn: Gfn, mfn: Option<Mfn>, order: u32) -> Result<()> {
        check_order(order)?;
        let _range = self.lock_gfn(gfn, order);
        let mut p2m = self.host().lock_write();
        self.remove_entry_locked(&mut p2m, gfn, mfn, order)
    }

    /// Retype `gfn` from `ot` to `nt`, resetting its access
    pub fn change_type_one(&self, gfn: Gfn, ot: P2mType, nt: P2mType) -> Result<()> {
        if ot.is_special() || nt.is_special() {
            return Err(Error::InvalidArgument);
        }

        let _range = self.lock_gfn(gfn, PAGE_ORDER_4K);
        let mut p2m = self.host().lock_write();
        let entry = p2m.get_entry(gfn, QueryFlags::empty());
        if entry.p2m_type != ot {
            return Err(Error::Busy);
        }
        self.host_set_entry(&mut p2m, gfn, entry.mfn, PAGE_ORDER_4K, nt, P2mAccess::Default)
    }

    fn set_typed_entry(
        &self,
        gfn: Gfn,
        mfn: Option<Mfn>,
        order: u32,
        p2m_type: P2mType,
        access: P2mAccess,
    ) -> Result<TypedSetOutcome> {
        check_order(order)?;
        let _range = self.lock_gfn(gfn, order);
        let mut p2m = self.host().lock_write();
        let access = access.resolve(p2m.default_access());

        let old = p2m.get_entry(gfn, QueryFlags::empty());
        if old.order < order {
            return Ok(TypedSetOutcome::RetryWithOrder(old.order));
        }

        if old.p2m_type.is_special() {
            // Only (almost) identical mappings may be replaced.
            if old.mfn != mfn || old.p2m_type != p2m_type {
                log::error!(
                    "d{}: gfn {} ({:?},{},{:?},{:?}) -> ({:?},{},{:?},{:?}) not permitted",
                    self.id(),
                    gfn,
                    old.mfn,
                    old.order,
                    old.p2m_type,
                    old.access,
                    mfn,
                    order,
                    p2m_type,
                    access
                );
                self.crash();
                return Err(Error::PermissionDenied);
            }
            if old.access == access {
                return Ok(TypedSetOutcome::Done);
            }
        } else if old.p2m_type.is_ram() {
            if let Some(omfn) = old.mfn {
                let ownership = &self.env().ownership;
                for i in 0..1u64 << order {
                    ownership.set_gfn_of(omfn.add(i), None);
                }
            }
        }

        log::debug!("d{}: set {:?} gfn {} mfn {:?}", self.id(), p2m_type, gfn, mfn);
        if let Err(e) = self.host_set_entry(&mut p2m, gfn, mfn, order, p2m_type, access) {
            log::error!("d{}: setting gfn {} order {} failed: {}", self.id(), gfn, order, e);
            return Err(e);
        }
        if old.p2m_type.is_pod() {
            p2m.sub_pod_entries(1u64 << order);
        }

        Ok(TypedSetOutcome::Done)
    }

    /// Map device memory `mfn` at `gfn`
    ///
    /// Superpages overlapping read-only MMIO are refused with a retry at
    /// 4K, as are superpages over finer existing mappings.
    pub fn set_mmio_entry(&self, gfn: Gfn, mfn: Mfn, order: u32) -> Result<TypedSetOutcome> {
        if order > PAGE_ORDER_4K {
            let last = mfn.raw() + order_mask!(order);
            if self.config().mmio_ro_ranges.overlaps_range(mfn.raw(), last) {
                return Ok(TypedSetOutcome::RetryWithOrder(PAGE_ORDER_4K));
            }
        }
        self.set_typed_entry(gfn, Some(mfn), order, P2mType::MmioDirect, P2mAccess::Default)
    }

    /// Unmap device memory at `gfn`
    pub fn clear_mmio_entry(&self, gfn: Gfn, mfn: Mfn, order: u32) -> Result<TypedSetOutcome> {
        let _range = self.lock_gfn(gfn, order);
        let mut p2m = self.host().lock_write();

        let entry = p2m.get_entry(gfn, QueryFlags::empty());
        if entry.order < order {
            return Ok(TypedSetOutcome::RetryWithOrder(entry.order));
        }
        let Some(actual) = entry.mfn else {
            log::warn!("d{}: no mmio mapping at gfn {}", self.id(), gfn);
            return Err(Error::InvalidArgument);
        };
        if entry.p2m_type != P2mType::MmioDirect {
            log::warn!("d{}: gfn {} is {:?}, not mmio", self.id(), gfn, entry.p2m_type);
            return Err(Error::InvalidArgument);
        }
        if actual != mfn {
            log::warn!("d{}: gfn {} maps mfn {}, not {}", self.id(), gfn, actual, mfn);
        }

        self.host_set_entry(&mut p2m, gfn, None, order, P2mType::Invalid, P2mAccess::Default)?;
        Ok(TypedSetOutcome::Done)
    }

    /// Map another domain's frame `mfn` at `gfn`
    ///
    /// The caller holds a reference on `mfn` that the mapping keeps.
    pub fn set_foreign_entry(&self, gfn: Gfn, mfn: Mfn) -> Result<()> {
        self.set_typed_entry(gfn, Some(mfn), PAGE_ORDER_4K, P2mType::MapForeign, P2mAccess::Default)
            .map(|_| ())
    }

    /// Largest order usable for MMIO at `start` with `nr` frames left
    fn mmio_order(&self, start: u64, nr: u64) -> u32 {
        // 1G MMIO mappings would make the M2P fixups in typed sets too long.
        if start & order_mask!(PAGE_ORDER_2M) != 0 || nr >> PAGE_ORDER_2M == 0 {
            PAGE_ORDER_4K
        } else if self.host().caps().contains(BackendCaps::SUPERPAGE_2M) {
            PAGE_ORDER_2M
        } else {
            PAGE_ORDER_4K
        }
    }

    fn mmio_regions(
        &self,
        gfn: Gfn,
        nr: u64,
        mfn: Mfn,
        op: impl Fn(Gfn, Mfn, u32) -> Result<TypedSetOutcome>,
    ) -> Result<Progress> {
        let max_iter = self.config().mmio_max_iter;
        let mut i = 0;
        let mut iter = 0;

        while i < nr && iter < max_iter {
            let mut order = self.mmio_order(gfn.add(i).raw() | mfn.add(i).raw(), nr - i);
            loop {
                match op(gfn.add(i), mfn.add(i), order) {
                    Ok(TypedSetOutcome::Done) => break,
                    Ok(TypedSetOutcome::RetryWithOrder(smaller)) if smaller < order => {
                        order = smaller;
                    }
                    Ok(TypedSetOutcome::RetryWithOrder(smaller)) => {
                        log::error!(
                            "d{}: mmio at gfn {} asked to retry with order {} after {}",
                            self.id(),
                            gfn.add(i),
                            smaller,
                            order
                        );
                        return Err(Error::InvalidState);
                    }
                    Err(e) if i == 0 => return Err(e),
                    Err(_) => return Ok(Progress::Preempted { next: i }),
                }
            }
            i += 1u64 << order;
            iter += 1;
        }

        Ok(if i >= nr { Progress::Done } else { Progress::Preempted { next: i } })
    }

    /// Map `nr` frames of device memory from `mfn` at `gfn`
    ///
    /// Stops after the configured iteration cap; `next` is the number of
    /// frames mapped so far.
    pub fn map_mmio_regions(&self, gfn: Gfn, nr: u64, mfn: Mfn) -> Result<Progress> {
        self.mmio_regions(gfn, nr, mfn, |g, m, order| self.set_mmio_entry(g, m, order))
    }

    /// Unmap `nr` frames of device memory at `gfn`
    pub fn unmap_mmio_regions(&self, gfn: Gfn, nr: u64, mfn: Mfn) -> Result<Progress> {
        self.mmio_regions(gfn, nr, mfn, |g, m, order| self.clear_mmio_entry(g, m, order))
    }

    /// Identity map `gfn` for a device reserved region
    ///
    /// A conflicting mapping is refused unless `relaxed`.
    pub fn set_identity_entry(&self, gfn: Gfn, access: P2mAccess, relaxed: bool) -> Result<()> {
        let _range = self.lock_gfn(gfn, PAGE_ORDER_4K);
        let mut p2m = self.host().lock_write();
        let access = access.resolve(p2m.default_access());
        let identity = Mfn::new(gfn.raw());

        let entry = p2m.get_entry(gfn, QueryFlags::empty());
        match entry.p2m_type {
            P2mType::Invalid | P2mType::MmioDm => self.host_set_entry(
                &mut p2m,
                gfn,
                Some(identity),
                PAGE_ORDER_4K,
                P2mType::MmioDirect,
                access,
            ),
            P2mType::MmioDirect if entry.mfn == Some(identity) && entry.access == access => Ok(()),
            _ => {
                log::warn!(
                    "d{}: cannot identity map gfn {}, already mapped to {:?}",
                    self.id(),
                    gfn,
                    entry.mfn
                );
                if relaxed {
                    Ok(())
                } else {
                    Err(Error::PermissionDenied)
                }
            }
        }
    }

    /// Remove an identity mapping of `gfn`
    ///
    /// Anything other than an identity mapping is left alone.
    pub fn clear_identity_entry(&self, gfn: Gfn) -> Result<()> {
        let _range = self.lock_gfn(gfn, PAGE_ORDER_4K);
        let mut p2m = self.host().lock_write();

        let entry = p2m.get_entry(gfn, QueryFlags::empty());
        if entry.p2m_type == P2mType::MmioDirect && entry.mfn == Some(Mfn::new(gfn.raw())) {
            return self.host_set_entry(
                &mut p2m,
                gfn,
                None,
                PAGE_ORDER_4K,
                P2mType::Invalid,
                P2mAccess::Default,
            );
        }

        log::warn!(
            "d{}: non-identity mapping of gfn {} ({:?}) not cleared",
            self.id(),
            gfn,
            entry.mfn
        );
        Ok(())
    }

    /// Point shared frame `gfn` at `mfn`
    ///
    /// Used by the sharing collaborator; `gfn` must already be shared.
    pub fn set_shared_entry(&self, gfn: Gfn, mfn: Mfn) -> Result<()> {
        let ownership = &self.env().ownership;
        let _range = self.lock_gfn(gfn, PAGE_ORDER_4K);
        let mut p2m = self.host().lock_write();

        let old = p2m.get_entry(gfn, QueryFlags::empty());
        let Some(omfn) = old.mfn.filter(|_| old.p2m_type.is_shared()) else {
            return Err(Error::InvalidArgument);
        };
        // A frame still shared elsewhere keeps its M2P entry.
        if !ownership.is_cow(omfn) {
            ownership.set_gfn_of(omfn, None);
        }

        log::debug!("d{}: set shared gfn {} mfn {}", self.id(), gfn, mfn);
        let r = self.host_set_entry(
            &mut p2m,
            gfn,
            Some(mfn),
            PAGE_ORDER_4K,
            P2mType::RamShared,
            P2mAccess::Default,
        );
        if let Err(e) = r {
            log::error!("d{}: sharing gfn {} with mfn {} failed: {}", self.id(), gfn, mfn, e);
        }
        r
    }

    /// Map frame `fgfn` of domain `fdom` at `gpfn`
    ///
    /// Only the hardware domain may do this. Whatever `gpfn` mapped before
    /// is removed first. The mapping holds a reference on the foreign
    /// frame until [`P2mDomain::remove_foreign`].
    pub fn add_foreign(
        &self,
        registry: &DomainRegistry,
        fdom: DomainId,
        fgfn: Gfn,
        gpfn: Gfn,
    ) -> Result<()> {
        if !self.config().hardware_domain {
            return Err(Error::PermissionDenied);
        }
        if fdom == self.id() {
            return Err(Error::InvalidArgument);
        }
        let foreign = registry.get(fdom).ok_or(Error::NotFound)?;
        let ownership = &self.env().ownership;

        let entry = foreign.get_page_from_gfn(fgfn, QueryFlags::ALLOC).ok_or(Error::InvalidArgument)?;
        let Some(mfn) = entry.mfn else {
            return Err(Error::InvalidArgument);
        };
        let t = entry.p2m_type;
        if !t.is_ram() || t.is_shared() || t.is_hole() {
            ownership.put_page(mfn);
            return Err(Error::InvalidArgument);
        }

        // Held until the new mapping is in place.
        let prev = self.get_gfn(gpfn);
        let removed = match prev.mfn {
            Some(_) if prev.p2m_type.is_foreign() => self.remove_foreign(gpfn),
            Some(pmfn) => self.remove_page(gpfn, Some(pmfn), PAGE_ORDER_4K),
            None => Ok(()),
        };

        let r = removed.and_then(|_| self.set_foreign_entry(gpfn, mfn));
        if let Err(e) = r {
            log::warn!(
                "d{}: foreign map of d{} gfn {} at {} failed: {}",
                self.id(),
                fdom,
                fgfn,
                gpfn,
                e
            );
            ownership.put_page(mfn);
        }
        prev.put();
        r
    }

    /// Remove a foreign mapping at `gpfn` and drop its reference
    pub fn remove_foreign(&self, gpfn: Gfn) -> Result<()> {
        let _range = self.lock_gfn(gpfn, PAGE_ORDER_4K);
        let mut p2m = self.host().lock_write();

        let entry = p2m.get_entry(gpfn, QueryFlags::empty());
        let Some(mfn) = entry.mfn.filter(|_| entry.p2m_type.is_foreign()) else {
            return Err(Error::InvalidArgument);
        };
        self.host_set_entry(&mut p2m, gpfn, None, PAGE_ORDER_4K, P2mType::Invalid, P2mAccess::Default)?;
        self.env().ownership.put_page(mfn);
        Ok(())
    }

    /// Mark `[gfn, gfn + 2^order)` as populate-on-demand
    ///
    /// Refused with `Busy` if any frame is RAM or a special mapping.
    pub fn mark_populate_on_demand(&self, gfn: Gfn, order: u32) -> Result<()> {
        check_order(order)?;
        let _range = self.lock_gfn(gfn, order);
        let mut p2m = self.host().lock_write();

        let mut pod_count = 0;
        for i in 0..1u64 << order {
            let t = p2m.get_entry(gfn.add(i), QueryFlags::empty()).p2m_type;
            if t.is_ram() || t.is_special() {
                return Err(Error::Busy);
            }
            if t.is_pod() {
                pod_count += 1;
            }
        }

        self.host_set_entry(
            &mut p2m,
            gfn,
            None,
            order,
            P2mType::PopulateOnDemand,
            P2mAccess::Default,
        )?;
        p2m.add_pod_entries((1u64 << order) - pod_count);
        Ok(())
    }

    /// Complete paging out `gfn`, which must be selected for it
    ///
    /// The backing frame is unhooked and its reference dropped.
    pub fn page_out(&self, gfn: Gfn) -> Result<()> {
        let _range = self.lock_gfn(gfn, PAGE_ORDER_4K);
        let mut p2m = self.host().lock_write();

        let entry = p2m.get_entry(gfn, QueryFlags::empty());
        if entry.p2m_type != P2mType::RamPagingOut {
            return Err(Error::Busy);
        }
        self.host_set_entry(&mut p2m, gfn, None, PAGE_ORDER_4K, P2mType::RamPaged, P2mAccess::Default)?;
        p2m.add_paged();

        if let Some(mfn) = entry.mfn {
            let ownership = &self.env().ownership;
            ownership.set_gfn_of(mfn, None);
            ownership.put_page(mfn);
        }
        Ok(())
    }
}
