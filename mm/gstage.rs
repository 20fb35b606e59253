//! G-stage Address Translation
//!
//! Software model of RISC-V G-stage (Stage 2) paging structures used as a
//! translation backend. Tables are four levels of 512 entries indexed by the
//! guest frame number; leaves may sit at level 2 (1GB), level 1 (2MB) or
//! level 0 (4KB). The P2M type and access of a leaf live in the
//! software-available high bits so they survive for entries the hardware
//! must not see (paged out, populate-on-demand, emulated MMIO).

use crate::mm::{Gfn, Mfn, PAGE_ORDER_1G};
use crate::p2m::{
    BackendCaps, P2mAccess, P2mBackend, P2mEntry, P2mType, Paging, QueryFlags, ViewId,
};
use crate::sync::SpinLock;
use crate::{order_mask, Error, Result};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// G-stage page table entry bit fields
pub mod gstage_pte {
    pub const V: u64 = 0x0000_0000_0000_0001; // Valid bit
    pub const R: u64 = 0x0000_0000_0000_0002; // Read bit
    pub const W: u64 = 0x0000_0000_0000_0004; // Write bit
    pub const X: u64 = 0x0000_0000_0000_0008; // Execute bit
    pub const U: u64 = 0x0000_0000_0000_0010; // User mode bit (always 1 for G-stage leaves)
    pub const G: u64 = 0x0000_0000_0000_0020; // Global bit
    pub const A: u64 = 0x0000_0000_0000_0040; // Accessed bit
    pub const D: u64 = 0x0000_0000_0000_0080; // Dirty bit

    // RSW bits (Reserved for Software)
    pub const SW_LEAF: u64 = 0x0000_0000_0000_0100;
    pub const MFN_VALID: u64 = 0x0000_0000_0000_0200;

    // Physical page number field
    pub const PPN_SHIFT: u64 = 10;
    pub const PPN_MASK: u64 = 0x003F_FFFF_FFFF_FC00;

    // Software fields above the PPN
    pub const TYPE_SHIFT: u64 = 54;
    pub const TYPE_MASK: u64 = 0x1F << TYPE_SHIFT;
    pub const ACCESS_SHIFT: u64 = 59;
    pub const ACCESS_MASK: u64 = 0xF << ACCESS_SHIFT;

    pub const PERM_BITS: u64 = R | W | X;
}

use gstage_pte::*;

/// Entries per paging structure
const ENTRIES: usize = 512;

/// Index bits per level
const LEVEL_BITS: u32 = 9;

/// Number of levels
const LEVELS: u32 = 4;

/// Guest frame number bits covered by the root
const GFN_BITS: u32 = LEVEL_BITS * LEVELS;

type PageTable = [GStagePte; ENTRIES];
type Tables = BTreeMap<u64, Box<PageTable>>;

/// G-stage page table entry format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GStagePte {
    /// Raw PTE value
    pub bits: u64,
}

impl GStagePte {
    /// Create an invalid PTE
    pub const fn invalid() -> Self {
        Self { bits: 0 }
    }

    /// Create a branch PTE (points to next level page table)
    pub const fn branch(table: Mfn) -> Self {
        Self { bits: ((table.raw() << PPN_SHIFT) & PPN_MASK) | V }
    }

    /// Create a leaf PTE
    ///
    /// Hardware permissions are the intersection of what the type allows
    /// and the requested access; a leaf without permissions keeps V clear.
    pub fn leaf(mfn: Option<Mfn>, p2m_type: P2mType, access: P2mAccess) -> Self {
        let mut bits = SW_LEAF
            | ((p2m_type.raw() as u64) << TYPE_SHIFT)
            | ((access.raw() as u64) << ACCESS_SHIFT);

        if let Some(mfn) = mfn {
            bits |= MFN_VALID | ((mfn.raw() << PPN_SHIFT) & PPN_MASK);

            let mut perms = type_perms(p2m_type) & access_perms(access);
            // Write-only leaves are reserved encodings.
            if perms & R == 0 {
                perms &= !W;
            }
            if perms != 0 {
                bits |= V | U | A | perms;
                if perms & W != 0 {
                    bits |= D;
                }
            }
        }

        Self { bits }
    }

    /// Check if the hardware may use this PTE
    pub const fn is_valid(&self) -> bool {
        (self.bits & V) != 0
    }

    /// Check if this PTE is a leaf (possibly invisible to hardware)
    pub const fn is_leaf(&self) -> bool {
        (self.bits & SW_LEAF) != 0
    }

    /// Check if this PTE is a branch (points to next level)
    pub const fn is_branch(&self) -> bool {
        self.is_valid() && !self.is_leaf()
    }

    /// Get the physical page number
    pub const fn ppn(&self) -> u64 {
        (self.bits & PPN_MASK) >> PPN_SHIFT
    }

    /// Next-level table of a branch
    pub const fn next_table(&self) -> Mfn {
        Mfn::new(self.ppn())
    }

    /// Host frame of a leaf
    pub fn mfn(&self) -> Option<Mfn> {
        (self.is_leaf() && self.bits & MFN_VALID != 0).then(|| Mfn::new(self.ppn()))
    }

    /// P2M type of a leaf
    pub fn p2m_type(&self) -> P2mType {
        if !self.is_leaf() {
            return P2mType::Invalid;
        }
        P2mType::from_raw(((self.bits & TYPE_MASK) >> TYPE_SHIFT) as u8).unwrap_or(P2mType::Broken)
    }

    /// Access of a leaf
    pub fn access(&self) -> P2mAccess {
        P2mAccess::from_raw(((self.bits & ACCESS_MASK) >> ACCESS_SHIFT) as u8)
            .unwrap_or(P2mAccess::N)
    }

    /// Hardware permission bits
    pub const fn perms(&self) -> u64 {
        if self.is_valid() {
            self.bits & PERM_BITS
        } else {
            0
        }
    }

    /// Same leaf with a different type
    fn retyped(&self, p2m_type: P2mType) -> Self {
        Self::leaf(self.mfn(), p2m_type, self.access())
    }

    /// Leaf covering the frames `n` frames into this one
    fn offset(&self, n: u64) -> Self {
        match self.mfn() {
            Some(mfn) => Self {
                bits: (self.bits & !PPN_MASK) | ((mfn.add(n).raw() << PPN_SHIFT) & PPN_MASK),
            },
            None => *self,
        }
    }
}

/// Permissions a type allows at most
fn type_perms(p2m_type: P2mType) -> u64 {
    match p2m_type {
        P2mType::RamRw => R | W | X,
        P2mType::RamLogdirty | P2mType::RamRo | P2mType::RamShared => R | X,
        P2mType::Grant | P2mType::MapForeign | P2mType::MmioDirect => R | W,
        _ => 0,
    }
}

/// Permissions an access value grants
fn access_perms(access: P2mAccess) -> u64 {
    if access == P2mAccess::Default {
        return R | W | X;
    }
    let mut perms = 0;
    if access.readable() {
        perms |= R;
    }
    if access.writable() {
        perms |= W;
    }
    if access.executable() {
        perms |= X;
    }
    perms
}

/// Index of `gfn` in a table at `level`
const fn index(gfn: u64, level: u32) -> usize {
    ((gfn >> (LEVEL_BITS * level)) & (ENTRIES as u64 - 1)) as usize
}

fn table_mut(tables: &mut Tables, mfn: Mfn) -> Result<&mut PageTable> {
    tables.get_mut(&mfn.raw()).map(|t| &mut **t).ok_or(Error::InvalidState)
}

fn new_table(tables: &mut Tables, paging: &mut Paging<'_>) -> Result<Mfn> {
    let mfn = paging.alloc_page()?;
    tables.insert(mfn.raw(), Box::new([GStagePte::invalid(); ENTRIES]));
    Ok(mfn)
}

/// Replace the superpage leaf at `table[idx]` by a table of smaller leaves
fn split(
    tables: &mut Tables,
    paging: &mut Paging<'_>,
    table: Mfn,
    level: u32,
    idx: usize,
) -> Result<Mfn> {
    let pte = table_mut(tables, table)?[idx];
    let child = new_table(tables, paging)?;
    let step = 1u64 << (LEVEL_BITS * (level - 1));
    for (i, entry) in table_mut(tables, child)?.iter_mut().enumerate() {
        *entry = pte.offset(i as u64 * step);
    }
    table_mut(tables, table)?[idx] = GStagePte::branch(child);
    Ok(child)
}

/// Return a subtree of paging structures to the pool
fn free_subtree(tables: &mut Tables, paging: &mut Paging<'_>, top: Mfn) {
    let mut stack = vec![top];
    while let Some(mfn) = stack.pop() {
        if let Some(table) = tables.remove(&mfn.raw()) {
            stack.extend(table.iter().filter(|e| e.is_branch()).map(|e| e.next_table()));
        }
        paging.free_page(mfn);
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "riscv64", target_os = "none"))] {
        fn gstage_fence() {
            // SAFETY: invalidates guest-physical translations, no memory is touched.
            unsafe { core::arch::asm!("hfence.gvma zero, zero") }
        }
    } else if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        fn gstage_fence() {
            // SAFETY: stage 2 TLB maintenance for the current VMID only.
            unsafe { core::arch::asm!("dsb ishst", "tlbi vmalls12e1is", "dsb ish", "isb") }
        }
    } else {
        fn gstage_fence() {}
    }
}

/// Software G-stage backend
///
/// Paging-structure frames come from the table's paging pool; their contents
/// are kept here, keyed by frame number. One backend instance must only be
/// fed frames from pools that do not overlap.
pub struct GStageBackend {
    /// Contents of every paging structure
    tables: SpinLock<Tables>,
    /// Supported superpage sizes
    caps: BackendCaps,
    /// TLB flushes issued
    flushes: AtomicU64,
}

impl GStageBackend {
    /// Create a backend supporting 2MB and 1GB leaves
    pub fn new() -> Self {
        Self::with_caps(BackendCaps::all())
    }

    /// Create a backend with restricted superpage support
    pub fn with_caps(caps: BackendCaps) -> Self {
        Self {
            tables: SpinLock::new(BTreeMap::new()),
            caps,
            flushes: AtomicU64::new(0),
        }
    }

    /// Number of TLB flushes issued so far
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Number of live paging structures
    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }
}

impl Default for GStageBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl P2mBackend for GStageBackend {
    fn name(&self) -> &'static str {
        "gstage"
    }

    fn capabilities(&self) -> BackendCaps {
        self.caps
    }

    fn alloc_table(&self, paging: &mut Paging<'_>) -> Result<Mfn> {
        let mut tables = self.tables.lock();
        new_table(&mut tables, paging)
    }

    fn get_entry(&self, root: Mfn, gfn: Gfn, _query: QueryFlags) -> P2mEntry {
        let gfn = gfn.raw();
        if gfn >> GFN_BITS != 0 {
            return P2mEntry::hole(PAGE_ORDER_1G);
        }

        let tables = self.tables.lock();
        let mut table = root;
        let mut level = LEVELS - 1;
        loop {
            let Some(entries) = tables.get(&table.raw()) else {
                return P2mEntry::hole(0);
            };
            let pte = entries[index(gfn, level)];
            let order = level * LEVEL_BITS;

            if pte.is_branch() && level > 0 {
                table = pte.next_table();
                level -= 1;
                continue;
            }

            if pte.is_leaf() {
                let offset = gfn & order_mask!(order);
                return P2mEntry {
                    mfn: pte.mfn().map(|m| m.add(offset)),
                    p2m_type: pte.p2m_type(),
                    access: pte.access(),
                    order,
                };
            }

            return P2mEntry::hole(order.min(PAGE_ORDER_1G));
        }
    }

    fn set_entry(
        &self,
        paging: &mut Paging<'_>,
        root: Mfn,
        gfn: Gfn,
        mfn: Option<Mfn>,
        order: u32,
        p2m_type: P2mType,
        access: P2mAccess,
    ) -> Result<()> {
        if order % LEVEL_BITS != 0 || order > PAGE_ORDER_1G {
            return Err(Error::InvalidArgument);
        }
        if gfn.raw() >> GFN_BITS != 0 || !gfn.is_aligned(order) {
            return Err(Error::InvalidArgument);
        }
        if mfn.map_or(false, |m| !m.is_aligned(order)) {
            return Err(Error::InvalidArgument);
        }

        let new = if mfn.is_none() && p2m_type == P2mType::Invalid {
            GStagePte::invalid()
        } else {
            GStagePte::leaf(mfn, p2m_type, access)
        };

        let target = order / LEVEL_BITS;
        let mut tables = self.tables.lock();
        let mut table = root;
        let mut level = LEVELS - 1;

        while level > target {
            let idx = index(gfn.raw(), level);
            let pte = table_mut(&mut tables, table)?[idx];
            table = if pte.is_branch() {
                pte.next_table()
            } else if pte.is_leaf() {
                split(&mut tables, paging, table, level, idx)?
            } else if new == GStagePte::invalid() {
                // Clearing something that was never mapped.
                return Ok(());
            } else {
                let child = new_table(&mut tables, paging)?;
                table_mut(&mut tables, table)?[idx] = GStagePte::branch(child);
                child
            };
            level -= 1;
        }

        let idx = index(gfn.raw(), target);
        let old = core::mem::replace(&mut table_mut(&mut tables, table)?[idx], new);

        if old.is_branch() {
            free_subtree(&mut tables, paging, old.next_table());
            paging.request_flush();
        } else if old.is_valid() && old != new {
            paging.request_flush();
        }

        Ok(())
    }

    fn change_type_range(
        &self,
        paging: &mut Paging<'_>,
        root: Mfn,
        old: P2mType,
        new: P2mType,
        first: Gfn,
        last: Gfn,
    ) -> Result<()> {
        let (first, last) = (first.raw(), last.raw());
        let mut tables = self.tables.lock();
        let mut gfn = first;

        while gfn <= last && gfn >> GFN_BITS == 0 {
            let mut table = root;
            let mut level = LEVELS - 1;
            let mut pte = table_mut(&mut tables, table)?[index(gfn, level)];
            while pte.is_branch() && level > 0 {
                table = pte.next_table();
                level -= 1;
                pte = table_mut(&mut tables, table)?[index(gfn, level)];
            }

            let idx = index(gfn, level);
            let span = 1u64 << (level * LEVEL_BITS);
            let base = gfn & !(span - 1);

            if pte.is_leaf() && pte.p2m_type() == old {
                if base < first || base + span - 1 > last {
                    // Superpage straddles the range, retype its pieces.
                    split(&mut tables, paging, table, level, idx)?;
                    continue;
                }
                let retyped = pte.retyped(new);
                if pte.is_valid() && retyped != pte {
                    paging.request_flush();
                }
                table_mut(&mut tables, table)?[idx] = retyped;
            }

            gfn = match base.checked_add(span) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(())
    }

    fn change_type_global(&self, paging: &mut Paging<'_>, root: Mfn, old: P2mType, new: P2mType) {
        let mut tables = self.tables.lock();
        let mut stack = vec![root];

        while let Some(mfn) = stack.pop() {
            let Some(table) = tables.get_mut(&mfn.raw()) else {
                continue;
            };
            for pte in table.iter_mut() {
                if pte.is_branch() {
                    stack.push(pte.next_table());
                } else if pte.is_leaf() && pte.p2m_type() == old {
                    let retyped = pte.retyped(new);
                    if pte.is_valid() && retyped != *pte {
                        paging.request_flush();
                    }
                    *pte = retyped;
                }
            }
        }
    }

    fn clear_table(&self, root: Mfn) {
        if let Some(table) = self.tables.lock().get_mut(&root.raw()) {
            table.fill(GStagePte::invalid());
        }
    }

    fn release_table_page(&self, mfn: Mfn) {
        self.tables.lock().remove(&mfn.raw());
    }

    fn flush_tlb(&self, view: ViewId) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: G-stage TLB flush", view);
        gstage_fence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{FramePool, PagingPool, PAGE_ORDER_2M, PAGE_ORDER_4K};
    use alloc::vec::Vec;
    use test_case::test_case;

    struct Fixture {
        backend: GStageBackend,
        pool: FramePool,
        pages: Vec<Mfn>,
        need_flush: bool,
        root: Mfn,
    }

    impl Fixture {
        fn new() -> Self {
            let mut fx = Self {
                backend: GStageBackend::new(),
                pool: FramePool::new(Mfn::new(0x10_0000), 64),
                pages: Vec::new(),
                need_flush: false,
                root: Mfn::new(0),
            };
            let root = {
                let mut paging =
                    Paging::new(ViewId::host(1), &mut fx.pages, &fx.pool, &mut fx.need_flush);
                fx.backend.alloc_table(&mut paging).unwrap()
            };
            fx.root = root;
            fx
        }

        fn set(&mut self, gfn: u64, mfn: Option<u64>, order: u32, t: P2mType) -> Result<()> {
            let root = self.root;
            let mut paging = Paging::new(
                ViewId::host(1),
                &mut self.pages,
                &self.pool,
                &mut self.need_flush,
            );
            self.backend.set_entry(
                &mut paging,
                root,
                Gfn::new(gfn),
                mfn.map(Mfn::new),
                order,
                t,
                P2mAccess::Rwx,
            )
        }

        fn get(&self, gfn: u64) -> P2mEntry {
            self.backend.get_entry(self.root, Gfn::new(gfn), QueryFlags::empty())
        }
    }

    #[test_case(P2mType::RamRw, P2mAccess::Rwx, R | W | X ; "ram rw")]
    #[test_case(P2mType::RamLogdirty, P2mAccess::Rwx, R | X ; "logdirty drops write")]
    #[test_case(P2mType::MmioDirect, P2mAccess::Rwx, R | W ; "mmio no exec")]
    #[test_case(P2mType::RamRw, P2mAccess::Rx, R | X ; "access restricts")]
    #[test_case(P2mType::RamRw, P2mAccess::W, 0 ; "write only is reserved")]
    #[test_case(P2mType::PopulateOnDemand, P2mAccess::Rwx, 0 ; "pod not present")]
    fn test_leaf_permissions(t: P2mType, a: P2mAccess, perms: u64) {
        let pte = GStagePte::leaf(Some(Mfn::new(0x1234)), t, a);
        assert_eq!(pte.perms(), perms);
        assert_eq!(pte.is_valid(), perms != 0);
        assert_eq!(pte.p2m_type(), t);
        assert_eq!(pte.access(), a);
        assert_eq!(pte.mfn(), Some(Mfn::new(0x1234)));
    }

    #[test]
    fn test_map_and_lookup_4k() {
        let mut fx = Fixture::new();
        fx.set(10, Some(1000), PAGE_ORDER_4K, P2mType::RamRw).unwrap();

        let entry = fx.get(10);
        assert_eq!(entry.mfn, Some(Mfn::new(1000)));
        assert_eq!(entry.p2m_type, P2mType::RamRw);
        assert_eq!(entry.order, PAGE_ORDER_4K);
        assert!(!fx.get(11).is_present());
        // Installing into empty slots never needs a flush.
        assert!(!fx.need_flush);
    }

    #[test]
    fn test_superpage_lookup_and_split() {
        let mut fx = Fixture::new();
        fx.set(0x200, Some(0x4_0000), PAGE_ORDER_2M, P2mType::RamRw).unwrap();

        let entry = fx.get(0x205);
        assert_eq!(entry.mfn, Some(Mfn::new(0x4_0005)));
        assert_eq!(entry.order, PAGE_ORDER_2M);

        // Punching a 4K hole splits the superpage.
        fx.set(0x205, None, PAGE_ORDER_4K, P2mType::Invalid).unwrap();
        assert!(fx.need_flush);
        assert!(!fx.get(0x205).is_present());
        let neighbour = fx.get(0x206);
        assert_eq!(neighbour.mfn, Some(Mfn::new(0x4_0006)));
        assert_eq!(neighbour.order, PAGE_ORDER_4K);
    }

    #[test]
    fn test_superpage_replaces_subtree() {
        let mut fx = Fixture::new();
        fx.set(0x400, Some(1), PAGE_ORDER_4K, P2mType::RamRw).unwrap();
        let before = fx.pool.allocated_frames();

        fx.set(0x400, Some(0x8_0000), PAGE_ORDER_2M, P2mType::RamRw).unwrap();
        assert_eq!(fx.pool.allocated_frames(), before - 1);
        assert_eq!(fx.pages.len(), fx.pool.allocated_frames());
        assert_eq!(fx.get(0x401).mfn, Some(Mfn::new(0x8_0001)));
    }

    #[test]
    fn test_misaligned_superpage_rejected() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.set(0x201, Some(0x4_0000), PAGE_ORDER_2M, P2mType::RamRw),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            fx.set(0x200, Some(0x4_0001), PAGE_ORDER_2M, P2mType::RamRw),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_change_type_range_splits_straddling_superpage() {
        let mut fx = Fixture::new();
        fx.set(0, Some(0x4_0000), PAGE_ORDER_2M, P2mType::RamRw).unwrap();
        let root = fx.root;
        {
            let Fixture { backend, pool, pages, need_flush, .. } = &mut fx;
            let mut paging = Paging::new(ViewId::host(1), pages, &*pool, need_flush);
            backend
                .change_type_range(
                    &mut paging,
                    root,
                    P2mType::RamRw,
                    P2mType::RamLogdirty,
                    Gfn::new(4),
                    Gfn::new(7),
                )
                .unwrap();
        }
        assert!(fx.need_flush);
        assert_eq!(fx.get(3).p2m_type, P2mType::RamRw);
        assert_eq!(fx.get(4).p2m_type, P2mType::RamLogdirty);
        assert_eq!(fx.get(7).p2m_type, P2mType::RamLogdirty);
        assert_eq!(fx.get(8).p2m_type, P2mType::RamRw);
        assert_eq!(fx.get(5).mfn, Some(Mfn::new(0x4_0005)));
    }

    #[test]
    fn test_change_type_global() {
        let mut fx = Fixture::new();
        fx.set(1, Some(1), PAGE_ORDER_4K, P2mType::RamRw).unwrap();
        fx.set(0x4_0000, Some(0x4_0000), PAGE_ORDER_1G, P2mType::RamRw).unwrap();
        fx.set(2, Some(2), PAGE_ORDER_4K, P2mType::RamRo).unwrap();
        let root = fx.root;
        {
            let Fixture { backend, pool, pages, need_flush, .. } = &mut fx;
            let mut paging = Paging::new(ViewId::host(1), pages, &*pool, need_flush);
            backend.change_type_global(&mut paging, root, P2mType::RamRw, P2mType::RamLogdirty);
        }
        assert_eq!(fx.get(1).p2m_type, P2mType::RamLogdirty);
        assert_eq!(fx.get(0x4_1234).p2m_type, P2mType::RamLogdirty);
        assert_eq!(fx.get(0x4_1234).order, PAGE_ORDER_1G);
        assert_eq!(fx.get(2).p2m_type, P2mType::RamRo);
    }

    #[test]
    fn test_clear_and_release() {
        let mut fx = Fixture::new();
        fx.set(0x1000, Some(7), PAGE_ORDER_4K, P2mType::RamRw).unwrap();
        assert_eq!(fx.backend.table_count(), 4);

        fx.backend.clear_table(fx.root);
        assert!(!fx.get(0x1000).is_present());

        for mfn in fx.pages.drain(..) {
            fx.backend.release_table_page(mfn);
            fx.pool.free_page(mfn);
        }
        assert_eq!(fx.backend.table_count(), 0);
        assert_eq!(fx.pool.allocated_frames(), 0);
    }

    #[test]
    fn test_flush_counter() {
        let backend = GStageBackend::new();
        backend.flush_tlb(ViewId::host(0));
        backend.flush_tlb(ViewId::host(0));
        assert_eq!(backend.flush_count(), 2);
    }
}
