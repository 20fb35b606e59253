//! Translation tables
//!
//! One [`P2mTable`] per view. All reads go through a [`P2mReadGuard`], all
//! mutation through a [`P2mWriteGuard`]. Mutations only record that a TLB
//! flush is needed; the write guard performs at most one flush when it is
//! dropped, while the lock is still held, on every exit path.

use crate::mm::{Gfn, Mfn, PagingPool, PAGE_ORDER_1G, PAGE_ORDER_2M, PAGE_ORDER_4K};
use crate::p2m::{
    check_order, BackendCaps, LogDirtyTracker, P2mAccess, P2mBackend, P2mEntry, P2mType, Paging, QueryFlags,
    ViewId,
};
use crate::p2m::gfn_lock::GfnLockManager;
use crate::sync::{CpuId, RwLock, MAX_CPUS, RwLockReadGuard, RwLockWriteGuard};
use crate::{order_mask, Error, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Remapped-frame bound of a view with nothing remapped
const NO_REMAP: (u64, u64) = (u64::MAX, 0);

/// Mutable state of a view, guarded by the table lock
#[derive(Debug)]
pub struct TableState {
    /// Root paging structure
    root: Option<Mfn>,
    /// Paging-structure frames owned by the view
    pages: Vec<Mfn>,
    /// Access applied where none is given
    default_access: P2mAccess,
    /// Log-dirty tracking, absent for inactive alternate views
    logdirty: Option<LogDirtyTracker>,
    /// A TLB flush is owed before the lock is released
    need_flush: bool,
    /// Highest guest frame ever mapped
    max_mapped_gfn: u64,
    /// Base address a nested view is assigned to
    np2m_base: Option<u64>,
    /// Bumped whenever a nested view is flushed
    np2m_generation: u64,
    /// Lowest frame an alternate view remapped to
    min_remapped_gfn: u64,
    /// Highest frame an alternate view remapped to
    max_remapped_gfn: u64,
    /// Nested views are flushed by the caller afterwards
    defer_nested_flush: bool,
    /// Populate-on-demand entries in the view
    pod_entry_count: u64,
    /// Paged-out frames
    paged_count: u64,
}

impl TableState {
    fn new(default_access: P2mAccess, logdirty: Option<LogDirtyTracker>) -> Self {
        Self {
            root: None,
            pages: Vec::new(),
            default_access,
            logdirty,
            need_flush: false,
            max_mapped_gfn: 0,
            np2m_base: None,
            np2m_generation: 0,
            min_remapped_gfn: NO_REMAP.0,
            max_remapped_gfn: NO_REMAP.1,
            defer_nested_flush: false,
            pod_entry_count: 0,
            paged_count: 0,
        }
    }

    /// Root paging structure, if allocated
    pub fn root(&self) -> Option<Mfn> {
        self.root
    }

    /// Number of paging-structure frames owned by the view
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Default access of the view
    pub fn default_access(&self) -> P2mAccess {
        self.default_access
    }

    /// Log-dirty tracker of the view
    pub fn logdirty(&self) -> Option<&LogDirtyTracker> {
        self.logdirty.as_ref()
    }

    /// Highest guest frame mapped so far
    pub fn max_mapped_gfn(&self) -> u64 {
        self.max_mapped_gfn
    }

    /// Nested base address, `None` when the slot is unassigned
    pub fn np2m_base(&self) -> Option<u64> {
        self.np2m_base
    }

    /// Nested flush generation
    pub fn np2m_generation(&self) -> u64 {
        self.np2m_generation
    }

    /// `(min, max)` remapped frames; `min > max` means none
    pub fn remapped_bounds(&self) -> (u64, u64) {
        (self.min_remapped_gfn, self.max_remapped_gfn)
    }

    /// Nested flushes are currently deferred
    pub fn defer_nested_flush(&self) -> bool {
        self.defer_nested_flush
    }

    /// Populate-on-demand entries
    pub fn pod_entry_count(&self) -> u64 {
        self.pod_entry_count
    }

    /// Paged-out frames
    pub fn paged_count(&self) -> u64 {
        self.paged_count
    }

    /// A TLB flush is pending
    pub fn flush_pending(&self) -> bool {
        self.need_flush
    }
}

/// Anything an entry can be read from while its lock is held
pub trait EntrySource {
    /// Look up `gfn`
    fn lookup(&self, gfn: Gfn, query: QueryFlags) -> P2mEntry;
}

/// One translation view
pub struct P2mTable {
    id: ViewId,
    backend: Arc<dyn P2mBackend>,
    pool: Arc<dyn PagingPool>,
    /// Superpage sizes usable by this view
    caps: BackendCaps,
    state: RwLock<TableState>,
    gfn_locks: GfnLockManager,
    /// Virtual CPUs currently using this view
    active_vcpus: AtomicU32,
    /// Physical CPUs that may cache translations of this view
    dirty_cpumask: AtomicU64,
}

impl P2mTable {
    /// Create a view without a root; see [`P2mWriteGuard::alloc_table`]
    ///
    /// `caps` is intersected with what the backend supports.
    pub fn new(
        id: ViewId,
        backend: Arc<dyn P2mBackend>,
        pool: Arc<dyn PagingPool>,
        default_access: P2mAccess,
        caps: BackendCaps,
    ) -> Self {
        let caps = caps & backend.capabilities();
        // Only the host view tracks dirty ranges from the start; alternate
        // views get a tracker on activation.
        let logdirty = (!id.is_alternate()).then(LogDirtyTracker::new);
        Self {
            id,
            backend,
            pool,
            caps,
            state: RwLock::new(TableState::new(default_access, logdirty)),
            gfn_locks: GfnLockManager::new(),
            active_vcpus: AtomicU32::new(0),
            dirty_cpumask: AtomicU64::new(0),
        }
    }

    /// Identity of the view
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Superpage sizes the view uses
    pub fn caps(&self) -> BackendCaps {
        self.caps
    }

    /// Range locks of the view
    pub fn gfn_locks(&self) -> &GfnLockManager {
        &self.gfn_locks
    }

    /// Take the table lock for reading
    pub fn lock_read(&self) -> P2mReadGuard<'_> {
        P2mReadGuard { state: self.state.read() }
    }

    /// Take the table lock for writing
    pub fn lock_write(&self) -> P2mWriteGuard<'_> {
        P2mWriteGuard { table: self, state: self.state.write() }
    }

    /// Snapshot lookup under the read lock
    pub fn get_entry(&self, gfn: Gfn, query: QueryFlags) -> P2mEntry {
        self.lock_read().lookup_in(self, gfn, query)
    }

    /// Count a virtual CPU switching to this view
    pub fn vcpu_get(&self) {
        self.active_vcpus.fetch_add(1, Ordering::AcqRel);
    }

    /// Count a virtual CPU leaving this view
    pub fn vcpu_put(&self) {
        let prev = self.active_vcpus.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "{}: active vcpu count underflow", self.id);
    }

    /// Virtual CPUs using this view
    pub fn active_vcpus(&self) -> u32 {
        self.active_vcpus.load(Ordering::Acquire)
    }

    /// Record that `cpu` may cache translations of this view
    pub fn mark_dirty_cpu(&self, cpu: CpuId) -> Result<()> {
        self.dirty_cpumask.fetch_or(cpu_bit(cpu)?, Ordering::AcqRel);
        Ok(())
    }

    /// Record that `cpu` no longer caches translations of this view
    pub fn clear_dirty_cpu(&self, cpu: CpuId) -> Result<()> {
        self.dirty_cpumask.fetch_and(!cpu_bit(cpu)?, Ordering::AcqRel);
        Ok(())
    }

    /// CPUs that may cache translations of this view
    pub fn dirty_cpus(&self) -> u64 {
        self.dirty_cpumask.load(Ordering::Acquire)
    }
}

/// Bit of `cpu` in a dirty mask; CPUs past [`MAX_CPUS`] have none
pub(crate) fn cpu_bit(cpu: CpuId) -> Result<u64> {
    if cpu >= MAX_CPUS {
        log::warn!("cpu {} outside the dirty mask", cpu);
        return Err(Error::InvalidArgument);
    }
    Ok(1u64 << cpu)
}

impl TableState {
    fn lookup_with(&self, backend: &dyn P2mBackend, gfn: Gfn, query: QueryFlags) -> P2mEntry {
        match self.root {
            Some(root) => backend.get_entry(root, gfn, query),
            None => P2mEntry::hole(PAGE_ORDER_4K),
        }
    }
}

/// Shared access to a view
pub struct P2mReadGuard<'a> {
    state: RwLockReadGuard<'a, TableState>,
}

impl P2mReadGuard<'_> {
    fn lookup_in(&self, table: &P2mTable, gfn: Gfn, query: QueryFlags) -> P2mEntry {
        self.state.lookup_with(&*table.backend, gfn, query)
    }
}

impl Deref for P2mReadGuard<'_> {
    type Target = TableState;

    fn deref(&self) -> &TableState {
        &self.state
    }
}

/// Read guard bound to its table, usable as an [`EntrySource`]
pub struct P2mReader<'a> {
    table: &'a P2mTable,
    guard: P2mReadGuard<'a>,
}

impl P2mTable {
    /// Take the read lock and keep the table at hand for lookups
    pub fn reader(&self) -> P2mReader<'_> {
        P2mReader { table: self, guard: self.lock_read() }
    }
}

impl P2mReader<'_> {
    /// Look up `gfn`
    pub fn get_entry(&self, gfn: Gfn, query: QueryFlags) -> P2mEntry {
        self.guard.lookup_in(self.table, gfn, query)
    }
}

impl Deref for P2mReader<'_> {
    type Target = TableState;

    fn deref(&self) -> &TableState {
        &self.guard
    }
}

impl EntrySource for P2mReader<'_> {
    fn lookup(&self, gfn: Gfn, query: QueryFlags) -> P2mEntry {
        self.get_entry(gfn, query)
    }
}

/// Exclusive access to a view
///
/// Dropping the guard performs the pending TLB flush, if any, before the
/// table lock is released.
pub struct P2mWriteGuard<'a> {
    table: &'a P2mTable,
    state: RwLockWriteGuard<'a, TableState>,
}

impl Deref for P2mWriteGuard<'_> {
    type Target = TableState;

    fn deref(&self) -> &TableState {
        &self.state
    }
}

impl EntrySource for P2mWriteGuard<'_> {
    fn lookup(&self, gfn: Gfn, query: QueryFlags) -> P2mEntry {
        self.get_entry(gfn, query)
    }
}

impl Drop for P2mWriteGuard<'_> {
    fn drop(&mut self) {
        self.tlb_flush_sync();
    }
}

impl<'a> P2mWriteGuard<'a> {
    /// Table this guard locks
    pub fn table(&self) -> &'a P2mTable {
        self.table
    }

    /// Identity of the view
    pub fn id(&self) -> ViewId {
        self.table.id
    }

    fn backend(&self) -> &'a dyn P2mBackend {
        &*self.table.backend
    }

    /// Allocate the root paging structure
    pub fn alloc_table(&mut self) -> Result<()> {
        if self.state.root.is_some() {
            log::error!("{}: p2m table already allocated", self.id());
            return Err(Error::InvalidState);
        }

        let backend = self.backend();
        let table = self.table;
        let st = &mut *self.state;
        let mut paging = Paging::new(table.id, &mut st.pages, &*table.pool, &mut st.need_flush);
        let root = backend.alloc_table(&mut paging)?;
        st.root = Some(root);

        log::info!("{}: allocated p2m root {} ({} backend)", table.id, root, backend.name());
        Ok(())
    }

    /// Look up `gfn`
    pub fn get_entry(&self, gfn: Gfn, query: QueryFlags) -> P2mEntry {
        self.state.lookup_with(&*self.table.backend, gfn, query)
    }

    /// Install `[gfn, gfn + 2^order)`, split into chunks the view supports
    ///
    /// The first failing chunk aborts the install; chunks already written
    /// stay in place.
    pub fn set_entry(
        &mut self,
        gfn: Gfn,
        mfn: Option<Mfn>,
        order: u32,
        p2m_type: P2mType,
        access: P2mAccess,
    ) -> Result<()> {
        check_order(order)?;
        let root = self.state.root.ok_or(Error::InvalidState)?;
        let backend = self.backend();
        let table = self.table;
        let caps = table.caps;
        let st = &mut *self.state;
        let access = access.resolve(st.default_access);

        let mut gfn = gfn;
        let mut mfn = mfn;
        let mut todo = 1u64 << order;

        while todo > 0 {
            let fn_mask = mfn.map_or(0, Mfn::raw) | gfn.raw() | todo;
            let chunk = if caps.contains(BackendCaps::SUPERPAGE_1G)
                && fn_mask & order_mask!(PAGE_ORDER_1G) == 0
            {
                PAGE_ORDER_1G
            } else if caps.contains(BackendCaps::SUPERPAGE_2M)
                && fn_mask & order_mask!(PAGE_ORDER_2M) == 0
            {
                PAGE_ORDER_2M
            } else {
                PAGE_ORDER_4K
            };

            {
                let mut paging =
                    Paging::new(table.id, &mut st.pages, &*table.pool, &mut st.need_flush);
                backend.set_entry(&mut paging, root, gfn, mfn, chunk, p2m_type, access)?;
            }

            let last = gfn.raw() + order_mask!(chunk);
            if !p2m_type.is_hole() && last > st.max_mapped_gfn {
                st.max_mapped_gfn = last;
            }

            let step = 1u64 << chunk;
            gfn = gfn.add(step);
            mfn = mfn.map(|m| m.add(step));
            todo -= step;
        }

        Ok(())
    }

    /// Retype every `old` entry of the view to `new`
    ///
    /// Switches whole-view log-dirty tracking on when `new` is
    /// `RamLogdirty`, and off for any other real transition.
    pub fn change_type_global(&mut self, old: P2mType, new: P2mType) -> Result<()> {
        if !old.is_changeable() || !new.is_changeable() {
            return Err(Error::InvalidArgument);
        }
        self.backend_change_type_global(old, new)?;

        // A no-op retype must not change the log-dirty mode.
        if old != new {
            if let Some(logdirty) = self.state.logdirty.as_mut() {
                logdirty.set_global(new == P2mType::RamLogdirty);
            }
        }
        Ok(())
    }

    fn backend_change_type_global(&mut self, old: P2mType, new: P2mType) -> Result<()> {
        let root = self.state.root.ok_or(Error::InvalidState)?;
        let backend = self.backend();
        let table = self.table;
        let st = &mut *self.state;
        let mut paging = Paging::new(table.id, &mut st.pages, &*table.pool, &mut st.need_flush);
        backend.change_type_global(&mut paging, root, old, new);
        Ok(())
    }

    /// Retype `old` entries in `[first, last]` to `new`
    ///
    /// The range is clipped to `host_max`, the host view's highest mapped
    /// frame, so the dirty ranges of every view stay identical; the backend
    /// work is further clipped to this view's own extent. A range covering
    /// the whole mapped extent is handed to the backend as a global retype,
    /// without switching whole-view log-dirty tracking on. The log-dirty
    /// ranges change only for `ram_rw <-> ram_logdirty` transitions, even
    /// when the backend fails.
    pub fn change_type_range(
        &mut self,
        old: P2mType,
        new: P2mType,
        first: u64,
        last: u64,
        host_max: u64,
    ) -> Result<()> {
        if !old.is_changeable() || !new.is_changeable() {
            return Err(Error::InvalidArgument);
        }

        let id = self.id();
        let mut last = last;
        if last > host_max {
            log::warn!("{}: log-dirty range clipped to max mapped gfn {:#x}", id, host_max);
            last = host_max;
        }
        if first > last {
            return Ok(());
        }

        let view_max = self.state.max_mapped_gfn;
        let invalidate_last = if id.is_alternate() { last.min(view_max) } else { last };

        let mut result = Ok(());
        if first <= invalidate_last {
            result = if first == 0 && invalidate_last == view_max {
                self.backend_change_type_global(old, new)
            } else {
                self.backend_change_type_range(old, new, first, invalidate_last)
            };
            if let Err(e) = result {
                log::error!(
                    "{}: error {} changing gfns [{:#x},{:#x}] from {:?} to {:?}",
                    id,
                    e,
                    first,
                    invalidate_last,
                    old,
                    new
                );
            }
        }

        if let Some(logdirty) = self.state.logdirty.as_mut() {
            match (old, new) {
                (P2mType::RamLogdirty, P2mType::RamRw) => logdirty.untrack(first..last + 1),
                (P2mType::RamRw, P2mType::RamLogdirty) => logdirty.track(first..last + 1),
                _ => {}
            }
        }

        result
    }

    fn backend_change_type_range(
        &mut self,
        old: P2mType,
        new: P2mType,
        first: u64,
        last: u64,
    ) -> Result<()> {
        let root = self.state.root.ok_or(Error::InvalidState)?;
        let backend = self.backend();
        let table = self.table;
        let st = &mut *self.state;
        let mut paging = Paging::new(table.id, &mut st.pages, &*table.pool, &mut st.need_flush);
        backend.change_type_range(&mut paging, root, old, new, Gfn::new(first), Gfn::new(last))
    }

    /// Drop every entry of the view, keeping only the root
    ///
    /// A nested view is also unassigned from its base address and its
    /// generation bumped, so vCPUs caching it notice.
    pub fn flush_table(&mut self) {
        let backend = self.backend();
        let table = self.table;

        if table.id.is_nested() {
            // No need to flush if it is already empty.
            if self.state.np2m_base.is_none() {
                return;
            }
            self.state.np2m_base = None;
            self.state.np2m_generation += 1;
        }

        let Some(root) = self.state.root else {
            return;
        };

        backend.clear_table(root);
        // Stale translations must be gone before the frames are reused.
        self.state.need_flush = false;
        backend.flush_tlb(table.id);
        table.dirty_cpumask.store(0, Ordering::Release);

        let st = &mut *self.state;
        for mfn in st.pages.drain(..).filter(|&p| p != root) {
            backend.release_table_page(mfn);
            table.pool.free_page(mfn);
        }
        st.pages.push(root);
        st.max_mapped_gfn = 0;

        log::debug!("{}: p2m table flushed", table.id);
    }

    /// Perform a pending TLB flush now, while the lock is held
    pub fn tlb_flush_sync(&mut self) {
        if self.state.need_flush {
            self.state.need_flush = false;
            self.table.backend.flush_tlb(self.table.id);
        }
    }

    /// Return every paging-structure frame, root included, to the pool
    pub fn teardown(&mut self) {
        let backend = self.backend();
        let table = self.table;
        let st = &mut *self.state;

        if st.root.take().is_some() {
            st.need_flush = false;
            backend.flush_tlb(table.id);
        }
        for mfn in st.pages.drain(..) {
            backend.release_table_page(mfn);
            table.pool.free_page(mfn);
        }
        st.max_mapped_gfn = 0;

        log::info!("{}: p2m table torn down", table.id);
    }

    /// Change the default access of the view
    pub fn set_default_access(&mut self, access: P2mAccess) {
        self.state.default_access = access.resolve(self.state.default_access);
    }

    /// Give the view a copy of another view's log-dirty state
    pub fn init_logdirty(&mut self, tracker: LogDirtyTracker) {
        self.state.logdirty = Some(tracker);
    }

    /// Drop the view's log-dirty tracker
    pub fn free_logdirty(&mut self) {
        self.state.logdirty = None;
    }

    /// Mutable log-dirty tracker
    pub fn logdirty_mut(&mut self) -> Option<&mut LogDirtyTracker> {
        self.state.logdirty.as_mut()
    }

    /// Include `gfn` in the remapped bound
    pub fn widen_remapped(&mut self, gfn: Gfn) {
        let gfn = gfn.raw();
        self.state.min_remapped_gfn = self.state.min_remapped_gfn.min(gfn);
        self.state.max_remapped_gfn = self.state.max_remapped_gfn.max(gfn);
    }

    /// Forget every remapped frame
    pub fn reset_remapped(&mut self) {
        self.state.min_remapped_gfn = NO_REMAP.0;
        self.state.max_remapped_gfn = NO_REMAP.1;
    }

    /// Assign a nested view to a base address
    pub fn set_np2m_base(&mut self, base: Option<u64>) {
        self.state.np2m_base = base;
    }

    /// Defer nested flushes caused by this view's updates
    pub fn set_defer_nested_flush(&mut self, defer: bool) {
        self.state.defer_nested_flush = defer;
    }

    /// Account populate-on-demand entries created
    pub fn add_pod_entries(&mut self, count: u64) {
        self.state.pod_entry_count += count;
    }

    /// Account populate-on-demand entries replaced
    pub fn sub_pod_entries(&mut self, count: u64) {
        let id = self.id();
        let st = &mut *self.state;
        st.pod_entry_count = st.pod_entry_count.checked_sub(count).unwrap_or_else(|| {
            log::error!("{}: populate-on-demand entry count underflow", id);
            0
        });
    }

    /// Account a frame paged out
    pub fn add_paged(&mut self) {
        self.state.paged_count += 1;
    }

    /// Account a paged-out hole being plugged
    pub fn sub_paged(&mut self) {
        self.state.paged_count = self.state.paged_count.saturating_sub(1);
    }
}
