//! Nested views
//!
//! A small pool of views caching second-level translations for guests that
//! run their own hypervisor. Each slot is keyed by the base address the L1
//! hypervisor chose for its page tables and carries a generation that is
//! bumped on every flush, so vCPUs caching a slot notice it went stale
//! without being told. Slots are recycled least recently used first.

use crate::config::{P2mConfig, MAX_NESTEDP2M};
use crate::mm::DomainId;
use crate::p2m::table::cpu_bit;
use crate::p2m::{BackendCaps, P2mDomain, P2mEnv, P2mTable, ViewId, ViewKind};
use crate::sync::SpinLock;
use crate::{Error, Result};
use alloc::vec::Vec;

/// Nested base addresses are 4K aligned.
const NP2M_BASE_MASK: u64 = !0xfff;

/// Nested view state of one vCPU
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NestedVcpu {
    /// The vCPU is running its nested guest
    pub guest_mode: bool,
    /// Base address the L1 hypervisor uses for the nested guest
    pub base: u64,
    /// Cached slot
    pub p2m: Option<u8>,
    /// Generation of the cached slot when it was acquired
    pub generation: u64,
    /// Drop the cached slot on the next acquire
    pub flush_p2m: bool,
    /// Cached translations are stale and must be reloaded
    pub stale_np2m: bool,
    /// The vCPU must flush its address-space tagged TLB entries
    pub asid_flush: bool,
}

impl NestedVcpu {
    fn mark_stale(&mut self) {
        self.asid_flush = true;
        self.stale_np2m = true;
    }
}

/// Scheduling direction of a vCPU context switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDir {
    /// The vCPU is about to run
    In,
    /// The vCPU stopped running
    Out,
}

/// Nested view slots of one domain
pub(crate) struct NestedPool {
    tables: Vec<P2mTable>,
    /// Nested list lock; slot indices, most recently used first
    lru: SpinLock<heapless::Vec<u8, MAX_NESTEDP2M>>,
}

impl NestedPool {
    /// Create the pool; slots only exist for domains using nested
    /// virtualization
    pub(crate) fn new(
        domain: DomainId,
        config: &P2mConfig,
        env: &P2mEnv,
        caps: BackendCaps,
    ) -> Result<Self> {
        let slots = if config.nested_virt { config.nested_slots } else { 0 };
        let mut tables: Vec<P2mTable> = Vec::with_capacity(slots);
        let mut lru: heapless::Vec<u8, MAX_NESTEDP2M> = heapless::Vec::new();

        for i in 0..slots {
            let table = P2mTable::new(
                ViewId { domain, kind: ViewKind::Nested(i as u8) },
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
            lru.push(i as u8).map_err(|_| Error::InvalidState)?;
        }

        Ok(Self { tables, lru: SpinLock::new(lru) })
    }

    /// Number of slots
    pub(crate) fn len(&self) -> usize {
        self.tables.len()
    }

    pub(crate) fn table(&self, idx: u8) -> Option<&P2mTable> {
        self.tables.get(idx as usize)
    }

    /// Release every slot's paging structures
    pub(crate) fn teardown(&self) {
        let _lru = self.lru.lock();
        for table in &self.tables {
            table.lock_write().teardown();
        }
    }
}

/// Move `idx` to the most recently used end
fn touch(lru: &mut heapless::Vec<u8, MAX_NESTEDP2M>, idx: u8) {
    if let Some(pos) = lru.iter().position(|&i| i == idx) {
        lru[..=pos].rotate_right(1);
    }
}

impl P2mDomain {
    /// Nested view slot `idx`
    pub fn nested_table(&self, idx: u8) -> Option<&P2mTable> {
        self.nested.table(idx)
    }

    /// Record whether `vcpu` runs its nested guest
    pub fn set_nested_guest_mode(&self, vcpu: usize, guest_mode: bool) -> Result<()> {
        self.vcpu(vcpu)?.lock().nested.guest_mode = guest_mode;
        Ok(())
    }

    /// Find or assign the nested view for `base` on behalf of `vcpu`
    ///
    /// A cached slot still assigned to `base` at the generation the vCPU
    /// saw is reused as is. Otherwise a slot already assigned to `base` is
    /// shared, or the least recently used slot is flushed and reassigned;
    /// either way the vCPU is told to flush its TLB.
    pub fn nested_p2m_acquire(&self, vcpu: usize, base: u64) -> Result<&P2mTable> {
        if !self.config().nested_virt {
            return Err(Error::InvalidState);
        }
        let cpu = self.current_cpu();
        cpu_bit(cpu)?;
        let base = base & NP2M_BASE_MASK;

        let mut v = self.vcpu(vcpu)?.lock();
        let nv = &mut v.nested;
        nv.base = base;
        if nv.flush_p2m {
            nv.p2m = None;
        }

        let mut lru = self.nested.lru.lock();
        let mut needs_flush = true;
        let mut found = None;

        if let Some(idx) = nv.p2m {
            let table = self.nested.table(idx).ok_or(Error::InvalidState)?;
            let p2m = table.lock_write();
            if p2m.np2m_base() == Some(base) {
                // Flushed since the vCPU last looked?
                if nv.generation == p2m.np2m_generation() {
                    needs_flush = false;
                }
                found = Some((idx, p2m));
            } else if p2m.np2m_base().is_some() {
                // Switching away from another valid slot.
                table.clear_dirty_cpu(cpu)?;
            }
        }

        if found.is_none() {
            found = self.nested.tables.iter().enumerate().find_map(|(i, table)| {
                let p2m = table.lock_write();
                (p2m.np2m_base() == Some(base)).then_some((i as u8, p2m))
            });
        }

        let (idx, mut p2m) = match found {
            Some(found) => found,
            None => {
                let idx = *lru.last().ok_or(Error::InvalidState)?;
                let table = self.nested.table(idx).ok_or(Error::InvalidState)?;
                let mut p2m = table.lock_write();
                p2m.flush_table();
                log::debug!("{}: recycled for nested base {:#x}", table.id(), base);
                (idx, p2m)
            }
        };

        if needs_flush {
            nv.mark_stale();
        }
        p2m.set_np2m_base(Some(base));
        nv.flush_p2m = false;
        nv.p2m = Some(idx);
        nv.generation = p2m.np2m_generation();
        p2m.table().mark_dirty_cpu(cpu)?;
        touch(&mut lru, idx);

        Ok(p2m.table())
    }

    /// View `vcpu` translates through: its nested view while it runs a
    /// nested guest, the host view otherwise
    pub fn vcpu_p2m(&self, vcpu: usize) -> Result<&P2mTable> {
        let (guest_mode, base) = {
            let v = self.vcpu(vcpu)?.lock();
            (v.nested.guest_mode, v.nested.base)
        };
        if self.config().nested_virt && guest_mode {
            self.nested_p2m_acquire(vcpu, base)
        } else {
            Ok(self.host())
        }
    }

    /// Keep the dirty CPU mask of `vcpu`'s nested view in line with where
    /// the vCPU runs
    ///
    /// Scheduling a vCPU in whose slot was flushed while it was descheduled
    /// drops the cached slot and forces a TLB flush.
    pub fn nested_schedule(&self, vcpu: usize, dir: ScheduleDir) -> Result<()> {
        if !self.config().nested_virt {
            return Ok(());
        }
        let cpu = self.current_cpu();
        let mut v = self.vcpu(vcpu)?.lock();
        let nv = &mut v.nested;
        if !nv.guest_mode {
            return Ok(());
        }
        let Some(idx) = nv.p2m else {
            return Ok(());
        };
        let table = self.nested.table(idx).ok_or(Error::InvalidState)?;

        let p2m = table.lock_read();
        let valid = p2m.np2m_base() == Some(nv.base) && nv.generation == p2m.np2m_generation();
        match dir {
            ScheduleDir::Out if valid => table.clear_dirty_cpu(cpu)?,
            ScheduleDir::Out => {}
            ScheduleDir::In if valid => table.mark_dirty_cpu(cpu)?,
            ScheduleDir::In => {
                log::debug!("{}: vcpu {} np2m went stale while descheduled", table.id(), vcpu);
                nv.asid_flush = true;
                nv.p2m = None;
            }
        }
        Ok(())
    }

    /// Drop `vcpu`'s cached nested view and flush it
    pub fn nested_vcpu_flush(&self, vcpu: usize) -> Result<()> {
        let mut v = self.vcpu(vcpu)?.lock();
        if let Some(idx) = v.nested.p2m.take() {
            let _lru = self.nested.lru.lock();
            let table = self.nested.table(idx).ok_or(Error::InvalidState)?;
            table.lock_write().flush_table();
        }
        v.nested.asid_flush = true;
        Ok(())
    }

    /// Flush every nested view
    pub fn flush_nested_all(&self) {
        let _lru = self.nested.lru.lock();
        for table in &self.nested.tables {
            table.lock_write().flush_table();
        }
    }

    /// Flush the nested views assigned to `base`
    pub fn flush_nested_base(&self, base: u64) {
        let base = base & NP2M_BASE_MASK;
        let _lru = self.nested.lru.lock();
        for table in &self.nested.tables {
            let mut p2m = table.lock_write();
            if p2m.np2m_base() == Some(base) {
                p2m.flush_table();
            }
        }
    }
}
