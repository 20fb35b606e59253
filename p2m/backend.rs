//! Backend interface
//!
//! A backend encodes and decodes translation entries for one hardware
//! mapping technology. The translation table drives it under the table
//! lock; the backend never takes table locks itself.

use crate::mm::{Gfn, Mfn, PagingPool};
use crate::p2m::{P2mAccess, P2mEntry, P2mType, QueryFlags, ViewId};
use crate::{Error, Result};
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// Superpage sizes a backend can install
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BackendCaps: u32 {
        /// 2MB leaf entries
        const SUPERPAGE_2M = 1 << 0;
        /// 1GB leaf entries
        const SUPERPAGE_1G = 1 << 1;
    }
}

/// Paging-structure bookkeeping a backend may touch during a mutation
///
/// Frames handed out by [`Paging::alloc_page`] join the owning table's page
/// list and are returned to the pool when the table is flushed or torn down.
pub struct Paging<'a> {
    view: ViewId,
    pages: &'a mut Vec<Mfn>,
    pool: &'a dyn PagingPool,
    need_flush: &'a mut bool,
}

impl<'a> Paging<'a> {
    pub(crate) fn new(
        view: ViewId,
        pages: &'a mut Vec<Mfn>,
        pool: &'a dyn PagingPool,
        need_flush: &'a mut bool,
    ) -> Self {
        Self { view, pages, pool, need_flush }
    }

    /// View being modified
    pub fn view(&self) -> ViewId {
        self.view
    }

    /// Allocate a paging-structure frame for this view
    pub fn alloc_page(&mut self) -> Result<Mfn> {
        let mfn = self.pool.alloc_page().ok_or(Error::OutOfMemory)?;
        self.pages.push(mfn);
        Ok(mfn)
    }

    /// Give back a paging-structure frame that is no longer referenced
    pub fn free_page(&mut self, mfn: Mfn) {
        if let Some(pos) = self.pages.iter().position(|&p| p == mfn) {
            self.pages.remove(pos);
            self.pool.free_page(mfn);
        } else {
            log::warn!("{}: freeing paging frame {} not owned by the view", self.view, mfn);
        }
    }

    /// Ask for a TLB flush before the table lock is released
    pub fn request_flush(&mut self) {
        *self.need_flush = true;
    }
}

/// Encoder/decoder of translation entries for one mapping technology
///
/// Gfn ranges passed to the retype methods are inclusive.
pub trait P2mBackend: Send + Sync {
    /// Short name used in log messages
    fn name(&self) -> &'static str;

    /// Superpage sizes the backend supports
    fn capabilities(&self) -> BackendCaps;

    /// Allocate and clear a root paging structure
    fn alloc_table(&self, paging: &mut Paging<'_>) -> Result<Mfn>;

    /// Look up the entry covering `gfn`
    fn get_entry(&self, root: Mfn, gfn: Gfn, query: QueryFlags) -> P2mEntry;

    /// Install one naturally aligned entry of `order`
    fn set_entry(
        &self,
        paging: &mut Paging<'_>,
        root: Mfn,
        gfn: Gfn,
        mfn: Option<Mfn>,
        order: u32,
        p2m_type: P2mType,
        access: P2mAccess,
    ) -> Result<()>;

    /// Retype every `old` entry in `[first, last]` to `new`
    fn change_type_range(
        &self,
        paging: &mut Paging<'_>,
        root: Mfn,
        old: P2mType,
        new: P2mType,
        first: Gfn,
        last: Gfn,
    ) -> Result<()>;

    /// Retype every `old` entry of the view to `new`
    fn change_type_global(&self, paging: &mut Paging<'_>, root: Mfn, old: P2mType, new: P2mType);

    /// Clear every entry of the root paging structure
    ///
    /// Lower-level structures stay allocated; the table releases them.
    fn clear_table(&self, root: Mfn);

    /// Forget a paging-structure frame the table is returning to the pool
    fn release_table_page(&self, mfn: Mfn);

    /// Invalidate cached translations of the view
    fn flush_tlb(&self, view: ViewId);
}
