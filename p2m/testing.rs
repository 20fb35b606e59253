//! Test doubles for the collaborators of the translation layer

use crate::config::P2mConfig;
use crate::mm::{DomainId, FramePool, GStageBackend, Gfn, Mfn};
use crate::p2m::{
    FrameOwner, IommuFlags, MappingObserver, MemSharing, P2mAccess, P2mDomain, P2mEnv, P2mType,
    PageOwnership, VcpuP2m,
};
use crate::sync::CpuId;
use crate::{Error, Result};
use alloc::sync::{Arc, Weak};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::vec::Vec;

std::thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(0) };
}

/// Make the calling thread pose as `cpu` for range lock ownership
pub fn set_current_cpu(cpu: CpuId) {
    CURRENT_CPU.with(|c| c.set(cpu));
}

fn current_cpu() -> CpuId {
    CURRENT_CPU.with(|c| c.get())
}

/// Ownership tracker with reference counts and an M2P table
#[derive(Default)]
pub struct MockOwnership {
    owners: Mutex<HashMap<Mfn, FrameOwner>>,
    refs: Mutex<HashMap<Mfn, u32>>,
    m2p: Mutex<HashMap<Mfn, Gfn>>,
}

impl MockOwnership {
    pub fn set_owner(&self, mfn: Mfn, owner: FrameOwner) {
        self.owners.lock().unwrap().insert(mfn, owner);
    }

    pub fn refs(&self, mfn: Mfn) -> u32 {
        self.refs.lock().unwrap().get(&mfn).copied().unwrap_or(0)
    }
}

impl PageOwnership for MockOwnership {
    fn owner(&self, mfn: Mfn) -> Option<FrameOwner> {
        self.owners.lock().unwrap().get(&mfn).copied()
    }

    fn get_page(&self, mfn: Mfn, owner: FrameOwner) -> bool {
        if self.owner(mfn) != Some(owner) {
            return false;
        }
        *self.refs.lock().unwrap().entry(mfn).or_insert(0) += 1;
        true
    }

    fn put_page(&self, mfn: Mfn) {
        if let Some(refs) = self.refs.lock().unwrap().get_mut(&mfn) {
            *refs = refs.saturating_sub(1);
        }
    }

    fn gfn_of(&self, mfn: Mfn) -> Option<Gfn> {
        self.m2p.lock().unwrap().get(&mfn).copied()
    }

    fn set_gfn_of(&self, mfn: Mfn, gfn: Option<Gfn>) {
        let mut m2p = self.m2p.lock().unwrap();
        match gfn {
            Some(gfn) => m2p.insert(mfn, gfn),
            None => m2p.remove(&mfn),
        };
    }
}

/// First frame handed out as a private copy by [`MockSharing`]
const COPY_BASE: u64 = 0x80_0000;

/// Sharing collaborator that calls back into its domain like the real one
pub struct MockSharing {
    domain: OnceLock<Weak<P2mDomain>>,
    ownership: Arc<MockOwnership>,
    next_copy: Mutex<u64>,
    fail: Mutex<bool>,
    parent: Mutex<HashMap<Gfn, Mfn>>,
    unshared: Mutex<Vec<Gfn>>,
    enomem: Mutex<Vec<Gfn>>,
}

impl MockSharing {
    fn new(ownership: Arc<MockOwnership>) -> Self {
        Self {
            domain: OnceLock::new(),
            ownership,
            next_copy: Mutex::new(COPY_BASE),
            fail: Mutex::new(false),
            parent: Mutex::new(HashMap::new()),
            unshared: Mutex::new(Vec::new()),
            enomem: Mutex::new(Vec::new()),
        }
    }

    fn domain(&self) -> Result<Arc<P2mDomain>> {
        self.domain.get().and_then(Weak::upgrade).ok_or(Error::InvalidState)
    }

    /// Make every unshare fail for lack of memory
    pub fn fail_unshare(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    /// Frame the parent domain has at `gfn`, for fork population
    pub fn parent_frame(&self, gfn: Gfn, mfn: Mfn) {
        self.parent.lock().unwrap().insert(gfn, mfn);
    }

    pub fn unshared(&self) -> Vec<Gfn> {
        self.unshared.lock().unwrap().clone()
    }

    pub fn enomem(&self) -> Vec<Gfn> {
        self.enomem.lock().unwrap().clone()
    }

    fn map_private(&self, domain: &P2mDomain, gfn: Gfn, mfn: Mfn) -> Result<()> {
        self.ownership.set_owner(mfn, FrameOwner::Domain(domain.id()));
        domain.set_entry(gfn, Some(mfn), 0, P2mType::RamRw, P2mAccess::Default)?;
        self.ownership.set_gfn_of(mfn, Some(gfn));
        Ok(())
    }
}

impl MemSharing for MockSharing {
    fn unshare(&self, _domain: DomainId, _cpu: CpuId, gfn: Gfn) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(Error::OutOfMemory);
        }
        let domain = self.domain()?;
        let copy = {
            let mut next = self.next_copy.lock().unwrap();
            *next += 1;
            Mfn::new(*next - 1)
        };
        self.map_private(&domain, gfn, copy)?;
        self.unshared.lock().unwrap().push(gfn);
        Ok(())
    }

    fn fork_page(&self, _domain: DomainId, _cpu: CpuId, gfn: Gfn, _unsharing: bool) -> Result<()> {
        let mfn = self.parent.lock().unwrap().get(&gfn).copied().ok_or(Error::NotFound)?;
        let domain = self.domain()?;
        self.map_private(&domain, gfn, mfn)
    }

    fn notify_enomem(&self, _domain: DomainId, gfn: Gfn, _can_sleep: bool) {
        self.enomem.lock().unwrap().push(gfn);
    }
}

/// Observed host view change
pub type ObservedChange = (DomainId, Gfn, Option<Mfn>, u32, IommuFlags);

/// Observer remembering every change it is told about
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedChange>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ObservedChange> {
        self.events.lock().unwrap().clone()
    }
}

impl MappingObserver for RecordingObserver {
    fn p2m_entry_changed(
        &self,
        domain: DomainId,
        gfn: Gfn,
        mfn: Option<Mfn>,
        order: u32,
        flags: IommuFlags,
    ) {
        self.events.lock().unwrap().push((domain, gfn, mfn, order, flags));
    }
}

/// Domain under test with its collaborators
pub struct Fixture {
    pub domain: Arc<P2mDomain>,
    pub pool: Arc<FramePool>,
    pub backend: Arc<GStageBackend>,
    pub ownership: Arc<MockOwnership>,
    sharing: Option<Arc<MockSharing>>,
}

impl Fixture {
    /// Sharing collaborator; the domain must be built with sharing
    pub fn sharing(&self) -> &MockSharing {
        self.sharing.as_deref().expect("domain built without sharing")
    }
}

/// Outcome of building a domain that may fail
pub struct BuildResult {
    pub result: Result<P2mDomain>,
    pub pool: Arc<FramePool>,
}

/// First frame of the paging-structure pool
const POOL_BASE: u64 = 0x10_0000;

/// Builder for test domains
pub struct DomainBuilder {
    id: DomainId,
    config: P2mConfig,
    pool_frames: usize,
    sharing: bool,
    observer: Option<Arc<RecordingObserver>>,
    ownership: Option<Arc<MockOwnership>>,
}

impl DomainBuilder {
    pub fn new() -> Self {
        Self {
            id: 1,
            config: P2mConfig::default(),
            pool_frames: 4096,
            sharing: false,
            observer: None,
            ownership: None,
        }
    }

    pub fn id(mut self, id: DomainId) -> Self {
        self.id = id;
        self
    }

    pub fn nested_virt(mut self) -> Self {
        self.config.nested_virt = true;
        self
    }

    pub fn altp2m(mut self) -> Self {
        self.config.altp2m = true;
        self
    }

    pub fn sharing(mut self) -> Self {
        self.sharing = true;
        self
    }

    pub fn pool_frames(mut self, frames: usize) -> Self {
        self.pool_frames = frames;
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut P2mConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn observer(mut self, observer: Arc<RecordingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn ownership(mut self, ownership: Arc<MockOwnership>) -> Self {
        self.ownership = Some(ownership);
        self
    }

    fn parts(
        self,
    ) -> (DomainId, P2mConfig, P2mEnv, Arc<FramePool>, Arc<GStageBackend>, Arc<MockOwnership>, Option<Arc<MockSharing>>)
    {
        let backend = Arc::new(GStageBackend::new());
        let pool = Arc::new(FramePool::new(Mfn::new(POOL_BASE), self.pool_frames));
        let ownership = self.ownership.unwrap_or_default();

        let mut env = P2mEnv::new(backend.clone(), pool.clone(), ownership.clone())
            .with_cpu_id(current_cpu);
        let sharing = self.sharing.then(|| Arc::new(MockSharing::new(ownership.clone())));
        if let Some(sharing) = &sharing {
            env = env.with_sharing(sharing.clone());
        }
        if let Some(observer) = self.observer {
            env = env.with_observer(observer);
        }

        (self.id, self.config, env, pool, backend, ownership, sharing)
    }

    pub fn build(self) -> Fixture {
        let (id, config, env, pool, backend, ownership, sharing) = self.parts();
        let domain = Arc::new(P2mDomain::new(id, config, env).expect("domain creation failed"));
        if let Some(sharing) = &sharing {
            let _ = sharing.domain.set(Arc::downgrade(&domain));
        }
        Fixture { domain, pool, backend, ownership, sharing }
    }

    pub fn build_result(self) -> BuildResult {
        let (id, config, env, pool, ..) = self.parts();
        BuildResult { result: P2mDomain::new(id, config, env), pool }
    }
}

impl P2mDomain {
    /// Run `f` on the view selectors of vCPU `idx`
    pub(crate) fn with_vcpu(&self, idx: usize, f: impl FnOnce(&mut VcpuP2m)) {
        let mut v = self.vcpu(idx).expect("vcpu out of range").lock();
        f(&mut *v);
    }
}
