//! Domain registry
//!
//! Foreign mappings name the source domain by identifier; the registry
//! resolves that identifier to the domain's translation state.

use crate::mm::DomainId;
use crate::p2m::P2mDomain;
use crate::sync::RwLock;
use crate::{Error, Result};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Live domains by identifier
#[derive(Default)]
pub struct DomainRegistry {
    domains: RwLock<BTreeMap<DomainId, Arc<P2mDomain>>>,
}

impl DomainRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { domains: RwLock::new(BTreeMap::new()) }
    }

    /// Register `domain`
    ///
    /// Fails with `InvalidArgument` if its identifier is already taken.
    pub fn insert(&self, domain: Arc<P2mDomain>) -> Result<()> {
        let mut domains = self.domains.write();
        let id = domain.id();
        if domains.contains_key(&id) {
            log::warn!("d{}: already registered", id);
            return Err(Error::InvalidArgument);
        }
        domains.insert(id, domain);
        log::debug!("d{}: registered", id);
        Ok(())
    }

    /// Unregister domain `id`, handing back its state
    pub fn remove(&self, id: DomainId) -> Option<Arc<P2mDomain>> {
        self.domains.write().remove(&id)
    }

    /// Look up domain `id`
    pub fn get(&self, id: DomainId) -> Option<Arc<P2mDomain>> {
        self.domains.read().get(&id).cloned()
    }

    /// Identifiers of every registered domain, in ascending order
    pub fn ids(&self) -> Vec<DomainId> {
        self.domains.read().keys().copied().collect()
    }

    /// Number of registered domains
    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    /// No domain is registered
    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }
}
