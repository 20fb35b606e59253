//! Configuration management
//!
//! This module holds the per-domain settings of the translation layer:
//! which superpage sizes may be used, how many nested and alternate views
//! a domain gets, and the policy knobs the physmap glue consults.

use crate::p2m::P2mAccess;
use crate::utils::rangeset::RangeSet;
use crate::{Error, Result};

/// Maximum number of nested views per domain
pub const MAX_NESTEDP2M: usize = 10;

/// Maximum number of alternate views per domain
pub const MAX_ALTP2M: usize = 10;

/// Maximum number of virtual CPUs per domain
pub const MAX_VCPUS: usize = 64;

/// Default per-call iteration cap for MMIO region (un)mapping
pub const MAP_MMIO_MAX_ITER: u32 = 64;

static_assertions::const_assert!(MAX_NESTEDP2M <= u8::MAX as usize);
static_assertions::const_assert!(MAX_ALTP2M <= u8::MAX as usize);

/// Per-domain P2M configuration
#[derive(Debug, Clone)]
pub struct P2mConfig {
    /// Number of virtual CPUs
    pub vcpus: usize,
    /// Allow 1GB superpage mappings
    pub hap_1gb: bool,
    /// Allow 2MB superpage mappings
    pub hap_2mb: bool,
    /// Number of nested view slots
    pub nested_slots: usize,
    /// Number of alternate view slots
    pub altp2m_slots: usize,
    /// Nested virtualization is enabled for the domain
    pub nested_virt: bool,
    /// Alternate views may be activated for the domain
    pub altp2m: bool,
    /// Domain is the hardware domain (may map foreign frames)
    pub hardware_domain: bool,
    /// Host view changes must be mirrored into the IOMMU
    pub iommu_sync: bool,
    /// Default access of every view
    pub default_access: P2mAccess,
    /// Iteration cap for one MMIO (un)map call
    pub mmio_max_iter: u32,
    /// Host frames that are read-only MMIO
    pub mmio_ro_ranges: RangeSet<u64>,
}

impl Default for P2mConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            hap_1gb: true,
            hap_2mb: true,
            nested_slots: MAX_NESTEDP2M,
            altp2m_slots: MAX_ALTP2M,
            nested_virt: false,
            altp2m: false,
            hardware_domain: false,
            iommu_sync: false,
            default_access: P2mAccess::Rwx,
            mmio_max_iter: MAP_MMIO_MAX_ITER,
            mmio_ro_ranges: RangeSet::new(),
        }
    }
}

impl P2mConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.vcpus == 0 || self.vcpus > MAX_VCPUS {
            return Err(Error::InvalidArgument);
        }

        if self.nested_slots == 0 || self.nested_slots > MAX_NESTEDP2M {
            return Err(Error::InvalidArgument);
        }

        if self.altp2m_slots == 0 || self.altp2m_slots > MAX_ALTP2M {
            return Err(Error::InvalidArgument);
        }

        if self.mmio_max_iter == 0 {
            return Err(Error::InvalidArgument);
        }

        // The default access of a view must be concrete.
        if self.default_access == P2mAccess::Default {
            return Err(Error::InvalidArgument);
        }

        Ok(())
    }
}
