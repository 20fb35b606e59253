//! Memory management module
//!
//! Frame identifiers shared by the whole translation layer, the pool that
//! hands out frames for paging structures, and a software G-stage backend.

use core::fmt;

pub mod frame;
pub mod gstage;

// Re-export commonly used types
pub use frame::{FramePool, PagingPool};
pub use gstage::GStageBackend;

/// Physical address type
pub type PhysAddr = u64;

/// Domain identifier
pub type DomainId = u16;

/// Page size (typically 4KB)
pub const PAGE_SIZE: u64 = 4096;

/// Page shift (number of bits for page offset)
pub const PAGE_SHIFT: u32 = 12;

/// Order of a 4KB mapping
pub const PAGE_ORDER_4K: u32 = 0;

/// Order of a 2MB mapping
pub const PAGE_ORDER_2M: u32 = 9;

/// Order of a 1GB mapping
pub const PAGE_ORDER_1G: u32 = 18;

macro_rules! frame_number {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// Create a frame number
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw frame number
            pub const fn raw(self) -> u64 {
                self.0
            }

            /// Frame `n` frames after this one
            pub const fn add(self, n: u64) -> Self {
                Self(self.0 + n)
            }

            /// Round down to an `order` boundary
            pub const fn align_down(self, order: u32) -> Self {
                Self(self.0 & !((1u64 << order) - 1))
            }

            /// Check alignment to an `order` boundary
            pub const fn is_aligned(self, order: u32) -> bool {
                self.0 & ((1u64 << order) - 1) == 0
            }

            /// Physical (or guest-physical) address of the frame
            pub const fn addr(self) -> PhysAddr {
                self.0 << PAGE_SHIFT
            }

            /// Frame containing `addr`
            pub const fn from_addr(addr: PhysAddr) -> Self {
                Self(addr >> PAGE_SHIFT)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

frame_number!(Gfn, "Guest frame number");
frame_number!(Mfn, "Host (machine) frame number");

/// Number of frames covered by a mapping of `order`
pub const fn order_frames(order: u32) -> u64 {
    1u64 << order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_alignment() {
        let gfn = Gfn::new(0x2_0123);
        assert_eq!(gfn.align_down(PAGE_ORDER_2M), Gfn::new(0x2_0000));
        assert!(!gfn.is_aligned(PAGE_ORDER_2M));
        assert!(Gfn::new(0x4_0000).is_aligned(PAGE_ORDER_1G));
        assert_eq!(order_frames(PAGE_ORDER_2M), 512);
    }

    #[test]
    fn test_frame_addresses() {
        let mfn = Mfn::from_addr(0x8020_1fff);
        assert_eq!(mfn, Mfn::new(0x80201));
        assert_eq!(mfn.addr(), 0x8020_1000);
        assert_eq!(mfn.add(3).raw(), 0x80204);
    }
}
