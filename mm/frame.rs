//! Paging-structure frame pool
//!
//! Every translation table allocates the frames for its own paging
//! structures from the domain's paging pool and returns them at teardown.

use crate::mm::Mfn;
use crate::sync::SpinLock;
use alloc::vec;
use alloc::vec::Vec;

/// Source of frames for paging structures
pub trait PagingPool: Send + Sync {
    /// Allocate one frame, `None` when the pool is exhausted
    fn alloc_page(&self) -> Option<Mfn>;

    /// Return a frame to the pool
    fn free_page(&self, mfn: Mfn);
}

/// Bitmap frame allocator over a contiguous range of host frames
pub struct FramePool {
    /// First frame managed by the pool
    base: Mfn,
    /// Total number of frames
    total_frames: usize,
    /// Allocation bitmap, one bit per frame
    bitmap: SpinLock<Vec<u64>>,
}

impl FramePool {
    /// Create a pool managing `count` frames starting at `base`
    pub fn new(base: Mfn, count: usize) -> Self {
        let words = (count + 63) / 64;
        let mut bitmap = vec![0u64; words];

        // Bits past the end of the pool are permanently allocated.
        if count % 64 != 0 {
            if let Some(last) = bitmap.last_mut() {
                *last = !0u64 << (count % 64);
            }
        }

        Self {
            base,
            total_frames: count,
            bitmap: SpinLock::new(bitmap),
        }
    }

    /// Get the number of free frames
    pub fn free_frames(&self) -> usize {
        let bitmap = self.bitmap.lock();
        bitmap.iter().map(|w| w.count_zeros() as usize).sum()
    }

    /// Get the number of allocated frames
    pub fn allocated_frames(&self) -> usize {
        self.total_frames - self.free_frames()
    }

    /// Get the total number of frames
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    fn index_of(&self, mfn: Mfn) -> Option<usize> {
        let index = mfn.raw().checked_sub(self.base.raw())? as usize;
        (index < self.total_frames).then_some(index)
    }
}

impl PagingPool for FramePool {
    fn alloc_page(&self) -> Option<Mfn> {
        let mut bitmap = self.bitmap.lock();
        for (word_idx, word) in bitmap.iter_mut().enumerate() {
            if *word != !0u64 {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return Some(self.base.add((word_idx * 64 + bit) as u64));
            }
        }
        None
    }

    fn free_page(&self, mfn: Mfn) {
        let index = self
            .index_of(mfn)
            .unwrap_or_else(|| panic!("frame {} does not belong to this pool", mfn));
        let mut bitmap = self.bitmap.lock();
        let (word, bit) = (index / 64, index % 64);
        assert!(bitmap[word] & (1 << bit) != 0, "double free of frame {}", mfn);
        bitmap[word] &= !(1 << bit);
    }
}
