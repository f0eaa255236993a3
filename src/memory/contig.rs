//! Physically contiguous pages from the device driver.
//!
//! The driver is asked for the whole buffer in blocks of `1 << order` bytes.
//! Large blocks are preferred; when the kernel cannot find them it is asked
//! again with half the block size, down to a configured floor.

use super::fork::ForkExclusion;
use super::kernel::{KernelMapper, MapError};
use crate::config::BlockOrderBounds;
use crate::error::{Error, Result};
use std::ptr::NonNull;
use std::sync::Arc;

/// `ceil(log2(size))`, with 0 for sizes 0 and 1.
#[inline]
pub fn block_order(size: usize) -> u32 {
    if size <= 1 {
        0
    } else {
        usize::BITS - (size - 1).leading_zeros()
    }
}

/// Allocates contiguous pages through a [`KernelMapper`].
pub struct ContigAllocator {
    mapper: Arc<dyn KernelMapper>,
}

impl ContigAllocator {
    /// Allocator using `mapper`.
    pub fn new(mapper: Arc<dyn KernelMapper>) -> Self {
        Self { mapper }
    }

    /// Map `size` bytes of contiguous memory and exclude it from fork.
    ///
    /// Starts at `block_order(size)` clamped to `bounds.max` and steps down
    /// one order per transient failure until `bounds.min`.
    ///
    /// # Errors
    ///
    /// - [`Error::CapabilityAbsent`] if the kernel does not support
    ///   contiguous pages (no retry).
    /// - [`Error::ResourceExhausted`] once every order down to `bounds.min`
    ///   has failed.
    /// - The fork exclusion error; the mapping is undone first.
    pub fn alloc(
        &self,
        size: usize,
        bounds: BlockOrderBounds,
        fork: &dyn ForkExclusion,
    ) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "contiguous allocation of zero bytes".into(),
            ));
        }

        let mut order = block_order(size).min(bounds.max);
        let addr = loop {
            match self.mapper.map_contiguous(size, order) {
                Ok(addr) => break addr,
                Err(MapError::Unsupported) => {
                    return Err(Error::CapabilityAbsent(
                        "kernel does not provide contiguous pages".into(),
                    ));
                }
                Err(MapError::Failed(errno)) => {
                    tracing::trace!(order, error = %errno, "contiguous mapping failed");
                    if order <= bounds.min {
                        return Err(Error::ResourceExhausted(format!(
                            "no contiguous pages for {} bytes down to block order {}",
                            size, bounds.min
                        )));
                    }
                    order -= 1;
                }
            }
        };

        tracing::debug!(order, addr = ?addr, size, "mapped contiguous pages");

        if let Err(e) = fork.exclude(addr, size) {
            // SAFETY: addr/size is the mapping we just created.
            unsafe { self.mapper.unmap(addr, size) };
            return Err(e);
        }

        Ok(addr)
    }

    /// Undo [`alloc`](ContigAllocator::alloc).
    ///
    /// # Safety
    ///
    /// `addr`/`size` must come from a successful `alloc` on this allocator
    /// and the memory must not be used afterwards.
    pub unsafe fn free(&self, addr: NonNull<u8>, size: usize, fork: &dyn ForkExclusion) {
        fork.include(addr, size);
        // SAFETY: forwarded from the caller.
        unsafe { self.mapper.unmap(addr, size) };
    }
}

impl std::fmt::Debug for ContigAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContigAllocator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::{FakeKernelMapper, RecordingForkExclusion};

    #[test]
    fn test_block_order() {
        assert_eq!(block_order(0), 0);
        assert_eq!(block_order(1), 0);
        assert_eq!(block_order(2), 1);
        assert_eq!(block_order(3), 2);
        assert_eq!(block_order(4096), 12);
        assert_eq!(block_order(4097), 13);
        assert_eq!(block_order(50_000), 16);
        assert_eq!(block_order(1 << 23), 23);
    }

    #[test]
    fn test_first_try_success() {
        let mapper = Arc::new(FakeKernelMapper::new());
        let contig = ContigAllocator::new(mapper.clone());
        let fork = RecordingForkExclusion::new();

        let addr = contig
            .alloc(64 * 1024, BlockOrderBounds::default(), &fork)
            .unwrap();
        assert_eq!(mapper.attempts(), vec![16]);
        assert!(fork.is_excluded(addr, 64 * 1024));

        unsafe { contig.free(addr, 64 * 1024, &fork) };
        assert_eq!(mapper.live(), 0);
        assert_eq!(fork.excluded_count(), 0);
    }

    #[test]
    fn test_order_clamped_to_max() {
        let mapper = Arc::new(FakeKernelMapper::new());
        let contig = ContigAllocator::new(mapper.clone());
        let fork = RecordingForkExclusion::new();
        let bounds = BlockOrderBounds { min: 12, max: 18 };

        let addr = contig.alloc(1 << 22, bounds, &fork).unwrap();
        assert_eq!(mapper.attempts(), vec![18]);
        unsafe { contig.free(addr, 1 << 22, &fork) };
    }

    #[test]
    fn test_shrinking_retry_ladder() {
        let mapper = Arc::new(FakeKernelMapper::up_to_order(14));
        let contig = ContigAllocator::new(mapper.clone());
        let fork = RecordingForkExclusion::new();

        let addr = contig
            .alloc(1 << 17, BlockOrderBounds::default(), &fork)
            .unwrap();
        assert_eq!(mapper.attempts(), vec![17, 16, 15, 14]);
        unsafe { contig.free(addr, 1 << 17, &fork) };
    }

    #[test]
    fn test_ladder_exhausted() {
        let mapper = Arc::new(FakeKernelMapper::exhausted());
        let contig = ContigAllocator::new(mapper.clone());
        let fork = RecordingForkExclusion::new();
        let bounds = BlockOrderBounds { min: 13, max: 23 };

        let err = contig.alloc(1 << 15, bounds, &fork).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(mapper.attempts(), vec![15, 14, 13]);
    }

    #[test]
    fn test_small_request_tried_once_below_floor() {
        let mapper = Arc::new(FakeKernelMapper::exhausted());
        let contig = ContigAllocator::new(mapper.clone());
        let fork = RecordingForkExclusion::new();

        assert!(contig.alloc(100, BlockOrderBounds::default(), &fork).is_err());
        assert_eq!(mapper.attempts(), vec![7]);
    }

    #[test]
    fn test_unsupported_not_retried() {
        let mapper = Arc::new(FakeKernelMapper::unsupported());
        let contig = ContigAllocator::new(mapper.clone());
        let fork = RecordingForkExclusion::new();

        let err = contig
            .alloc(1 << 20, BlockOrderBounds::default(), &fork)
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityAbsent(_)));
        assert_eq!(mapper.attempts().len(), 1);
    }

    #[test]
    fn test_fork_failure_unmaps() {
        let mapper = Arc::new(FakeKernelMapper::new());
        let contig = ContigAllocator::new(mapper.clone());
        let fork = RecordingForkExclusion::new();
        fork.fail_next(1);

        let err = contig
            .alloc(8192, BlockOrderBounds::default(), &fork)
            .unwrap_err();
        assert!(matches!(err, Error::ForkExclusion { .. }));
        assert_eq!(mapper.live(), 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        let contig = ContigAllocator::new(Arc::new(FakeKernelMapper::new()));
        let fork = RecordingForkExclusion::new();
        assert!(matches!(
            contig.alloc(0, BlockOrderBounds::default(), &fork),
            Err(Error::InvalidArgument(_))
        ));
    }
}
