//! Huge page backed segments.
//!
//! Huge buffers are carved out of large shared anonymous mappings. With
//! `MAP_HUGETLB` the mapping is backed by reserved huge pages, which are
//! physically contiguous per page and never swapped out.
//!
//! # Requirements
//!
//! - Linux kernel with huge page support
//! - Sufficient huge pages reserved (see `/proc/sys/vm/nr_hugepages`)
//!
//! When no huge pages are reserved, `mmap` fails with `ENOMEM` and the
//! allocation is reported as resource exhaustion; the strategy selector
//! then decides whether another backend may be tried.

use super::segment::SegmentSource;
use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// Bit position of the page size selector in the mmap flags.
const MAP_HUGE_SHIFT: u32 = 26;

/// Size of huge pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugePageSize {
    /// 2MB huge pages (standard on x86_64).
    MB2,
    /// 1GB gigantic pages.
    GB1,
}

impl HugePageSize {
    /// Get the size in bytes.
    pub fn bytes(self) -> usize {
        match self {
            HugePageSize::MB2 => 2 * 1024 * 1024,
            HugePageSize::GB1 => 1024 * 1024 * 1024,
        }
    }

    /// log2 of the page size, as encoded into the mmap flags.
    fn shift(self) -> u32 {
        match self {
            HugePageSize::MB2 => 21,
            HugePageSize::GB1 => 30,
        }
    }
}

/// A shared anonymous mapping, optionally on huge pages.
pub struct HugePageSegment {
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the mapping in bytes.
    len: usize,
    /// Huge page size, or `None` for a regular-page mapping.
    page_size: Option<HugePageSize>,
}

impl HugePageSegment {
    /// Map a new huge page segment.
    ///
    /// `size` is rounded up to the huge page boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a zero size and
    /// [`Error::ResourceExhausted`] if the kernel cannot provide the pages.
    pub fn new(page_size: HugePageSize, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("size must be greater than 0".into()));
        }

        let page_bytes = page_size.bytes();
        let aligned_size = size.div_ceil(page_bytes) * page_bytes;

        let huge_flags = MapFlags::from_bits_retain(
            MapFlags::HUGETLB.bits() | (page_size.shift() << MAP_HUGE_SHIFT),
        );
        let ptr = Self::map(aligned_size, MapFlags::SHARED | huge_flags)?;

        Ok(Self {
            ptr,
            len: aligned_size,
            page_size: Some(page_size),
        })
    }

    /// Map a shared anonymous segment on regular pages.
    ///
    /// Useful on hosts without reserved huge pages; the chunk bookkeeping
    /// on top is identical.
    pub fn regular(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("size must be greater than 0".into()));
        }

        let ptr = Self::map(size, MapFlags::SHARED)?;

        Ok(Self {
            ptr,
            len: size,
            page_size: None,
        })
    }

    fn map(len: usize, flags: MapFlags) -> Result<NonNull<u8>> {
        // SAFETY: a fresh anonymous mapping aliases nothing.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                flags,
            )
        }
        .map_err(|e| Error::ResourceExhausted(format!("mmap of {} bytes failed: {}", len, e)))?;

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::ResourceExhausted("mmap returned null".into()))
    }

    /// Get the huge page size used, if any.
    pub fn page_size(&self) -> Option<HugePageSize> {
        self.page_size
    }
}

impl MemorySegment for HugePageSegment {
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        match self.page_size {
            Some(_) => MemoryType::HugePages,
            None => MemoryType::Anonymous,
        }
    }
}

impl Drop for HugePageSegment {
    fn drop(&mut self) {
        // SAFETY: we own the mapping and nothing borrows it past drop.
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!(len = self.len, error = %e, "munmap of segment failed");
        }
    }
}

// SAFETY: the mapping is exclusively owned and can be accessed from any thread.
unsafe impl Send for HugePageSegment {}
unsafe impl Sync for HugePageSegment {}

/// Segment source producing `MAP_HUGETLB` mappings.
#[derive(Debug, Clone, Copy)]
pub struct HugeTlbSource {
    page_size: HugePageSize,
}

impl HugeTlbSource {
    /// Source using the given huge page size.
    pub fn new(page_size: HugePageSize) -> Self {
        Self { page_size }
    }
}

impl Default for HugeTlbSource {
    fn default() -> Self {
        Self::new(HugePageSize::MB2)
    }
}

impl SegmentSource for HugeTlbSource {
    fn create(&self, len: usize) -> Result<Box<dyn MemorySegment>> {
        Ok(Box::new(HugePageSegment::new(self.page_size, len)?))
    }

    fn granularity(&self) -> usize {
        self.page_size.bytes()
    }
}

/// Segment source producing regular-page shared mappings.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousSource;

impl SegmentSource for AnonymousSource {
    fn create(&self, len: usize) -> Result<Box<dyn MemorySegment>> {
        Ok(Box::new(HugePageSegment::regular(len)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huge_page_size_bytes() {
        assert_eq!(HugePageSize::MB2.bytes(), 2 * 1024 * 1024);
        assert_eq!(HugePageSize::GB1.bytes(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_regular_segment_read_write() {
        let segment = HugePageSegment::regular(4096).unwrap();
        assert_eq!(segment.memory_type(), MemoryType::Anonymous);
        assert!(segment.page_size().is_none());

        let ptr = segment.as_ptr().as_ptr();
        unsafe {
            std::ptr::write(ptr, 42);
            std::ptr::write(ptr.add(1), 43);
            assert_eq!(std::ptr::read(ptr), 42);
            assert_eq!(std::ptr::read(ptr.add(1)), 43);
        }
    }

    #[test]
    fn test_zero_size_fails() {
        assert!(HugePageSegment::new(HugePageSize::MB2, 0).is_err());
        assert!(HugePageSegment::regular(0).is_err());
    }

    #[test]
    fn test_huge_segment_rounds_up_when_available() {
        // Huge pages are rarely reserved on CI hosts; only check the shape
        // when the kernel actually hands one out.
        match HugePageSegment::new(HugePageSize::MB2, 4096) {
            Ok(segment) => {
                assert_eq!(segment.len(), HugePageSize::MB2.bytes());
                assert!(segment.memory_type().is_huge());
            }
            Err(e) => assert!(matches!(e, Error::ResourceExhausted(_))),
        }
    }

    #[test]
    fn test_sources() {
        assert_eq!(HugeTlbSource::default().granularity(), 2 * 1024 * 1024);
        assert_eq!(AnonymousSource.granularity(), 2 * 1024 * 1024);

        let segment = AnonymousSource.create(2 * 1024 * 1024).unwrap();
        assert_eq!(segment.len(), 2 * 1024 * 1024);
    }
}
