//! Memory segment trait and backing sources.

use crate::error::Result;
use std::ptr::NonNull;

/// Type of memory backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// Page-aligned heap allocation.
    Heap,
    /// Shared anonymous mapping on regular pages.
    Anonymous,
    /// Shared anonymous mapping on huge pages (`MAP_HUGETLB`).
    HugePages,
}

impl MemoryType {
    /// Is the memory backed by huge pages?
    #[inline]
    pub fn is_huge(&self) -> bool {
        matches!(self, MemoryType::HugePages)
    }
}

/// Trait for memory segment backends.
///
/// A memory segment is a contiguous region of memory owned by one value.
/// Dropping the segment returns the memory to the system.
///
/// # Safety
///
/// Implementations must ensure that:
/// - The pointer remains valid for the lifetime of the segment
/// - Thread-safety requirements are met (Send + Sync)
/// - The start is aligned to at least the system page size
pub trait MemorySegment: Send + Sync {
    /// Pointer to the start of this segment.
    fn as_ptr(&self) -> NonNull<u8>;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;
}

/// Factory for the large backing regions that huge buffers are carved from.
///
/// The segment manager calls [`create`](SegmentSource::create) outside its
/// lock, so implementations may block in the kernel.
pub trait SegmentSource: Send + Sync {
    /// Allocate a segment of exactly `len` bytes.
    ///
    /// `len` is always a non-zero multiple of [`granularity`](SegmentSource::granularity).
    fn create(&self, len: usize) -> Result<Box<dyn MemorySegment>>;

    /// Size multiple that segments are rounded to.
    fn granularity(&self) -> usize {
        super::defaults::HUGE_PAGE_SIZE
    }
}
