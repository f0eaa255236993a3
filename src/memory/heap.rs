//! Page-aligned heap allocations.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use std::alloc::Layout;
use std::ptr::NonNull;

/// A memory segment backed by an aligned heap allocation.
///
/// This backs anonymous buffers and doorbell pages: memory obtained from
/// the global allocator with page alignment, so whole pages can be excluded
/// from `fork`. The memory is zero-initialized.
///
/// # Example
///
/// ```rust
/// use devbuf::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::with_alignment(8192, 4096).unwrap();
/// assert_eq!(segment.len(), 8192);
/// assert_eq!(segment.as_ptr().as_ptr() as usize % 4096, 0);
/// ```
pub struct HeapSegment {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapSegment {
    /// Allocate `size` zeroed bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is 0, `align` is not a power of two, or the
    /// global allocator fails.
    pub fn with_alignment(size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("size must be greater than 0".into()));
        }

        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::InvalidArgument(format!("bad layout: {}", e)))?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::ResourceExhausted(format!("heap allocation of {} bytes failed", size))
        })?;

        Ok(Self { ptr, layout })
    }

    /// Alignment the segment was allocated with.
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Heap
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for HeapSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapSegment")
            .field("ptr", &self.ptr)
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

// SAFETY: the allocation is exclusively owned and plain memory.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}
