//! Buffers handed out by the strategy selector.

use super::alloc_type::AllocationType;
use super::heap::HeapSegment;
use super::hooks::{CustomAllocator, ExternalAllocator, ResourceKind};
use super::huge::HugeLease;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Where a buffer's memory came from, with what is needed to give it back.
pub(crate) enum Backing {
    /// Zero-length success; nothing to release.
    Empty(AllocationType),
    /// Page-aligned heap memory, freed on drop.
    Anonymous(HeapSegment),
    /// Chunks of a huge page segment.
    Huge(HugeLease),
    /// Contiguous pages mapped from the driver.
    Contiguous,
    /// Memory from the context's external allocator.
    External(Arc<dyn ExternalAllocator>),
    /// Memory from a protection domain's custom allocator.
    Custom {
        allocator: Arc<dyn CustomAllocator>,
        kind: ResourceKind,
    },
}

impl Backing {
    fn alloc_type(&self) -> AllocationType {
        match self {
            Backing::Empty(ty) => *ty,
            Backing::Anonymous(_) => AllocationType::Anonymous,
            Backing::Huge(_) => AllocationType::Huge,
            Backing::Contiguous => AllocationType::Contiguous,
            Backing::External(_) => AllocationType::External,
            Backing::Custom { .. } => AllocationType::Custom,
        }
    }
}

/// A hardware-visible buffer.
///
/// Buffers are move-only: the only way to release one is to hand it back to
/// [`BufferAllocator::free`](super::BufferAllocator::free), which consumes it,
/// so a buffer cannot be freed twice. Dropping a buffer without freeing it
/// leaks its memory (and, for huge buffers, keeps the segment alive).
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

impl Buffer {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize, backing: Backing) -> Self {
        debug_assert!(
            backing.alloc_type().is_concrete(),
            "buffer recorded with preference {}",
            backing.alloc_type()
        );
        Self { ptr, len, backing }
    }

    pub(crate) fn empty(ty: AllocationType) -> Self {
        Self::new(NonNull::dangling(), 0, Backing::Empty(ty))
    }

    pub(crate) fn into_parts(self) -> (NonNull<u8>, usize, Backing) {
        (self.ptr, self.len, self.backing)
    }

    /// Pointer to the start of the buffer.
    ///
    /// Dangling (but non-null) for zero-length buffers.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length in bytes.
    ///
    /// May exceed the requested size: huge buffers are whole chunks and
    /// anonymous buffers whole pages.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-length buffers.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The concrete allocation type that produced this buffer.
    pub fn alloc_type(&self) -> AllocationType {
        self.backing.alloc_type()
    }

    /// The huge segment lease, for huge buffers.
    pub fn huge_lease(&self) -> Option<&HugeLease> {
        match &self.backing {
            Backing::Huge(lease) => Some(lease),
            _ => None,
        }
    }

    /// The buffer as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe memory owned by this buffer.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The buffer as a mutable byte slice.
    ///
    /// The device may write to the memory concurrently; callers coordinate
    /// with it through the device's own protocol.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe memory owned by this buffer, borrowed mutably.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("type", &self.alloc_type())
            .finish()
    }
}

// SAFETY: the buffer exclusively owns its memory; the hooks it may hold are Send + Sync.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}
