//! Pluggable allocator hooks.
//!
//! Two kinds of hook can take over buffer allocation:
//!
//! - A [`CustomAllocator`] attached to a [`ProtectionDomain`]. It sees the
//!   resource kind and alignment and may decline a request, sending it down
//!   the default path.
//! - An [`ExternalAllocator`] attached to the whole context. When present it
//!   serves every buffer that no custom hook took, with no fallback.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Which device resource a buffer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Queue pair work queues.
    Qp,
    /// Completion queue.
    Cq,
    /// Shared receive queue.
    Srq,
    /// Receive work queue.
    Rwq,
    /// Doorbell record.
    DoorbellRecord,
}

/// Answer from [`CustomAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomAllocation {
    /// The hook allocated memory.
    Allocated(NonNull<u8>),
    /// The hook could not allocate.
    Failed,
    /// The hook declines; use the default allocation path.
    UseDefault,
}

/// Allocator hook attached to a protection domain.
pub trait CustomAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `alignment` for `kind`.
    fn alloc(&self, size: usize, alignment: usize, kind: ResourceKind) -> CustomAllocation;

    /// Free memory previously returned by [`alloc`](CustomAllocator::alloc).
    fn free(&self, ptr: NonNull<u8>, kind: ResourceKind);
}

/// Process-wide allocator hook attached to a context.
pub trait ExternalAllocator: Send + Sync {
    /// Allocate `size` bytes, or `None` on failure.
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Free memory previously returned by [`alloc`](ExternalAllocator::alloc).
    fn free(&self, ptr: NonNull<u8>);
}

/// A resource domain that buffers are allocated on behalf of.
///
/// Carries the domain's optional [`CustomAllocator`].
#[derive(Clone, Default)]
pub struct ProtectionDomain {
    allocator: Option<Arc<dyn CustomAllocator>>,
}

impl ProtectionDomain {
    /// Domain without a custom allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Domain whose buffers are offered to `allocator` first.
    pub fn with_allocator(allocator: Arc<dyn CustomAllocator>) -> Self {
        Self {
            allocator: Some(allocator),
        }
    }

    /// The domain's custom allocator, if any.
    pub fn custom_allocator(&self) -> Option<&Arc<dyn CustomAllocator>> {
        self.allocator.as_ref()
    }
}

impl fmt::Debug for ProtectionDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionDomain")
            .field("custom_allocator", &self.allocator.is_some())
            .finish()
    }
}
