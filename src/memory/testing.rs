//! In-process stand-ins for the kernel and hook services.
//!
//! - [`HeapSegmentSource`]: huge segments from the heap, with a creation budget
//! - [`RecordingForkExclusion`]: records excluded ranges, can inject failures
//! - [`FakeKernelMapper`]: contiguous pages up to a configurable block order
//! - [`TestExternalAllocator`], [`TestCustomAllocator`]: counting hooks
//!
//! They let the allocators be exercised on hosts without huge pages or the
//! device driver, and make the failure paths reachable.

use super::fork::ForkExclusion;
use super::heap::HeapSegment;
use super::hooks::{CustomAllocation, CustomAllocator, ExternalAllocator, ResourceKind};
use super::kernel::{KernelMapper, MapError};
use super::segment::{MemorySegment, MemoryType, SegmentSource};
use crate::error::{Error, Result};
use rustix::io::Errno;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment of every fake allocation; a typical page size.
const FAKE_PAGE_SIZE: usize = 4096;

/// Live-allocation bookkeeping shared by the fakes.
#[derive(Default)]
struct Allocations {
    live: Mutex<HashMap<usize, HeapSegment>>,
}

impl Allocations {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let segment = HeapSegment::with_alignment(size.max(1), FAKE_PAGE_SIZE).ok()?;
        let ptr = segment.as_ptr();
        self.lock().insert(ptr.as_ptr() as usize, segment);
        Some(ptr)
    }

    fn free(&self, ptr: NonNull<u8>) {
        let removed = self.lock().remove(&(ptr.as_ptr() as usize));
        assert!(removed.is_some(), "freed unknown pointer {:?}", ptr);
    }

    fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, HeapSegment>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// Segment source
// =============================================================================

/// [`SegmentSource`] handing out heap memory in place of huge pages.
pub struct HeapSegmentSource {
    created: AtomicUsize,
    live: Arc<AtomicUsize>,
    bytes_live: Arc<AtomicUsize>,
    /// Creations still allowed; `usize::MAX` for unlimited.
    budget: AtomicUsize,
}

impl HeapSegmentSource {
    /// Source without a creation limit.
    pub fn new() -> Self {
        Self::with_budget(usize::MAX)
    }

    /// Source that allows `budget` segment creations, then fails.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            created: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            bytes_live: Arc::new(AtomicUsize::new(0)),
            budget: AtomicUsize::new(budget),
        }
    }

    /// Source that never creates a segment.
    pub fn failing() -> Self {
        Self::with_budget(0)
    }

    /// Segments created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Segments created and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Bytes held by live segments.
    pub fn bytes_live(&self) -> usize {
        self.bytes_live.load(Ordering::SeqCst)
    }
}

impl Default for HeapSegmentSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentSource for HeapSegmentSource {
    fn create(&self, len: usize) -> Result<Box<dyn MemorySegment>> {
        let allowed = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            });
        if allowed.is_err() {
            return Err(Error::ResourceExhausted("segment budget spent".into()));
        }

        let inner = HeapSegment::with_alignment(len, FAKE_PAGE_SIZE)?;
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        self.bytes_live.fetch_add(len, Ordering::SeqCst);

        Ok(Box::new(TrackedSegment {
            inner,
            live: Arc::clone(&self.live),
            bytes_live: Arc::clone(&self.bytes_live),
        }))
    }
}

struct TrackedSegment {
    inner: HeapSegment,
    live: Arc<AtomicUsize>,
    bytes_live: Arc<AtomicUsize>,
}

impl MemorySegment for TrackedSegment {
    fn as_ptr(&self) -> NonNull<u8> {
        self.inner.as_ptr()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Heap
    }
}

impl Drop for TrackedSegment {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.bytes_live.fetch_sub(self.inner.len(), Ordering::SeqCst);
    }
}

// =============================================================================
// Fork exclusion
// =============================================================================

/// [`ForkExclusion`] that records ranges instead of calling `madvise`.
#[derive(Default)]
pub struct RecordingForkExclusion {
    excluded: Mutex<HashMap<usize, usize>>,
    fail_next: AtomicUsize,
}

impl RecordingForkExclusion {
    /// Recorder that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` exclusions.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Whether exactly `addr..addr + len` is currently excluded.
    pub fn is_excluded(&self, addr: NonNull<u8>, len: usize) -> bool {
        self.lock().get(&(addr.as_ptr() as usize)) == Some(&len)
    }

    /// Number of ranges currently excluded.
    pub fn excluded_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, usize>> {
        self.excluded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ForkExclusion for RecordingForkExclusion {
    fn exclude(&self, addr: NonNull<u8>, len: usize) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::ForkExclusion {
                addr: addr.as_ptr() as usize,
                len,
                source: Errno::NOMEM,
            });
        }

        self.lock().insert(addr.as_ptr() as usize, len);
        Ok(())
    }

    fn include(&self, addr: NonNull<u8>, _len: usize) {
        self.lock().remove(&(addr.as_ptr() as usize));
    }
}

// =============================================================================
// Kernel mapper
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum MapperMode {
    /// Succeed at or below this block order.
    UpTo(u32),
    /// Fail every request transiently.
    Exhausted,
    /// Report the capability as missing.
    Unsupported,
}

/// [`KernelMapper`] serving contiguous pages from the heap.
pub struct FakeKernelMapper {
    mode: MapperMode,
    attempts: Mutex<Vec<u32>>,
    allocations: Allocations,
}

impl FakeKernelMapper {
    /// Mapper that succeeds at any block order.
    pub fn new() -> Self {
        Self::up_to_order(u32::MAX)
    }

    /// Mapper that fails transiently above `order` and succeeds at or below it.
    pub fn up_to_order(order: u32) -> Self {
        Self::with_mode(MapperMode::UpTo(order))
    }

    /// Mapper whose every request fails transiently.
    pub fn exhausted() -> Self {
        Self::with_mode(MapperMode::Exhausted)
    }

    /// Mapper reporting that contiguous pages are not supported.
    pub fn unsupported() -> Self {
        Self::with_mode(MapperMode::Unsupported)
    }

    fn with_mode(mode: MapperMode) -> Self {
        Self {
            mode,
            attempts: Mutex::new(Vec::new()),
            allocations: Allocations::default(),
        }
    }

    /// Block orders requested so far, in order.
    pub fn attempts(&self) -> Vec<u32> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mappings currently live.
    pub fn live(&self) -> usize {
        self.allocations.count()
    }
}

impl Default for FakeKernelMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelMapper for FakeKernelMapper {
    fn map_contiguous(&self, len: usize, order: u32) -> std::result::Result<NonNull<u8>, MapError> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(order);

        match self.mode {
            MapperMode::Unsupported => Err(MapError::Unsupported),
            MapperMode::Exhausted => Err(MapError::Failed(Errno::NOMEM)),
            MapperMode::UpTo(max) if order > max => Err(MapError::Failed(Errno::NOMEM)),
            MapperMode::UpTo(_) => self
                .allocations
                .alloc(len)
                .ok_or(MapError::Failed(Errno::NOMEM)),
        }
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, _len: usize) {
        self.allocations.free(addr);
    }
}

// =============================================================================
// Allocator hooks
// =============================================================================

/// Counting [`ExternalAllocator`].
#[derive(Default)]
pub struct TestExternalAllocator {
    fail: bool,
    allocations: Allocations,
    calls: AtomicUsize,
}

impl TestExternalAllocator {
    /// Hook that serves every request with page-aligned memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook that fails every request.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Allocation calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Allocations not yet freed.
    pub fn live(&self) -> usize {
        self.allocations.count()
    }
}

impl ExternalAllocator for TestExternalAllocator {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail || size == 0 {
            return None;
        }
        self.allocations.alloc(size)
    }

    fn free(&self, ptr: NonNull<u8>) {
        self.allocations.free(ptr);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CustomMode {
    Allocate,
    Decline,
    Fail,
}

/// Scripted [`CustomAllocator`] recording the kinds it was asked for.
pub struct TestCustomAllocator {
    mode: CustomMode,
    requests: Mutex<Vec<(usize, usize, ResourceKind)>>,
    allocations: Allocations,
}

impl TestCustomAllocator {
    /// Hook that serves every request.
    pub fn allocating() -> Self {
        Self::with_mode(CustomMode::Allocate)
    }

    /// Hook that answers "use the default allocator" to every request.
    pub fn declining() -> Self {
        Self::with_mode(CustomMode::Decline)
    }

    /// Hook that fails every request.
    pub fn failing() -> Self {
        Self::with_mode(CustomMode::Fail)
    }

    fn with_mode(mode: CustomMode) -> Self {
        Self {
            mode,
            requests: Mutex::new(Vec::new()),
            allocations: Allocations::default(),
        }
    }

    /// `(size, alignment, kind)` of every request so far.
    pub fn requests(&self) -> Vec<(usize, usize, ResourceKind)> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Allocations not yet freed.
    pub fn live(&self) -> usize {
        self.allocations.count()
    }
}

impl CustomAllocator for TestCustomAllocator {
    fn alloc(&self, size: usize, alignment: usize, kind: ResourceKind) -> CustomAllocation {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((size, alignment, kind));

        match self.mode {
            CustomMode::Decline => CustomAllocation::UseDefault,
            CustomMode::Fail => CustomAllocation::Failed,
            CustomMode::Allocate if size == 0 => CustomAllocation::Failed,
            CustomMode::Allocate => self
                .allocations
                .alloc(size)
                .map_or(CustomAllocation::Failed, CustomAllocation::Allocated),
        }
    }

    fn free(&self, ptr: NonNull<u8>, _kind: ResourceKind) {
        self.allocations.free(ptr);
    }
}
