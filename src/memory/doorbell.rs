//! Doorbell record allocator.
//!
//! Doorbell records are tiny (8 bytes) but the device wants each on its own
//! cache line. Whole pages are taken from the buffer allocator and carved
//! into `page_size / cache_line_size` slots, one record per slot.
//!
//! Pages with at least one free slot sit on an available list; allocation
//! takes from its head. A page that fills up leaves the list, goes back to
//! the head when a slot is freed, and is destroyed when its last record is
//! freed. `free` finds a record's page by masking the address down to the
//! page boundary, so every page must be page-aligned.
//!
//! A protection domain with a custom allocator is asked for the record
//! first; the returned [`DoorbellRecord`] remembers which path served it.

use super::bitmap::RegionBitmap;
use super::buffer::Buffer;
use super::defaults::{DOORBELL_RECORD_SIZE, MIN_DOORBELL_RECORD_SIZE, align_down};
use super::hooks::{CustomAllocation, CustomAllocator, ProtectionDomain, ResourceKind};
use super::selector::BufferAllocator;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

/// One page of doorbell slots.
struct DoorbellPage {
    buf: Buffer,
    /// Set bit = free slot.
    slots: RegionBitmap,
    use_count: usize,
}

impl DoorbellPage {
    fn slot_count(&self) -> usize {
        self.slots.capacity()
    }

    fn is_full(&self) -> bool {
        self.use_count == self.slot_count()
    }

    /// Claim the lowest free slot.
    fn take(&mut self, cache_line_size: usize) -> Option<NonNull<u8>> {
        let slot = self.slots.take_first_free()?;
        self.use_count += 1;
        // SAFETY: slot < slot_count, so the offset stays inside the page.
        Some(unsafe { self.buf.as_ptr().add(slot * cache_line_size) })
    }
}

#[derive(Default)]
struct DoorbellPages {
    /// Pages keyed by base address.
    pages: BTreeMap<usize, DoorbellPage>,
    /// Base addresses of pages with a free slot, allocation order.
    available: VecDeque<usize>,
}

impl DoorbellPages {
    fn remove_available(&mut self, base: usize) {
        if let Some(pos) = self.available.iter().position(|&b| b == base) {
            self.available.remove(pos);
        }
    }
}

/// Where a record came from.
#[derive(Clone)]
enum Origin {
    Pool,
    Custom(Arc<dyn CustomAllocator>),
}

/// An allocated doorbell record.
///
/// Move-only; hand it back to [`DoorbellAllocator::free`].
pub struct DoorbellRecord {
    ptr: NonNull<u8>,
    origin: Origin,
}

impl DoorbellRecord {
    /// Address of the record.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Whether the record came from a custom allocator.
    pub fn is_custom(&self) -> bool {
        matches!(self.origin, Origin::Custom(_))
    }
}

impl fmt::Debug for DoorbellRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoorbellRecord")
            .field("ptr", &self.ptr)
            .field("custom", &self.is_custom())
            .finish()
    }
}

// SAFETY: the record is an address plus a Send + Sync hook handle.
unsafe impl Send for DoorbellRecord {}
unsafe impl Sync for DoorbellRecord {}

/// Snapshot of the doorbell allocator's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoorbellStats {
    /// Live pages.
    pub pages: usize,
    /// Pages with at least one free slot.
    pub available_pages: usize,
    /// Records handed out from pages.
    pub records: usize,
}

/// Packs doorbell records into shared pages.
pub struct DoorbellAllocator {
    cache_line_size: usize,
    inner: Mutex<DoorbellPages>,
}

impl DoorbellAllocator {
    /// Allocator placing one record per `cache_line_size` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `cache_line_size` is not a power of two
    /// of at least 8 bytes.
    pub fn new(cache_line_size: usize) -> Result<Self> {
        if !cache_line_size.is_power_of_two() || cache_line_size < MIN_DOORBELL_RECORD_SIZE {
            return Err(Error::InvalidArgument(format!(
                "cache line size {} is not a power of two >= {}",
                cache_line_size, MIN_DOORBELL_RECORD_SIZE
            )));
        }
        Ok(Self {
            cache_line_size,
            inner: Mutex::new(DoorbellPages::default()),
        })
    }

    /// Bytes between consecutive records on a page.
    pub fn cache_line_size(&self) -> usize {
        self.cache_line_size
    }

    /// Allocate one doorbell record.
    ///
    /// # Errors
    ///
    /// - [`Error::HookFailed`] if the domain's custom allocator fails, or a
    ///   page from the external allocator is not page-aligned.
    /// - [`Error::InvalidArgument`] if the cache line size exceeds the page
    ///   size, so a page would hold no record.
    /// - The buffer allocator's error if a new page cannot be created.
    pub fn allocate(
        &self,
        buffers: &BufferAllocator,
        domain: Option<&ProtectionDomain>,
    ) -> Result<DoorbellRecord> {
        if let Some(hook) = domain.and_then(ProtectionDomain::custom_allocator) {
            match hook.alloc(
                DOORBELL_RECORD_SIZE,
                DOORBELL_RECORD_SIZE,
                ResourceKind::DoorbellRecord,
            ) {
                CustomAllocation::Allocated(ptr) => {
                    return Ok(DoorbellRecord {
                        ptr,
                        origin: Origin::Custom(Arc::clone(hook)),
                    });
                }
                CustomAllocation::Failed => {
                    return Err(Error::HookFailed(
                        "custom allocator failed a doorbell record".into(),
                    ));
                }
                CustomAllocation::UseDefault => {}
            }
        }

        if let Some(ptr) = self.take_slot(&mut self.lock()) {
            return Ok(DoorbellRecord {
                ptr,
                origin: Origin::Pool,
            });
        }

        // No page has room; build one and claim its first slot without
        // holding the lock, then publish it.
        let mut page = self.new_page(buffers)?;
        let Some(ptr) = page.take(self.cache_line_size) else {
            buffers.free(page.buf);
            return Err(Error::ResourceExhausted("doorbell page has no slots".into()));
        };
        let base = page.buf.as_ptr().as_ptr() as usize;

        let mut inner = self.lock();
        if !page.is_full() {
            inner.available.push_front(base);
        }
        inner.pages.insert(base, page);
        drop(inner);

        Ok(DoorbellRecord {
            ptr,
            origin: Origin::Pool,
        })
    }

    /// Free a doorbell record.
    ///
    /// # Panics
    ///
    /// Panics if the record's page is not managed by `self` or its slot is
    /// already free.
    pub fn free(&self, buffers: &BufferAllocator, record: DoorbellRecord) {
        let DoorbellRecord { ptr, origin } = record;
        if let Origin::Custom(hook) = origin {
            hook.free(ptr, ResourceKind::DoorbellRecord);
            return;
        }

        let addr = ptr.as_ptr() as usize;
        let base = align_down(addr, buffers.page_size());

        let doomed = {
            let mut inner = self.lock();
            let page = inner
                .pages
                .get_mut(&base)
                .unwrap_or_else(|| panic!("doorbell record {:#x} is not from this allocator", addr));

            let slot = (addr - base) / self.cache_line_size;
            assert!(
                !page.slots.is_free(slot),
                "doorbell record {:#x} freed twice",
                addr
            );

            let was_full = page.is_full();
            page.slots.release(slot);
            page.use_count -= 1;
            let now_unused = page.use_count == 0;

            if now_unused {
                inner.remove_available(base);
                inner.pages.remove(&base)
            } else {
                if was_full {
                    inner.available.push_front(base);
                }
                None
            }
        };

        if let Some(page) = doomed {
            tracing::trace!(base = format_args!("{:#x}", base), "destroying doorbell page");
            buffers.free(page.buf);
        }
    }

    /// Snapshot of page and record counts.
    pub fn stats(&self) -> DoorbellStats {
        let inner = self.lock();
        DoorbellStats {
            pages: inner.pages.len(),
            available_pages: inner.available.len(),
            records: inner.pages.values().map(|p| p.use_count).sum(),
        }
    }

    /// Take a slot from the head of the available list.
    fn take_slot(&self, inner: &mut DoorbellPages) -> Option<NonNull<u8>> {
        let base = *inner.available.front()?;
        let page = inner.pages.get_mut(&base)?;

        let ptr = page.take(self.cache_line_size)?;
        if page.is_full() {
            inner.available.pop_front();
        }
        Some(ptr)
    }

    fn new_page(&self, buffers: &BufferAllocator) -> Result<DoorbellPage> {
        let page_size = buffers.page_size();
        let slot_count = page_size / self.cache_line_size;
        if slot_count == 0 {
            return Err(Error::InvalidArgument(format!(
                "cache line size {} exceeds page size {}",
                self.cache_line_size, page_size
            )));
        }

        let buf = buffers.alloc_page()?;

        let base = buf.as_ptr().as_ptr() as usize;
        if base % page_size != 0 {
            buffers.free(buf);
            return Err(Error::HookFailed(format!(
                "doorbell page {:#x} is not aligned to {} bytes",
                base, page_size
            )));
        }

        tracing::trace!(
            base = format_args!("{:#x}", base),
            slots = slot_count,
            "created doorbell page"
        );

        Ok(DoorbellPage {
            buf,
            slots: RegionBitmap::new(slot_count),
            use_count: 0,
        })
    }

    fn lock(&self) -> MutexGuard<'_, DoorbellPages> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for DoorbellAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoorbellAllocator")
            .field("cache_line_size", &self.cache_line_size)
            .field("stats", &self.stats())
            .finish()
    }
}
