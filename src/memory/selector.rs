//! Allocation strategy selection.
//!
//! A request names a preferred [`AllocationType`]; the selector turns it into
//! one concrete allocation:
//!
//! 1. A custom allocator on the request's protection domain is asked first.
//!    It may decline, in which case the request continues below.
//! 2. An external allocator on the context serves everything else, with no
//!    fallback.
//! 3. `Huge`, `PreferHuge` and `Any` try the huge segment manager.
//! 4. `Contiguous`, `PreferContig` and `Any` try contiguous pages.
//! 5. Anything left gets page-aligned anonymous memory.
//!
//! Exact types (`Huge`, `Contiguous`) fail instead of falling through. A
//! per-component environment override replaces the requested type; hooks
//! take priority over both.

use super::alloc_type::AllocationType;
use super::buffer::{Backing, Buffer};
use super::contig::ContigAllocator;
use super::defaults::align_up;
use super::fork::ForkExclusion;
use super::heap::HeapSegment;
use super::hooks::{CustomAllocation, CustomAllocator, ExternalAllocator, ProtectionDomain, ResourceKind};
use super::huge::{SegmentManager, SegmentStats};
use super::segment::MemorySegment;
use crate::config::{AllocConfig, BlockOrderBounds, EnvSource};
use crate::error::{Error, Result};
use std::sync::Arc;

/// A buffer allocation request.
///
/// # Example
///
/// ```rust,ignore
/// let request = AllocRequest::new(64 * 1024, ResourceKind::Qp)
///     .preferred(AllocationType::PreferHuge)
///     .component("QP")
///     .domain(&pd);
/// let buf = allocator.alloc(&request)?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest<'a> {
    size: usize,
    alignment: Option<usize>,
    kind: ResourceKind,
    preferred: AllocationType,
    component: &'a str,
    domain: Option<&'a ProtectionDomain>,
}

impl<'a> AllocRequest<'a> {
    /// Request `size` bytes for a resource of `kind`.
    ///
    /// Defaults: anonymous memory, page alignment, no component overrides,
    /// no protection domain.
    pub fn new(size: usize, kind: ResourceKind) -> Self {
        Self {
            size,
            alignment: None,
            kind,
            preferred: AllocationType::Anonymous,
            component: "",
            domain: None,
        }
    }

    /// Alignment passed to a custom allocator (defaults to the page size).
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }

    /// Preferred allocation type.
    pub fn preferred(mut self, ty: AllocationType) -> Self {
        self.preferred = ty;
        self
    }

    /// Component name used for environment overrides (e.g. `"QP"`).
    pub fn component(mut self, component: &'a str) -> Self {
        self.component = component;
        self
    }

    /// Protection domain the buffer belongs to.
    pub fn domain(mut self, domain: &'a ProtectionDomain) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Chooses an allocation strategy and owns the backends behind it.
pub struct BufferAllocator {
    page_size: usize,
    segments: SegmentManager,
    contig: ContigAllocator,
    fork: Arc<dyn ForkExclusion>,
    external: Option<Arc<dyn ExternalAllocator>>,
    env: Arc<dyn EnvSource>,
}

impl BufferAllocator {
    pub(crate) fn new(
        page_size: usize,
        segments: SegmentManager,
        contig: ContigAllocator,
        fork: Arc<dyn ForkExclusion>,
        external: Option<Arc<dyn ExternalAllocator>>,
        env: Arc<dyn EnvSource>,
    ) -> Self {
        Self {
            page_size,
            segments,
            contig,
            fork,
            external,
            env,
        }
    }

    /// System page size used for anonymous buffers and doorbell pages.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the context has an external allocator.
    pub fn has_external_allocator(&self) -> bool {
        self.external.is_some()
    }

    /// State of the huge segment manager.
    pub fn segment_stats(&self) -> SegmentStats {
        self.segments.stats()
    }

    /// The type a request for `component` would be served with.
    ///
    /// `Custom` if `domain` has a custom allocator, `External` if the
    /// context has an external allocator, otherwise the component's
    /// `<C>_ALLOC_TYPE` override or `default`.
    pub fn resolve_alloc_type(
        &self,
        domain: Option<&ProtectionDomain>,
        component: &str,
        default: AllocationType,
    ) -> AllocationType {
        let config = self.config_for(component);
        self.resolve(domain, &config, default)
    }

    /// Allocate a buffer for `request`.
    ///
    /// # Errors
    ///
    /// - [`Error::HookFailed`] if a custom or external hook fails.
    /// - For exact `Huge` / `Contiguous` requests, the backend's error.
    /// - [`Error::ResourceExhausted`] or [`Error::ForkExclusion`] if even
    ///   anonymous memory cannot be provided.
    pub fn alloc(&self, request: &AllocRequest<'_>) -> Result<Buffer> {
        let config = self.config_for(request.component);
        let mut ty = self.resolve(request.domain, &config, request.preferred);

        if ty == AllocationType::Custom {
            if let Some(hook) = request.domain.and_then(ProtectionDomain::custom_allocator) {
                if let Some(buf) = self.alloc_custom(hook, request)? {
                    return Ok(buf);
                }
                tracing::debug!(kind = ?request.kind, "custom allocator declined, using default path");
            }
            ty = self.resolve(None, &config, request.preferred);
        }

        match (&self.external, ty) {
            (Some(hook), AllocationType::External) => self.alloc_external(hook, request.size),
            _ => self.alloc_preferred(request.size, ty, config.block_orders),
        }
    }

    /// Release a buffer through the path matching how it was allocated.
    ///
    /// # Panics
    ///
    /// Panics if a huge buffer belongs to a different allocator.
    pub fn free(&self, buf: Buffer) {
        let (ptr, len, backing) = buf.into_parts();
        match backing {
            Backing::Empty(_) => {}
            Backing::Anonymous(segment) => {
                self.fork.include(ptr, len);
                drop(segment);
            }
            Backing::Huge(lease) => self.segments.release(lease, self.fork.as_ref()),
            // SAFETY: contiguous buffers are created only by `alloc_contiguous`
            // with exactly this ptr/len, and `buf` is consumed here.
            Backing::Contiguous => unsafe { self.contig.free(ptr, len, self.fork.as_ref()) },
            Backing::External(hook) => {
                self.fork.include(ptr, len);
                hook.free(ptr);
            }
            Backing::Custom { allocator, kind } => allocator.free(ptr, kind),
        }
    }

    /// One page for a doorbell page: external if configured, else anonymous.
    pub(crate) fn alloc_page(&self) -> Result<Buffer> {
        match &self.external {
            Some(hook) => self.alloc_external(hook, self.page_size),
            None => self.alloc_anonymous(self.page_size),
        }
    }

    fn config_for(&self, component: &str) -> AllocConfig {
        if component.is_empty() {
            AllocConfig::default()
        } else {
            AllocConfig::load(self.env.as_ref(), component)
        }
    }

    fn resolve(
        &self,
        domain: Option<&ProtectionDomain>,
        config: &AllocConfig,
        default: AllocationType,
    ) -> AllocationType {
        if domain.and_then(ProtectionDomain::custom_allocator).is_some() {
            AllocationType::Custom
        } else if self.external.is_some() {
            AllocationType::External
        } else {
            config.alloc_type.unwrap_or(default)
        }
    }

    /// Huge, then contiguous, then anonymous, as far as `ty` allows.
    fn alloc_preferred(&self, size: usize, ty: AllocationType, orders: BlockOrderBounds) -> Result<Buffer> {
        if ty.tries_huge() {
            match self.alloc_huge(size) {
                Ok(buf) => return Ok(buf),
                Err(e) if ty == AllocationType::Huge => return Err(e),
                Err(e) => tracing::debug!(
                    error = %e,
                    next = if ty.tries_contiguous() { "contig" } else { "anon" },
                    "huge allocation failed, falling back"
                ),
            }
        }

        if ty.tries_contiguous() {
            match self.alloc_contiguous(size, orders) {
                Ok(buf) => return Ok(buf),
                Err(e) if ty == AllocationType::Contiguous => return Err(e),
                Err(e) => tracing::debug!(error = %e, "contiguous allocation failed, falling back to anon"),
            }
        }

        self.alloc_anonymous(size)
    }

    fn alloc_huge(&self, size: usize) -> Result<Buffer> {
        Ok(match self.segments.acquire(size, self.fork.as_ref())? {
            Some(lease) => Buffer::new(lease.as_ptr(), lease.len(), Backing::Huge(lease)),
            None => Buffer::empty(AllocationType::Huge),
        })
    }

    fn alloc_contiguous(&self, size: usize, orders: BlockOrderBounds) -> Result<Buffer> {
        let addr = self.contig.alloc(size, orders, self.fork.as_ref())?;
        Ok(Buffer::new(addr, size, Backing::Contiguous))
    }

    fn alloc_anonymous(&self, size: usize) -> Result<Buffer> {
        if size == 0 {
            return Ok(Buffer::empty(AllocationType::Anonymous));
        }

        let len = align_up(size, self.page_size).ok_or_else(|| {
            Error::ResourceExhausted(format!("{} bytes exceeds the address space", size))
        })?;
        let segment = HeapSegment::with_alignment(len, self.page_size)?;
        let ptr = segment.as_ptr();
        // On failure the segment drops here and the memory goes back to the heap.
        self.fork.exclude(ptr, len)?;

        Ok(Buffer::new(ptr, len, Backing::Anonymous(segment)))
    }

    fn alloc_external(&self, hook: &Arc<dyn ExternalAllocator>, size: usize) -> Result<Buffer> {
        let Some(ptr) = hook.alloc(size) else {
            if size == 0 {
                return Ok(Buffer::empty(AllocationType::External));
            }
            return Err(Error::HookFailed(format!(
                "external allocator returned null for {} bytes",
                size
            )));
        };

        if let Err(e) = self.fork.exclude(ptr, size) {
            tracing::debug!(error = %e, "fork exclusion of external buffer failed");
            hook.free(ptr);
            return Err(e);
        }

        Ok(Buffer::new(ptr, size, Backing::External(Arc::clone(hook))))
    }

    /// `Ok(None)` when the hook declines.
    fn alloc_custom(
        &self,
        hook: &Arc<dyn CustomAllocator>,
        request: &AllocRequest<'_>,
    ) -> Result<Option<Buffer>> {
        let alignment = request.alignment.unwrap_or(self.page_size);
        match hook.alloc(request.size, alignment, request.kind) {
            CustomAllocation::UseDefault => Ok(None),
            CustomAllocation::Allocated(ptr) => Ok(Some(Buffer::new(
                ptr,
                request.size,
                Backing::Custom {
                    allocator: Arc::clone(hook),
                    kind: request.kind,
                },
            ))),
            CustomAllocation::Failed if request.size == 0 => {
                Ok(Some(Buffer::empty(AllocationType::Custom)))
            }
            CustomAllocation::Failed => Err(Error::HookFailed(format!(
                "custom allocator failed {} bytes for {:?}",
                request.size, request.kind
            ))),
        }
    }
}

impl std::fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("page_size", &self.page_size)
            .field("segments", &self.segments)
            .field("external", &self.external.is_some())
            .finish_non_exhaustive()
    }
}
