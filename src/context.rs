//! Device context: the allocators a device driver instance shares.
//!
//! A [`DeviceContext`] owns one [`BufferAllocator`] and one
//! [`DoorbellAllocator`]. It is built with a [`ContextBuilder`], which wires
//! in the platform services; every service has a default suitable for a
//! Linux host, and tests replace them with the fakes in
//! [`memory::testing`](crate::memory::testing).
//!
//! # Example
//!
//! ```rust,ignore
//! use devbuf::{ContextBuilder, memory::{AllocRequest, ResourceKind}};
//!
//! let ctx = ContextBuilder::new()
//!     .kernel_mapper(Arc::new(DeviceMapper::open("/dev/infiniband/uverbs0")?))
//!     .build()?;
//!
//! let buf = ctx.alloc_buf(&AllocRequest::new(4096, ResourceKind::Cq).component("CQ"))?;
//! let db = ctx.alloc_doorbell(None)?;
//! ctx.free_doorbell(db);
//! ctx.free_buf(buf);
//! ```

use crate::config::{EnvSource, ProcessEnv};
use crate::error::{Error, Result};
use crate::memory::defaults::DEFAULT_CACHE_LINE_SIZE;
use crate::memory::{
    AllocRequest, AllocationType, Buffer, BufferAllocator, ContigAllocator, DoorbellAllocator,
    DoorbellRecord, DoorbellStats, ExternalAllocator, ForkExclusion, HugeTlbSource, KernelMapper,
    MadviseForkExclusion, NoContiguousPages, ProtectionDomain, SegmentManager, SegmentSource,
    SegmentStats,
};
use std::sync::Arc;

/// Snapshot of a context's allocators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Huge segment manager state.
    pub segments: SegmentStats,
    /// Doorbell allocator state.
    pub doorbells: DoorbellStats,
}

/// Allocators for one device context.
#[derive(Debug)]
pub struct DeviceContext {
    buffers: BufferAllocator,
    doorbells: DoorbellAllocator,
}

impl DeviceContext {
    /// Context with default services.
    pub fn new() -> Result<Self> {
        ContextBuilder::new().build()
    }

    /// The buffer allocator.
    pub fn buffers(&self) -> &BufferAllocator {
        &self.buffers
    }

    /// The doorbell record allocator.
    pub fn doorbells(&self) -> &DoorbellAllocator {
        &self.doorbells
    }

    /// Allocate a buffer. See [`BufferAllocator::alloc`].
    pub fn alloc_buf(&self, request: &AllocRequest<'_>) -> Result<Buffer> {
        self.buffers.alloc(request)
    }

    /// Free a buffer from [`alloc_buf`](DeviceContext::alloc_buf).
    pub fn free_buf(&self, buf: Buffer) {
        self.buffers.free(buf)
    }

    /// See [`BufferAllocator::resolve_alloc_type`].
    pub fn resolve_alloc_type(
        &self,
        domain: Option<&ProtectionDomain>,
        component: &str,
        default: AllocationType,
    ) -> AllocationType {
        self.buffers.resolve_alloc_type(domain, component, default)
    }

    /// Allocate a doorbell record.
    pub fn alloc_doorbell(&self, domain: Option<&ProtectionDomain>) -> Result<DoorbellRecord> {
        self.doorbells.allocate(&self.buffers, domain)
    }

    /// Free a record from [`alloc_doorbell`](DeviceContext::alloc_doorbell).
    pub fn free_doorbell(&self, record: DoorbellRecord) {
        self.doorbells.free(&self.buffers, record)
    }

    /// Snapshot of both allocators.
    pub fn stats(&self) -> ContextStats {
        ContextStats {
            segments: self.buffers.segment_stats(),
            doorbells: self.doorbells.stats(),
        }
    }
}

/// Builder for [`DeviceContext`].
///
/// Defaults:
///
/// | Setting          | Default                                  |
/// |------------------|------------------------------------------|
/// | page size        | `rustix::param::page_size()`             |
/// | cache line size  | 64 bytes                                 |
/// | segment source   | [`HugeTlbSource`] (2 MiB pages)          |
/// | kernel mapper    | [`NoContiguousPages`]                    |
/// | fork exclusion   | [`MadviseForkExclusion`]                 |
/// | external hook    | none                                     |
/// | environment      | [`ProcessEnv`]                           |
#[derive(Default)]
pub struct ContextBuilder {
    page_size: Option<usize>,
    cache_line_size: Option<usize>,
    segment_source: Option<Arc<dyn SegmentSource>>,
    kernel_mapper: Option<Arc<dyn KernelMapper>>,
    fork_exclusion: Option<Arc<dyn ForkExclusion>>,
    external: Option<Arc<dyn ExternalAllocator>>,
    env: Option<Arc<dyn EnvSource>>,
}

impl ContextBuilder {
    /// Builder with every setting at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// System page size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Spacing of doorbell records.
    pub fn cache_line_size(mut self, cache_line_size: usize) -> Self {
        self.cache_line_size = Some(cache_line_size);
        self
    }

    /// Backing for huge segments.
    pub fn segment_source(mut self, source: Arc<dyn SegmentSource>) -> Self {
        self.segment_source = Some(source);
        self
    }

    /// Contiguous page provider.
    pub fn kernel_mapper(mut self, mapper: Arc<dyn KernelMapper>) -> Self {
        self.kernel_mapper = Some(mapper);
        self
    }

    /// Fork exclusion service.
    pub fn fork_exclusion(mut self, fork: Arc<dyn ForkExclusion>) -> Self {
        self.fork_exclusion = Some(fork);
        self
    }

    /// Context-wide external allocator.
    pub fn external_allocator(mut self, external: Arc<dyn ExternalAllocator>) -> Self {
        self.external = Some(external);
        self
    }

    /// Source of per-component overrides.
    pub fn env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = Some(env);
        self
    }

    /// Build the context.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the page size is not a power of two, or
    /// the cache line size is not a power of two between 8 bytes and the
    /// page size.
    pub fn build(self) -> Result<DeviceContext> {
        let page_size = self.page_size.unwrap_or_else(rustix::param::page_size);
        if !page_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "page size {} is not a power of two",
                page_size
            )));
        }

        let cache_line_size = self.cache_line_size.unwrap_or(DEFAULT_CACHE_LINE_SIZE);
        if cache_line_size > page_size {
            return Err(Error::InvalidArgument(format!(
                "cache line size {} exceeds page size {}",
                cache_line_size, page_size
            )));
        }
        let doorbells = DoorbellAllocator::new(cache_line_size)?;

        let source = self
            .segment_source
            .unwrap_or_else(|| Arc::new(HugeTlbSource::default()));
        let mapper = self
            .kernel_mapper
            .unwrap_or_else(|| Arc::new(NoContiguousPages));
        let fork = self
            .fork_exclusion
            .unwrap_or_else(|| Arc::new(MadviseForkExclusion::with_page_size(page_size)));
        let env = self.env.unwrap_or_else(|| Arc::new(ProcessEnv));

        tracing::debug!(
            page_size,
            cache_line_size,
            external = self.external.is_some(),
            "building device context"
        );

        let buffers = BufferAllocator::new(
            page_size,
            SegmentManager::new(source),
            ContigAllocator::new(mapper),
            fork,
            self.external,
            env,
        );

        Ok(DeviceContext { buffers, doorbells })
    }
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("page_size", &self.page_size)
            .field("cache_line_size", &self.cache_line_size)
            .field("external", &self.external.is_some())
            .finish_non_exhaustive()
    }
}
