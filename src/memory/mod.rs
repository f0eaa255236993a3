//! Device buffer memory management.
//!
//! This module allocates the memory a device reads and writes directly:
//! queue buffers and doorbell records.
//!
//! # Architecture
//!
//! - [`BufferAllocator`]: picks a strategy per request and frees through the
//!   matching path
//! - [`SegmentManager`]: packs buffers into shared huge page segments
//! - [`ContigAllocator`]: physically contiguous pages from the driver
//! - [`DoorbellAllocator`]: cache-line sized records packed into pages
//! - [`RegionBitmap`]: free-unit tracking shared by segments and pages
//!
//! The kernel and the embedder are reached through traits ([`SegmentSource`],
//! [`KernelMapper`], [`ForkExclusion`], [`CustomAllocator`],
//! [`ExternalAllocator`]) so every path can run against the fakes in
//! [`testing`].
//!
//! # Example
//!
//! ```rust,ignore
//! use devbuf::memory::{AllocRequest, AllocationType, ResourceKind};
//!
//! let ctx = devbuf::ContextBuilder::new().build()?;
//! let request = AllocRequest::new(50_000, ResourceKind::Qp)
//!     .preferred(AllocationType::PreferHuge)
//!     .component("QP");
//! let buf = ctx.alloc_buf(&request)?;
//! // Two 32 KiB chunks of a huge page segment.
//! assert_eq!(buf.len(), 65536);
//! ctx.free_buf(buf);
//! ```

mod alloc_type;
mod bitmap;
mod buffer;
mod contig;
pub mod defaults;
mod doorbell;
mod fork;
mod heap;
mod hooks;
mod huge;
mod huge_pages;
mod kernel;
mod segment;
mod selector;
pub mod testing;

pub use alloc_type::{AllocationType, ParseAllocationTypeError};
pub use bitmap::RegionBitmap;
pub use buffer::Buffer;
pub use contig::{ContigAllocator, block_order};
pub use doorbell::{DoorbellAllocator, DoorbellRecord, DoorbellStats};
pub use fork::{ForkExclusion, MadviseForkExclusion};
pub use heap::HeapSegment;
pub use hooks::{CustomAllocation, CustomAllocator, ExternalAllocator, ProtectionDomain, ResourceKind};
pub use huge::{HugeLease, SegmentId, SegmentManager, SegmentStats};
pub use huge_pages::{AnonymousSource, HugePageSegment, HugePageSize, HugeTlbSource};
pub use kernel::{DeviceMapper, KernelMapper, MapError, NoContiguousPages, contiguous_pages_offset};
pub use segment::{MemorySegment, MemoryType, SegmentSource};
pub use selector::{AllocRequest, BufferAllocator};
