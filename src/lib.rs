//! # devbuf
//!
//! Device-visible buffer allocation for user-space RDMA drivers.
//!
//! Queue buffers and doorbell records must be memory the device can DMA to,
//! that survives `fork()` without copy-on-write surprises, and that is cheap
//! to hand out in bulk. devbuf provides:
//!
//! - **Huge page segments**: many buffers packed into shared 2 MiB pages,
//!   32 KiB chunks at a time
//! - **Contiguous pages**: physically contiguous memory from the driver,
//!   retrying with smaller blocks under fragmentation
//! - **Doorbell records**: cache-line slots packed into pages
//! - **Pluggable hooks**: per-domain custom allocators and a context-wide
//!   external allocator
//! - **Per-component overrides** through `<C>_ALLOC_TYPE` and friends
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use devbuf::prelude::*;
//!
//! let ctx = ContextBuilder::new().build()?;
//! let request = AllocRequest::new(64 * 1024, ResourceKind::Qp)
//!     .preferred(AllocationType::PreferHuge)
//!     .component("QP");
//! let buf = ctx.alloc_buf(&request)?;
//! let db = ctx.alloc_doorbell(None)?;
//!
//! ctx.free_doorbell(db);
//! ctx.free_buf(buf);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod context;
pub mod error;
pub mod memory;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::context::{ContextBuilder, DeviceContext};
    pub use crate::error::{Error, Result};
    pub use crate::memory::{
        AllocRequest, AllocationType, Buffer, DoorbellRecord, ProtectionDomain, ResourceKind,
    };
}

pub use context::{ContextBuilder, DeviceContext};
pub use error::{Error, Result};
