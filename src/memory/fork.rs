//! Fork exclusion for hardware-visible memory.
//!
//! A region the device can DMA into must not become copy-on-write in a
//! forked child: the first write after `fork` would move the parent's page
//! and leave the device writing into memory the process no longer sees.
//! Every region is excluded before it is handed out and re-included before
//! it goes back to the system.

use super::defaults::{align_down, align_up};
use crate::error::{Error, Result};
use rustix::mm::Advice;
use std::ptr::NonNull;

/// Service that marks regions as not inherited across `fork`.
pub trait ForkExclusion: Send + Sync {
    /// Exclude `addr..addr + len` from copy-on-fork.
    fn exclude(&self, addr: NonNull<u8>, len: usize) -> Result<()>;

    /// Undo [`exclude`](ForkExclusion::exclude) before the region is released.
    ///
    /// Failures are not actionable at this point and are only logged.
    fn include(&self, addr: NonNull<u8>, len: usize);
}

/// Fork exclusion via `madvise(MADV_DONTFORK)` / `madvise(MADV_DOFORK)`.
///
/// Ranges are widened to whole pages, since the advice applies per page.
#[derive(Debug, Clone, Copy)]
pub struct MadviseForkExclusion {
    page_size: usize,
}

impl MadviseForkExclusion {
    /// Use the system page size.
    pub fn new() -> Self {
        Self::with_page_size(rustix::param::page_size())
    }

    /// Use an explicit page size (a power of two).
    pub fn with_page_size(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self { page_size }
    }

    fn page_range(&self, addr: NonNull<u8>, len: usize) -> (usize, usize) {
        let start = align_down(addr.as_ptr() as usize, self.page_size);
        let end = (addr.as_ptr() as usize)
            .checked_add(len)
            .and_then(|end| align_up(end, self.page_size))
            .unwrap_or(align_down(usize::MAX, self.page_size));
        (start, end - start)
    }

    fn advise(&self, addr: NonNull<u8>, len: usize, advice: Advice) -> rustix::io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        let (start, span) = self.page_range(addr, len);
        // SAFETY: the range covers memory this process owns; the advice only
        // changes fork inheritance, never the contents.
        unsafe { rustix::mm::madvise(start as *mut std::ffi::c_void, span, advice) }
    }
}

impl Default for MadviseForkExclusion {
    fn default() -> Self {
        Self::new()
    }
}

impl ForkExclusion for MadviseForkExclusion {
    fn exclude(&self, addr: NonNull<u8>, len: usize) -> Result<()> {
        self.advise(addr, len, Advice::LinuxDontFork)
            .map_err(|source| Error::ForkExclusion {
                addr: addr.as_ptr() as usize,
                len,
                source,
            })
    }

    fn include(&self, addr: NonNull<u8>, len: usize) {
        if let Err(e) = self.advise(addr, len, Advice::LinuxDoFork) {
            tracing::debug!(addr = ?addr, len, error = %e, "MADV_DOFORK failed");
        }
    }
}
