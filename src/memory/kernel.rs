//! Kernel memory-mapping service for contiguous pages.
//!
//! The device driver hands out physically contiguous memory through `mmap`
//! on its command file descriptor. The page offset passed to `mmap` is not
//! a file offset but an encoded request:
//!
//! ```text
//!   offset = page_size * ((command << 8) | (block_order & 0xff))
//! ```

use super::defaults::{MMAP_CMD_MASK, MMAP_CMD_SHIFT, MMAP_GET_CONTIGUOUS_PAGES_CMD};
use crate::error::Result;
use rustix::fd::{AsFd, OwnedFd};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use std::path::Path;
use std::ptr::NonNull;

/// Why a contiguous mapping request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The kernel does not support contiguous pages at all.
    Unsupported,
    /// The request could not be satisfied at this block order.
    Failed(Errno),
}

/// Source of physically contiguous, device-mappable memory.
pub trait KernelMapper: Send + Sync {
    /// Map `len` bytes of contiguous memory in blocks of `1 << order` bytes.
    fn map_contiguous(&self, len: usize, order: u32) -> std::result::Result<NonNull<u8>, MapError>;

    /// Unmap a region returned by [`map_contiguous`](KernelMapper::map_contiguous).
    ///
    /// # Safety
    ///
    /// `addr` and `len` must describe exactly one live mapping from this
    /// mapper, and nothing may access it afterwards.
    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize);
}

/// Encode a contiguous-pages request into an mmap page offset.
pub fn contiguous_pages_offset(order: u32) -> u64 {
    (MMAP_GET_CONTIGUOUS_PAGES_CMD << MMAP_CMD_SHIFT) | (u64::from(order) & MMAP_CMD_MASK)
}

/// [`KernelMapper`] backed by the device driver's command fd.
#[derive(Debug)]
pub struct DeviceMapper {
    fd: OwnedFd,
    page_size: usize,
}

impl DeviceMapper {
    /// Wrap an already-open command fd.
    pub fn new(fd: OwnedFd, page_size: usize) -> Self {
        Self { fd, page_size }
    }

    /// Open a device node read-write and use it as the command fd.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self::new(OwnedFd::from(file), rustix::param::page_size()))
    }
}

impl KernelMapper for DeviceMapper {
    fn map_contiguous(&self, len: usize, order: u32) -> std::result::Result<NonNull<u8>, MapError> {
        let offset = self.page_size as u64 * contiguous_pages_offset(order);

        // SAFETY: a fresh shared mapping of the device fd aliases nothing.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                self.fd.as_fd(),
                offset,
            )
        }
        .map_err(|errno| {
            // The driver answers EINVAL when it has no contiguous page support.
            if errno == Errno::INVAL {
                MapError::Unsupported
            } else {
                MapError::Failed(errno)
            }
        })?;

        NonNull::new(ptr.cast::<u8>()).ok_or(MapError::Failed(Errno::NOMEM))
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) {
        // SAFETY: caller guarantees this is one of our live mappings.
        if let Err(e) = unsafe { rustix::mm::munmap(addr.as_ptr().cast(), len) } {
            tracing::warn!(len, error = %e, "munmap of contiguous pages failed");
        }
    }
}

/// [`KernelMapper`] for devices without contiguous page support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContiguousPages;

impl KernelMapper for NoContiguousPages {
    fn map_contiguous(&self, _len: usize, _order: u32) -> std::result::Result<NonNull<u8>, MapError> {
        Err(MapError::Unsupported)
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) {
        unreachable!("unmap({:?}, {}) without any mapping", addr, len);
    }
}
