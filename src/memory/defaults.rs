//! Fixed sizes and platform bounds used by the allocators.
//!
//! These are hardware and kernel contract values rather than tunables.
//! The per-component knobs that *can* be tuned at runtime live in
//! [`crate::config`] and are validated against the bounds defined here.

// =============================================================================
// Huge page segments
// =============================================================================

/// Size of one chunk of a huge page segment (32 KiB).
///
/// Every huge buffer is rounded up to a whole number of chunks.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Platform huge page size (2 MiB). Segments are sized in multiples of this.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Chunks in one huge page.
pub const CHUNKS_PER_HUGE_PAGE: usize = HUGE_PAGE_SIZE / CHUNK_SIZE;

// =============================================================================
// Contiguous pages
// =============================================================================

/// Largest log2 block size the kernel accepts for contiguous pages (8 MiB).
pub const MAX_LOG2_CONTIG_BLOCK_SIZE: u32 = 23;

/// Smallest log2 block size the kernel accepts for contiguous pages (4 KiB).
pub const MIN_LOG2_CONTIG_BLOCK_SIZE: u32 = 12;

/// mmap command selecting contiguous page allocation on the device fd.
pub const MMAP_GET_CONTIGUOUS_PAGES_CMD: u64 = 1;

/// Bit position of the command within the mmap page offset.
pub const MMAP_CMD_SHIFT: u32 = 8;

/// Mask for the argument (block order) within the mmap page offset.
pub const MMAP_CMD_MASK: u64 = 0xff;

// =============================================================================
// Doorbell records
// =============================================================================

/// Default CPU cache line size; one doorbell record occupies one line.
pub const DEFAULT_CACHE_LINE_SIZE: usize = 64;

/// Smallest usable doorbell record.
pub const MIN_DOORBELL_RECORD_SIZE: usize = 8;

/// Size and alignment requested from custom hooks for a single record.
pub const DOORBELL_RECORD_SIZE: usize = 8;

/// Round `value` up to a multiple of `align` (a power of two).
///
/// `None` if the rounded value does not fit in a `usize`.
#[inline]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_geometry() {
        assert_eq!(CHUNKS_PER_HUGE_PAGE, 64);
        assert_eq!(HUGE_PAGE_SIZE % CHUNK_SIZE, 0);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(50_000, CHUNK_SIZE), Some(65_536));
        assert_eq!(align_up(CHUNK_SIZE, CHUNK_SIZE), Some(CHUNK_SIZE));
        assert_eq!(align_up(0, CHUNK_SIZE), Some(0));
        assert_eq!(align_up(1, 4096), Some(4096));
    }

    #[test]
    fn test_align_up_overflow() {
        assert_eq!(align_up(usize::MAX - 10, 4096), None);
        assert_eq!(align_up(usize::MAX, 1), Some(usize::MAX));
        assert_eq!(align_up(usize::MAX - 4095, 4096), Some(usize::MAX - 4095));
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0x1234, 0x1000), 0x1000);
        assert_eq!(align_down(0x2000, 0x1000), 0x2000);
    }

    #[test]
    fn test_block_order_bounds_are_ordered() {
        assert!(MIN_LOG2_CONTIG_BLOCK_SIZE < MAX_LOG2_CONTIG_BLOCK_SIZE);
    }
}
