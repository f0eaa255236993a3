//! Huge page segment manager.
//!
//! Huge buffers are packed into shared backing segments. Each segment is a
//! multiple of the huge page size, divided into [`CHUNK_SIZE`] chunks
//! tracked by a [`RegionBitmap`]. A buffer takes a run of chunks from the
//! first segment (in list order) that has one.
//!
//! # Lifecycle
//!
//! - A segment is created when no existing segment can hold a request.
//!   Creation happens outside the lock; the finished segment is spliced in
//!   at the head if it has spare chunks, at the tail if the first buffer
//!   consumed all of it.
//! - A segment is destroyed as soon as its last chunk is released. Empty
//!   segments are never cached.
//!
//! # Locking
//!
//! The segment list and every segment's bitmap sit behind one spin lock.
//! Hold times are bitmap scans; the lock is never held across `mmap`,
//! `munmap` or `madvise`.

use super::bitmap::RegionBitmap;
use super::defaults::{CHUNK_SIZE, align_up};
use super::fork::ForkExclusion;
use super::segment::{MemorySegment, SegmentSource};
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a live segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u64);

/// One backing segment and its chunk bitmap.
struct HugeSegment {
    id: SegmentId,
    backing: Box<dyn MemorySegment>,
    bitmap: RegionBitmap,
}

impl HugeSegment {
    fn chunk_ptr(&self, chunk: usize) -> NonNull<u8> {
        debug_assert!(chunk < self.bitmap.capacity());
        // SAFETY: chunk is within the segment, so the offset stays in bounds.
        unsafe { self.backing.as_ptr().add(chunk * CHUNK_SIZE) }
    }
}

/// A run of chunks taken from a segment.
///
/// Holds a non-owning reference to the segment (its id) and the chunk
/// range; the segment manager owns the segment itself.
#[derive(Debug)]
pub struct HugeLease {
    segment: SegmentId,
    chunk_offset: usize,
    chunks: usize,
    ptr: NonNull<u8>,
}

impl HugeLease {
    /// Segment the chunks belong to.
    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    /// Index of the first chunk.
    pub fn chunk_offset(&self) -> usize {
        self.chunk_offset
    }

    /// Number of chunks.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Start of the leased memory.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the leased memory in bytes.
    pub fn len(&self) -> usize {
        self.chunks * CHUNK_SIZE
    }

    /// Never true for a lease returned by [`SegmentManager::acquire`].
    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }
}

// SAFETY: the lease only names memory owned by the segment manager.
unsafe impl Send for HugeLease {}
unsafe impl Sync for HugeLease {}

/// Snapshot of the segment manager's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Live segments.
    pub segments: usize,
    /// Chunks across all segments.
    pub total_chunks: usize,
    /// Free chunks across all segments.
    pub free_chunks: usize,
}

/// Allocates chunk runs from huge page segments.
pub struct SegmentManager {
    /// Live segments in search order.
    segments: spin::Mutex<VecDeque<HugeSegment>>,
    /// Creates new backing segments.
    source: Arc<dyn SegmentSource>,
    /// Next segment id.
    next_id: AtomicU64,
}

impl SegmentManager {
    /// Create a manager drawing backing segments from `source`.
    pub fn new(source: Arc<dyn SegmentSource>) -> Self {
        Self {
            segments: spin::Mutex::new(VecDeque::new()),
            source,
            next_id: AtomicU64::new(1),
        }
    }

    /// Take enough chunks for `size` bytes.
    ///
    /// Returns `Ok(None)` when `size` rounds to zero chunks: nothing is
    /// consumed and there is nothing to release.
    ///
    /// The leased range is registered with `fork` before it is returned. If
    /// that fails the chunks are given back (destroying the segment if it is
    /// now empty) and the error is returned.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] if `size` cannot be rounded to whole
    /// chunks, or a new segment is needed and cannot be created, or the
    /// fork exclusion error.
    pub fn acquire(&self, size: usize, fork: &dyn ForkExclusion) -> Result<Option<HugeLease>> {
        let nchunks = align_up(size, CHUNK_SIZE)
            .ok_or_else(|| Error::ResourceExhausted(format!("{} bytes exceeds the address space", size)))?
            / CHUNK_SIZE;
        if nchunks == 0 {
            return Ok(None);
        }

        let lease = match self.acquire_existing(nchunks) {
            Some(lease) => lease,
            None => self.acquire_new(nchunks)?,
        };

        if let Err(e) = fork.exclude(lease.ptr, lease.len()) {
            tracing::debug!(
                segment = lease.segment.0,
                chunk_offset = lease.chunk_offset,
                error = %e,
                "fork exclusion failed, returning chunks"
            );
            self.return_chunks(&lease);
            return Err(e);
        }

        Ok(Some(lease))
    }

    /// Return a lease's chunks; destroys the segment if it becomes empty.
    ///
    /// # Panics
    ///
    /// Panics if the lease's segment is not managed by `self`.
    pub fn release(&self, lease: HugeLease, fork: &dyn ForkExclusion) {
        fork.include(lease.ptr, lease.len());
        self.return_chunks(&lease);
    }

    /// Snapshot of segment and chunk counts.
    pub fn stats(&self) -> SegmentStats {
        let segments = self.segments.lock();
        segments.iter().fold(
            SegmentStats {
                segments: segments.len(),
                ..SegmentStats::default()
            },
            |mut stats, segment| {
                stats.total_chunks += segment.bitmap.capacity();
                stats.free_chunks += segment.bitmap.count_free();
                stats
            },
        )
    }

    /// Ids of live segments in search order.
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments.lock().iter().map(|s| s.id).collect()
    }

    /// First fit over existing non-full segments.
    fn acquire_existing(&self, nchunks: usize) -> Option<HugeLease> {
        let mut segments = self.segments.lock();
        segments
            .iter_mut()
            .filter(|segment| !segment.bitmap.is_full())
            .find_map(|segment| {
                let base = segment.bitmap.find_free_region(nchunks);
                if base == segment.bitmap.capacity() {
                    return None;
                }
                segment.bitmap.fill_region(base, base + nchunks);
                Some(HugeLease {
                    segment: segment.id,
                    chunk_offset: base,
                    chunks: nchunks,
                    ptr: segment.chunk_ptr(base),
                })
            })
    }

    /// Build a new segment outside the lock, then publish it.
    fn acquire_new(&self, nchunks: usize) -> Result<HugeLease> {
        let len = align_up(nchunks * CHUNK_SIZE, self.source.granularity()).ok_or_else(|| {
            Error::ResourceExhausted(format!("segment for {} chunks exceeds the address space", nchunks))
        })?;
        let backing = self.source.create(len).map_err(|e| match e {
            Error::ResourceExhausted(_) => e,
            other => Error::ResourceExhausted(format!("huge segment of {} bytes: {}", len, other)),
        })?;

        let mut bitmap = RegionBitmap::new(backing.len() / CHUNK_SIZE);
        assert!(
            nchunks <= bitmap.capacity(),
            "segment source returned {} bytes for a {} byte request",
            backing.len(),
            len
        );
        bitmap.fill_region(0, nchunks);

        let segment = HugeSegment {
            id: SegmentId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            backing,
            bitmap,
        };
        let lease = HugeLease {
            segment: segment.id,
            chunk_offset: 0,
            chunks: nchunks,
            ptr: segment.chunk_ptr(0),
        };

        tracing::debug!(
            segment = segment.id.0,
            len = segment.backing.len(),
            memory_type = ?segment.backing.memory_type(),
            chunks = nchunks,
            "created huge segment"
        );

        let mut segments = self.segments.lock();
        if segment.bitmap.is_full() {
            segments.push_back(segment);
        } else {
            segments.push_front(segment);
        }

        Ok(lease)
    }

    /// Clear a lease's chunks; unlink and destroy the segment if empty.
    fn return_chunks(&self, lease: &HugeLease) {
        let doomed = {
            let mut segments = self.segments.lock();
            let pos = segments
                .iter()
                .position(|s| s.id == lease.segment)
                .unwrap_or_else(|| {
                    panic!("released chunks of unknown huge segment {:?}", lease.segment)
                });

            let segment = &mut segments[pos];
            segment
                .bitmap
                .zero_region(lease.chunk_offset, lease.chunk_offset + lease.chunks);

            if segment.bitmap.is_empty() {
                segments.remove(pos)
            } else {
                None
            }
        };

        // Unmapped after the lock is dropped; the segment is already unlinked.
        if let Some(segment) = doomed {
            tracing::debug!(segment = segment.id.0, "destroying empty huge segment");
            drop(segment);
        }
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::{HeapSegmentSource, RecordingForkExclusion};
    use proptest::prelude::*;

    fn manager() -> (SegmentManager, Arc<HeapSegmentSource>) {
        let source = Arc::new(HeapSegmentSource::new());
        (SegmentManager::new(source.clone()), source)
    }

    #[test]
    fn test_two_chunk_request_round_trip() {
        let (manager, source) = manager();
        let fork = RecordingForkExclusion::new();

        let lease = manager.acquire(50_000, &fork).unwrap().unwrap();
        assert_eq!(lease.chunks(), 2);
        assert_eq!(lease.len(), 65_536);
        assert_eq!(lease.chunk_offset(), 0);
        assert_eq!(source.created(), 1);
        assert!(fork.is_excluded(lease.as_ptr(), lease.len()));

        manager.release(lease, &fork);
        assert_eq!(manager.stats().segments, 0);
        assert_eq!(source.live(), 0);
        assert_eq!(fork.excluded_count(), 0);
    }

    #[test]
    fn test_zero_size_is_vacuous() {
        let (manager, source) = manager();
        let fork = RecordingForkExclusion::new();

        assert!(manager.acquire(0, &fork).unwrap().is_none());
        assert_eq!(source.created(), 0);
    }

    #[test]
    fn test_size_near_address_space_fails() {
        let (manager, source) = manager();
        let fork = RecordingForkExclusion::new();

        let err = manager.acquire(usize::MAX - 10, &fork).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(source.created(), 0);
        assert_eq!(manager.stats(), SegmentStats::default());
    }

    #[test]
    fn test_existing_segment_reused() {
        let (manager, source) = manager();
        let fork = RecordingForkExclusion::new();

        let a = manager.acquire(CHUNK_SIZE, &fork).unwrap().unwrap();
        let b = manager.acquire(3 * CHUNK_SIZE, &fork).unwrap().unwrap();

        assert_eq!(source.created(), 1);
        assert_eq!(a.segment(), b.segment());
        assert_eq!(b.chunk_offset(), 1);

        let stats = manager.stats();
        assert_eq!(stats.total_chunks, 64);
        assert_eq!(stats.free_chunks, 60);

        manager.release(a, &fork);
        assert_eq!(manager.stats().segments, 1);
        manager.release(b, &fork);
        assert_eq!(manager.stats().segments, 0);
    }

    #[test]
    fn test_full_segment_goes_to_tail() {
        let (manager, _source) = manager();
        let fork = RecordingForkExclusion::new();

        let partial = manager.acquire(CHUNK_SIZE, &fork).unwrap().unwrap();
        let whole = manager.acquire(2 * 1024 * 1024, &fork).unwrap().unwrap();
        assert_ne!(partial.segment(), whole.segment());
        assert_eq!(
            manager.segment_ids(),
            vec![partial.segment(), whole.segment()]
        );

        let spare = manager.acquire(CHUNK_SIZE, &fork).unwrap().unwrap();
        let newest = manager.acquire(63 * CHUNK_SIZE, &fork).unwrap().unwrap();
        // The second partial segment went to the head.
        assert_eq!(spare.segment(), partial.segment());
        assert_eq!(manager.segment_ids()[0], newest.segment());

        for lease in [partial, whole, spare, newest] {
            manager.release(lease, &fork);
        }
        assert_eq!(manager.stats(), SegmentStats::default());
    }

    #[test]
    fn test_large_request_spans_huge_pages() {
        let (manager, source) = manager();
        let fork = RecordingForkExclusion::new();

        let lease = manager.acquire(3 * 1024 * 1024, &fork).unwrap().unwrap();
        assert_eq!(lease.chunks(), 96);
        assert_eq!(manager.stats().total_chunks, 128);
        assert_eq!(source.bytes_live(), 4 * 1024 * 1024);

        manager.release(lease, &fork);
        assert_eq!(source.bytes_live(), 0);
    }

    #[test]
    fn test_creation_failure_is_exhaustion() {
        let source = Arc::new(HeapSegmentSource::failing());
        let manager = SegmentManager::new(source);
        let fork = RecordingForkExclusion::new();

        let err = manager.acquire(CHUNK_SIZE, &fork).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(manager.stats().segments, 0);
    }

    #[test]
    fn test_fork_failure_unwinds_new_segment() {
        let (manager, source) = manager();
        let fork = RecordingForkExclusion::new();
        fork.fail_next(1);

        let err = manager.acquire(CHUNK_SIZE, &fork).unwrap_err();
        assert!(matches!(err, Error::ForkExclusion { .. }));
        assert_eq!(manager.stats().segments, 0);
        assert_eq!(source.live(), 0);
    }

    #[test]
    fn test_fork_failure_keeps_shared_segment() {
        let (manager, source) = manager();
        let fork = RecordingForkExclusion::new();

        let held = manager.acquire(CHUNK_SIZE, &fork).unwrap().unwrap();
        fork.fail_next(1);
        assert!(manager.acquire(CHUNK_SIZE, &fork).is_err());

        let stats = manager.stats();
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.free_chunks, 63);
        assert_eq!(source.live(), 1);

        manager.release(held, &fork);
        assert_eq!(source.live(), 0);
    }

    #[test]
    #[should_panic(expected = "unknown huge segment")]
    fn test_release_into_wrong_manager_panics() {
        let (a, _) = manager();
        let (b, _) = manager();
        let fork = RecordingForkExclusion::new();

        let _keep = a.acquire(CHUNK_SIZE, &fork).unwrap().unwrap();
        let lease = a.acquire(CHUNK_SIZE, &fork).unwrap().unwrap();
        // b has never created a segment.
        b.release(lease, &fork);
    }

    proptest! {
        #[test]
        fn prop_leases_disjoint_and_segments_reclaimed(
            ops in proptest::collection::vec((1usize..40, any::<bool>()), 1..40),
        ) {
            let (manager, source) = manager();
            let fork = RecordingForkExclusion::new();
            let mut live: Vec<HugeLease> = Vec::new();

            for (chunks, release_first) in ops {
                if release_first && !live.is_empty() {
                    let lease = live.remove(chunks % live.len());
                    manager.release(lease, &fork);
                }

                let lease = manager.acquire(chunks * CHUNK_SIZE - 1, &fork).unwrap().unwrap();
                prop_assert_eq!(lease.chunks(), chunks);
                live.push(lease);

                for (i, a) in live.iter().enumerate() {
                    for b in &live[i + 1..] {
                        if a.segment() == b.segment() {
                            let a_end = a.chunk_offset() + a.chunks();
                            let b_end = b.chunk_offset() + b.chunks();
                            prop_assert!(a_end <= b.chunk_offset() || b_end <= a.chunk_offset());
                        }
                    }
                }

                // Every live segment holds at least one lease.
                let stats = manager.stats();
                prop_assert_eq!(stats.segments, source.live());
                prop_assert!(stats.free_chunks < stats.total_chunks || stats.segments == 0);
            }

            for lease in live.drain(..) {
                manager.release(lease, &fork);
            }
            prop_assert_eq!(manager.stats(), SegmentStats::default());
            prop_assert_eq!(source.live(), 0);
        }
    }
}
