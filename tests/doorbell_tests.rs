//! Integration tests for doorbell record allocation.

use devbuf::config::MapEnv;
use devbuf::memory::testing::{HeapSegmentSource, RecordingForkExclusion, TestCustomAllocator};
use devbuf::memory::{DoorbellAllocator, DoorbellStats, ProtectionDomain, ResourceKind};
use devbuf::{ContextBuilder, DeviceContext, Error};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

const PAGE: usize = 4096;

fn context(cache_line_size: usize) -> DeviceContext {
    ContextBuilder::new()
        .page_size(PAGE)
        .cache_line_size(cache_line_size)
        .segment_source(Arc::new(HeapSegmentSource::new()))
        .fork_exclusion(Arc::new(RecordingForkExclusion::new()))
        .env(Arc::new(MapEnv::new()))
        .build()
        .unwrap()
}

// ============================================================================
// Page Lifecycle
// ============================================================================

/// Filling a page takes it off the available list; one free puts it back.
#[test]
fn test_available_list_tracks_full_pages() {
    let ctx = context(128);
    let slots = PAGE / 128;

    let mut records: Vec<_> = (0..slots).map(|_| ctx.alloc_doorbell(None).unwrap()).collect();
    assert_eq!(
        ctx.stats().doorbells,
        DoorbellStats {
            pages: 1,
            available_pages: 0,
            records: slots
        }
    );

    let addrs: HashSet<_> = records.iter().map(|r| r.as_ptr().as_ptr() as usize).collect();
    assert_eq!(addrs.len(), slots);
    assert!(addrs.iter().all(|a| a % 128 == 0));

    ctx.free_doorbell(records.pop().unwrap());
    assert_eq!(ctx.stats().doorbells.available_pages, 1);

    for record in records {
        ctx.free_doorbell(record);
    }
    assert_eq!(ctx.stats().doorbells, DoorbellStats::default());
}

/// A new page goes to the head of the available list.
#[test]
fn test_new_page_served_first() {
    let ctx = context(2048);

    let a = ctx.alloc_doorbell(None).unwrap();
    let b = ctx.alloc_doorbell(None).unwrap();
    // First page is full; the third record opens a second page.
    let c = ctx.alloc_doorbell(None).unwrap();
    let page_of = |p: usize| p / PAGE;
    assert_eq!(page_of(a.as_ptr().as_ptr() as usize), page_of(b.as_ptr().as_ptr() as usize));
    assert_ne!(page_of(a.as_ptr().as_ptr() as usize), page_of(c.as_ptr().as_ptr() as usize));

    // Freeing from the full page puts it back at the head.
    let b_addr = b.as_ptr();
    ctx.free_doorbell(b);
    let d = ctx.alloc_doorbell(None).unwrap();
    assert_eq!(d.as_ptr(), b_addr);

    for record in [a, c, d] {
        ctx.free_doorbell(record);
    }
    assert_eq!(ctx.stats().doorbells.pages, 0);
}

/// A cache line wider than a page fails without leaving pages behind.
#[test]
fn test_cache_line_wider_than_page() {
    let ctx = context(64);
    let doorbells = DoorbellAllocator::new(2 * PAGE).unwrap();

    for _ in 0..3 {
        assert!(matches!(
            doorbells.allocate(ctx.buffers(), None),
            Err(Error::InvalidArgument(_))
        ));
    }
    assert_eq!(doorbells.stats(), DoorbellStats::default());
}

// ============================================================================
// Custom Allocator
// ============================================================================

/// Records from a custom allocator go back to it.
#[test]
fn test_custom_records_bypass_pages() {
    let ctx = context(64);
    let hook = Arc::new(TestCustomAllocator::allocating());
    let pd = ProtectionDomain::with_allocator(hook.clone());

    let custom = ctx.alloc_doorbell(Some(&pd)).unwrap();
    let pooled = ctx.alloc_doorbell(None).unwrap();
    assert!(custom.is_custom());
    assert!(!pooled.is_custom());
    assert_eq!(hook.requests(), vec![(8, 8, ResourceKind::DoorbellRecord)]);
    assert_eq!(ctx.stats().doorbells.records, 1);

    ctx.free_doorbell(custom);
    ctx.free_doorbell(pooled);
    assert_eq!(hook.live(), 0);
    assert_eq!(ctx.stats().doorbells.pages, 0);
}

// ============================================================================
// Concurrency
// ============================================================================

/// Concurrent allocate/free never issues the same address twice.
#[test]
fn test_concurrent_no_double_issue() {
    let ctx = Arc::new(context(64));
    let live = Arc::new(Mutex::new(HashSet::new()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let live = Arc::clone(&live);
            thread::spawn(move || {
                let mut held = Vec::new();
                for round in 0..200 {
                    let record = ctx.alloc_doorbell(None).unwrap();
                    let addr = record.as_ptr().as_ptr() as usize;
                    assert!(
                        live.lock().unwrap().insert(addr),
                        "address {:#x} issued twice",
                        addr
                    );
                    held.push(record);

                    if round % 3 == 0 {
                        let record = held.swap_remove(0);
                        live.lock().unwrap().remove(&(record.as_ptr().as_ptr() as usize));
                        ctx.free_doorbell(record);
                    }
                }
                for record in held {
                    live.lock().unwrap().remove(&(record.as_ptr().as_ptr() as usize));
                    ctx.free_doorbell(record);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(live.lock().unwrap().is_empty());
    assert_eq!(ctx.stats().doorbells, DoorbellStats::default());
}
