//! Full lifecycle in one test: init, concurrent churn, huge-span
//! reclaim, thread teardown, and a process-wide finalize that must leave
//! zero OS mappings outstanding. Kept as a single test so the mapping
//! counters are not disturbed by parallel test threads.

use std::thread;

use spanalloc::{allocate, deallocate, stats, thread_finalize, thread_init};

struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

#[test]
fn lifecycle_reclaims_all_mappings() {
    assert!(spanalloc::init());

    // A huge allocation maps a dedicated span; freeing it from another
    // thread must unmap it exactly once, dropping the footprint by at
    // least the payload.
    let huge_size = 12_345_678usize;
    let before_bytes = stats::mapped_bytes();
    let before_ranges = stats::mapped_ranges();
    let ptr = allocate(huge_size);
    assert!(!ptr.is_null());
    assert!(stats::mapped_bytes() >= before_bytes + huge_size);
    assert_eq!(stats::mapped_ranges(), before_ranges + 1);
    let sent = SendPtr(ptr);
    thread::spawn(move || {
        let sent = sent;
        let SendPtr(ptr) = sent;
        unsafe { deallocate(ptr) };
    })
    .join()
    .unwrap();
    assert_eq!(stats::mapped_bytes(), before_bytes);
    assert_eq!(stats::mapped_ranges(), before_ranges);

    // Sixteen threads repeatedly attach a heap, churn mixed sizes, free
    // everything and detach.
    let handles: Vec<_> = (0..16)
        .map(|index| {
            thread::spawn(move || {
                for pass in 0..100 {
                    assert!(thread_init());
                    let mut blocks = Vec::new();
                    for i in 0..500 {
                        let size = 1 + ((index * 977 + pass * 131 + i * 29) % 8000);
                        let block = allocate(size);
                        assert!(!block.is_null());
                        unsafe { *block = index as u8 };
                        blocks.push(block);
                    }
                    for block in blocks {
                        unsafe { deallocate(block) };
                    }
                    thread_finalize();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Everything was freed, so finalize must return every mapping:
    // cached pages, spans, and the heap structures themselves.
    thread_finalize();
    spanalloc::finalize();
    assert_eq!(stats::mapped_ranges(), 0, "outstanding OS mappings after finalize");
    assert_eq!(stats::mapped_bytes(), 0, "outstanding OS bytes after finalize");

    // The allocator comes back up cleanly after a finalize.
    assert!(spanalloc::init());
    let again = allocate(32);
    assert!(!again.is_null());
    unsafe { deallocate(again) };
    thread_finalize();
    spanalloc::finalize();
    assert_eq!(stats::mapped_ranges(), 0);
}
