//! Concurrent exercises of the raw API: cross-thread deferred frees,
//! producer/consumer handoff, and thread lifecycle churn.

use std::sync::mpsc;
use std::thread;

use spanalloc::{allocate, deallocate, is_thread_initialized, thread_finalize, thread_init, usable_size};

// Raw pointers crossing threads on purpose; the allocator is the thing
// under test.
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

fn fill(ptr: *mut u8, len: usize, seed: u8) {
    for i in 0..len {
        unsafe { *ptr.add(i) = seed.wrapping_add(i as u8) };
    }
}

fn check(ptr: *const u8, len: usize, seed: u8) {
    for i in 0..len {
        assert_eq!(unsafe { *ptr.add(i) }, seed.wrapping_add(i as u8));
    }
}

// Tiny deterministic generator so runs are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[test]
fn blocks_survive_cross_thread_free() {
    assert!(spanalloc::init());
    let (tx, rx) = mpsc::channel::<Vec<(SendPtr, usize)>>();

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let tx = tx.clone();
            thread::spawn(move || {
                for round in 0..20 {
                    let batch: Vec<(SendPtr, usize)> = (0..100)
                        .map(|i| {
                            let size = 16 + ((producer * 31 + round * 7 + i) % 500);
                            let ptr = allocate(size);
                            assert!(!ptr.is_null());
                            fill(ptr, size, size as u8);
                            (SendPtr(ptr), size)
                        })
                        .collect();
                    tx.send(batch).unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    // The consumer verifies contents and frees blocks it never allocated,
    // driving the deferred free path.
    let mut received = 0;
    for batch in rx {
        for (SendPtr(ptr), size) in batch {
            assert!(unsafe { usable_size(ptr) } >= size);
            check(ptr, size, size as u8);
            unsafe { deallocate(ptr) };
            received += 1;
        }
    }
    assert_eq!(received, 4 * 20 * 100);

    for producer in producers {
        producer.join().unwrap();
    }
}

#[test]
fn producer_reuses_pages_emptied_remotely() {
    // One class, allocated on A and freed entirely on B, repeatedly. A
    // must keep allocating successfully as emptied pages come back
    // through the deferred list.
    let (tx, rx) = mpsc::channel::<Vec<SendPtr>>();
    let consumer = thread::spawn(move || {
        for batch in rx {
            for SendPtr(ptr) in batch {
                check(ptr, 64, 0x40);
                unsafe { deallocate(ptr) };
            }
        }
    });

    for _ in 0..50 {
        let batch: Vec<SendPtr> = (0..500)
            .map(|_| {
                let ptr = allocate(64);
                assert!(!ptr.is_null());
                fill(ptr, 64, 0x40);
                SendPtr(ptr)
            })
            .collect();
        tx.send(batch).unwrap();
    }
    drop(tx);
    consumer.join().unwrap();
}

#[test]
fn pairwise_random_churn() {
    let threads = 8;
    let mut senders = Vec::new();
    let mut handles = Vec::new();

    for index in 0..threads {
        let (tx, rx) = mpsc::channel::<Vec<(SendPtr, usize)>>();
        senders.push(tx);
        handles.push(thread::spawn(move || {
            let mut rng = Lcg(0x9e3779b9 ^ index as u64);
            for batch in rx {
                for (SendPtr(ptr), size) in batch {
                    check(ptr, size.min(256), size as u8);
                    unsafe { deallocate(ptr) };
                }
                // Interleave local allocation churn with remote frees.
                let local: Vec<_> = (0..50)
                    .map(|_| {
                        let size = 1 + (rng.next() as usize % 2048);
                        let ptr = allocate(size);
                        assert!(!ptr.is_null());
                        ptr
                    })
                    .collect();
                for ptr in local {
                    unsafe { deallocate(ptr) };
                }
            }
        }));
    }

    let mut rng = Lcg(42);
    for round in 0..40 {
        let target = &senders[round % threads];
        let batch: Vec<(SendPtr, usize)> = (0..100)
            .map(|_| {
                let size = 1 + (rng.next() as usize % 4096);
                let ptr = allocate(size);
                assert!(!ptr.is_null());
                fill(ptr, size.min(256), size as u8);
                (SendPtr(ptr), size)
            })
            .collect();
        target.send(batch).unwrap();
    }
    drop(senders);
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn huge_blocks_free_from_any_thread() {
    let ptr = allocate(5_000_000);
    assert!(!ptr.is_null());
    fill(ptr, 4096, 0x11);
    let sent = SendPtr(ptr);
    thread::spawn(move || {
        let sent = sent;
        let SendPtr(ptr) = sent;
        check(ptr, 4096, 0x11);
        unsafe { deallocate(ptr) };
    })
    .join()
    .unwrap();
}

#[test]
fn thread_lifecycle_churn() {
    let handles: Vec<_> = (0..16)
        .map(|index| {
            thread::spawn(move || {
                for pass in 0..25 {
                    assert!(thread_init());
                    assert!(is_thread_initialized());
                    let mut blocks = Vec::new();
                    for i in 0..200 {
                        let size = 1 + ((index * 131 + pass * 17 + i * 3) % 3000);
                        let ptr = allocate(size);
                        assert!(!ptr.is_null());
                        blocks.push(ptr);
                    }
                    for ptr in blocks {
                        unsafe { deallocate(ptr) };
                    }
                    thread_finalize();
                    assert!(!is_thread_initialized());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
