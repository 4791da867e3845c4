//! Drives the allocator through the Rust global allocator hook with
//! ordinary collection churn.

use std::sync::Arc;

use spanalloc::SpanAlloc;

#[global_allocator]
static GLOBAL: SpanAlloc = SpanAlloc;

#[test]
fn multithreaded_vec_churn() {
    let num_threads = 8;
    let iterations = 1000;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            std::thread::spawn(move || {
                let mut vecs: Vec<Vec<u64>> = Vec::new();
                for i in 0..iterations {
                    let v: Vec<u64> = (0..50).map(|x| x + t * iterations + i).collect();
                    vecs.push(v);
                    if vecs.len() > 10 {
                        vecs.remove(0);
                    }
                }
                vecs.iter().map(Vec::len).sum::<usize>()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap() > 0);
    }
}

#[test]
fn cross_thread_box_free() {
    let num_threads = 4;
    let items_per_thread = 500;

    let (tx, rx) = std::sync::mpsc::channel::<Vec<Box<[u8; 64]>>>();

    let producers: Vec<_> = (0..num_threads)
        .map(|_| {
            let tx = tx.clone();
            std::thread::spawn(move || {
                let items: Vec<Box<[u8; 64]>> = (0..items_per_thread)
                    .map(|i| {
                        let mut arr = [0u8; 64];
                        arr[0] = (i & 0xff) as u8;
                        Box::new(arr)
                    })
                    .collect();
                tx.send(items).unwrap();
            })
        })
        .collect();
    drop(tx);

    let mut total = 0;
    for items in rx {
        total += items.len();
        drop(items); // frees memory allocated by other threads
    }
    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(total, num_threads * items_per_thread);
}

#[test]
fn arc_shared_across_threads() {
    let data = Arc::new(vec![1u64, 2, 3, 4, 5]);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let data = Arc::clone(&data);
            std::thread::spawn(move || {
                assert_eq!(data.len(), 5);
                assert_eq!(data[2], 3);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn mixed_size_collections() {
    let handles: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                let mut allocs: Vec<Box<dyn std::any::Any>> = Vec::new();
                for i in 0..200 {
                    match i % 6 {
                        0 => allocs.push(Box::new([0u8; 8])),
                        1 => allocs.push(Box::new([0u8; 64])),
                        2 => allocs.push(Box::new([0u8; 512])),
                        3 => allocs.push(Box::new([0u8; 4096])),
                        4 => allocs.push(Box::new(vec![0u8; 16384])),
                        _ => allocs.push(Box::new(vec![0u8; 3_000_000])),
                    }
                    if allocs.len() > 50 {
                        allocs.drain(..25);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn strings_grow_and_shrink() {
    let mut text = String::new();
    for i in 0..10_000 {
        text.push_str("spanalloc ");
        if i % 1000 == 0 {
            text.shrink_to_fit();
        }
    }
    assert_eq!(text.len(), 10 * 10_000);
    let collected: Vec<String> = text.split_whitespace().map(str::to_owned).collect();
    assert_eq!(collected.len(), 10_000);
}
