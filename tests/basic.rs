//! Single-threaded exercises of the raw allocation API.

use spanalloc::{
    allocate, allocate_aligned, allocate_zeroed, deallocate, reallocate, reallocate_aligned,
    reallocate_with, usable_size, REALLOC_GROW_OR_FAIL, REALLOC_NO_PRESERVE,
    REALLOC_PRESERVE_DEFAULT,
};

fn fill(ptr: *mut u8, len: usize, seed: u8) {
    for i in 0..len {
        unsafe { *ptr.add(i) = seed.wrapping_add(i as u8) };
    }
}

fn check(ptr: *const u8, len: usize, seed: u8) {
    for i in 0..len {
        assert_eq!(
            unsafe { *ptr.add(i) },
            seed.wrapping_add(i as u8),
            "byte {} of {}",
            i,
            len
        );
    }
}

#[test]
fn small_round_trip() {
    assert!(spanalloc::init());
    let ptr = allocate(16);
    assert!(!ptr.is_null());
    assert_eq!(unsafe { usable_size(ptr) }, 16);
    fill(ptr, 16, 7);
    check(ptr, 16, 7);
    unsafe { deallocate(ptr) };
}

#[test]
fn small_sizes_round_to_granularity() {
    for size in 0..=1024usize {
        let ptr = allocate(size);
        assert!(!ptr.is_null(), "size {}", size);
        let expect = 16 * ((size.max(1) + 15) / 16);
        assert_eq!(unsafe { usable_size(ptr) }, expect, "size {}", size);
        if size > 0 {
            fill(ptr, size, size as u8);
            check(ptr, size, size as u8);
        }
        unsafe { deallocate(ptr) };
    }
}

#[test]
fn medium_and_large_sizes_are_usable() {
    for &size in &[2000usize, 17_000, 70_000, 130_000, 600_000, 2_000_000] {
        let ptr = allocate(size);
        assert!(!ptr.is_null(), "size {}", size);
        let usable = unsafe { usable_size(ptr) };
        assert!(usable >= size, "size {} usable {}", size, usable);
        fill(ptr, size, 3);
        check(ptr, size, 3);
        unsafe { deallocate(ptr) };
    }
}

#[test]
fn zero_size_yields_minimum_block() {
    let ptr = allocate(0);
    assert!(!ptr.is_null());
    assert_eq!(unsafe { usable_size(ptr) }, 16);
    unsafe { deallocate(ptr) };
}

#[test]
fn deallocate_null_is_noop() {
    unsafe { deallocate(core::ptr::null_mut()) };
}

#[test]
fn zeroed_allocation_is_zero_even_when_recycled() {
    // Dirty a block, free it, then request zeroed memory of the same
    // class; the recycled block must be cleared.
    let dirty = allocate(48);
    assert!(!dirty.is_null());
    fill(dirty, 48, 0xab);
    unsafe { deallocate(dirty) };

    let ptr = allocate_zeroed(3, 16);
    assert!(!ptr.is_null());
    for i in 0..48 {
        assert_eq!(unsafe { *ptr.add(i) }, 0, "byte {}", i);
    }
    unsafe { deallocate(ptr) };
}

#[test]
fn zeroed_allocation_checks_overflow() {
    let ptr = allocate_zeroed(usize::MAX, 16);
    assert!(ptr.is_null());
}

#[test]
fn aligned_allocations() {
    for &alignment in &[2usize, 8, 16, 32, 64, 128, 1 << 12, 1 << 16, 1 << 20] {
        for &size in &[1usize, 24, 500, 5000] {
            let ptr = allocate_aligned(alignment, size);
            assert!(!ptr.is_null(), "alignment {} size {}", alignment, size);
            assert_eq!(ptr as usize % alignment, 0, "alignment {}", alignment);
            assert!(unsafe { usable_size(ptr) } >= size);
            fill(ptr, size, 9);
            check(ptr, size, 9);
            unsafe { deallocate(ptr) };
        }
    }
}

#[test]
fn aligned_rejects_bad_alignments() {
    assert!(allocate_aligned(24, 100).is_null());
    assert!(allocate_aligned(spanalloc::MAX_ALIGNMENT * 2, 100).is_null());
}

#[test]
fn alignment_one_means_default() {
    let ptr = allocate_aligned(1, 100);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % spanalloc::SMALL_GRANULARITY, 0);
    unsafe { deallocate(ptr) };
}

#[test]
fn aligned_reallocation_preserves_data() {
    let ptr = allocate_aligned(128, 200);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 128, 0);
    unsafe { (ptr as *mut u32).write(0x1234_5678) };
    fill(unsafe { ptr.add(4) }, 196, 5);

    let grown = unsafe { reallocate_aligned(ptr, 128, 232, 200, REALLOC_PRESERVE_DEFAULT) };
    assert!(!grown.is_null());
    assert_eq!(grown as usize % 128, 0);
    assert_eq!(unsafe { (grown as *const u32).read() }, 0x1234_5678);
    check(unsafe { grown.add(4) }, 196, 5);
    unsafe { deallocate(grown) };
}

#[test]
fn reallocate_null_allocates() {
    let ptr = unsafe { reallocate(core::ptr::null_mut(), 100) };
    assert!(!ptr.is_null());
    assert!(unsafe { usable_size(ptr) } >= 100);
    unsafe { deallocate(ptr) };
}

#[test]
fn reallocate_to_zero_frees() {
    let ptr = allocate(100);
    assert!(!ptr.is_null());
    let result = unsafe { reallocate(ptr, 0) };
    assert!(result.is_null());
}

#[test]
fn reallocate_within_block_keeps_pointer() {
    let ptr = allocate(100);
    assert!(!ptr.is_null());
    fill(ptr, 100, 11);
    let usable = unsafe { usable_size(ptr) };
    let same = unsafe { reallocate(ptr, usable) };
    assert_eq!(same, ptr);
    check(ptr, 100, 11);
    let shrunk = unsafe { reallocate(ptr, 50) };
    assert_eq!(shrunk, ptr);
    check(ptr, 50, 11);
    unsafe { deallocate(ptr) };
}

#[test]
fn reallocate_growth_copies_contents() {
    let ptr = allocate(64);
    assert!(!ptr.is_null());
    fill(ptr, 64, 42);
    let grown = unsafe { reallocate(ptr, 100_000) };
    assert!(!grown.is_null());
    check(grown, 64, 42);
    unsafe { deallocate(grown) };
}

#[test]
fn reallocate_grow_or_fail() {
    let ptr = allocate(64);
    assert!(!ptr.is_null());
    fill(ptr, 64, 1);
    // Growing past the block would move it, so the call must fail and
    // leave the original block untouched.
    let failed = unsafe { reallocate_with(ptr, 1 << 20, 64, REALLOC_GROW_OR_FAIL) };
    assert!(failed.is_null());
    check(ptr, 64, 1);
    // Shrinking stays in place and succeeds.
    let same = unsafe { reallocate_with(ptr, 32, 64, REALLOC_GROW_OR_FAIL) };
    assert_eq!(same, ptr);
    unsafe { deallocate(ptr) };
}

#[test]
fn reallocate_no_preserve_skips_copy() {
    let ptr = allocate(64);
    assert!(!ptr.is_null());
    fill(ptr, 64, 2);
    let moved = unsafe { reallocate_with(ptr, 100_000, 64, REALLOC_NO_PRESERVE) };
    assert!(!moved.is_null());
    assert!(unsafe { usable_size(moved) } >= 100_000);
    unsafe { deallocate(moved) };
}

#[test]
fn huge_round_trip() {
    let size = 12_345_678usize;
    let ptr = allocate(size);
    assert!(!ptr.is_null());
    let usable = unsafe { usable_size(ptr) };
    assert!(usable >= size);
    unsafe {
        *ptr = 0x5a;
        *ptr.add(size - 1) = 0xa5;
        assert_eq!(*ptr, 0x5a);
        assert_eq!(*ptr.add(size - 1), 0xa5);
    }
    // Growth within the mapped slack stays in place.
    let same = unsafe { reallocate(ptr, size + 16) };
    assert_eq!(same, ptr);
    unsafe { deallocate(ptr) };
}

#[test]
fn live_blocks_do_not_overlap() {
    let sizes = [1usize, 16, 17, 100, 255, 1024, 1025, 4096, 10_000, 70_000, 300_000];
    let mut live: Vec<(usize, usize)> = Vec::new();
    let mut ptrs = Vec::new();
    for round in 0..20 {
        for &size in &sizes {
            let ptr = allocate(size + round);
            assert!(!ptr.is_null());
            let usable = unsafe { usable_size(ptr) };
            live.push((ptr as usize, ptr as usize + usable));
            ptrs.push(ptr);
        }
    }
    live.sort_unstable();
    for pair in live.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "blocks overlap: {:?}", pair);
    }
    for ptr in ptrs {
        unsafe { deallocate(ptr) };
    }
}

#[test]
fn freed_blocks_are_reusable() {
    let first = allocate(48);
    assert!(!first.is_null());
    unsafe { deallocate(first) };
    // The same class allocated again must produce a valid block; it may
    // or may not be the same address.
    let second = allocate(48);
    assert!(!second.is_null());
    fill(second, 48, 6);
    check(second, 48, 6);
    unsafe { deallocate(second) };
}

#[test]
fn init_is_idempotent() {
    assert!(spanalloc::init());
    assert!(spanalloc::init());
}
