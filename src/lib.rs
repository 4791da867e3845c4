//! spanalloc: a thread-caching, span-based memory allocator.
//!
//! Address space is partitioned into naturally aligned spans, spans into
//! fixed-size pages, pages into equal-size blocks of one size class.
//! Every thread owns a heap of pages; allocating or freeing a small
//! block on its owning thread is lock-free and touches no shared state.
//! Frees from other threads are deferred through a per-page atomic list
//! that the owner adopts in bulk.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: spanalloc::SpanAlloc = spanalloc::SpanAlloc;
//! ```
//!
//! The raw entry points ([`allocate`], [`deallocate`], [`reallocate`],
//! [`usable_size`], ...) mirror the C allocator surface and can be used
//! without registering the global allocator. Initialization is implicit
//! on first use; [`init_with`] allows passing options beforehand.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;

use errno::{set_errno, Errno};

mod heap;
mod init;
mod internal;
mod os;
mod page;
mod size_class;
mod span;
pub mod stats;
mod types;

pub use init::{
    finalize, init, init_with, is_thread_initialized, thread_finalize, thread_init, AllocConfig,
};
pub use os::{MapFn, MapResult, UnmapFn};
pub use types::{MAX_ALIGNMENT, SMALL_GRANULARITY};

use init::with_heap;
use internal::checked_total;

/// Default reallocation behavior: preserve contents.
pub const REALLOC_PRESERVE_DEFAULT: u32 = 0;
/// Do not copy contents into a moved block.
pub const REALLOC_NO_PRESERVE: u32 = 1;
/// Fail (returning null, old block untouched) instead of moving.
pub const REALLOC_GROW_OR_FAIL: u32 = 2;

// Requests at or above this are rejected as invalid rather than passed
// to the OS.
const MAX_ALLOCATION_SIZE: usize = usize::MAX / 2;

#[inline]
fn out_of_memory() -> *mut u8 {
    set_errno(Errno(libc::ENOMEM));
    null_mut()
}

#[inline]
fn invalid_argument() -> *mut u8 {
    set_errno(Errno(libc::EINVAL));
    null_mut()
}

fn allocate_inner(size: usize, zero: bool) -> *mut u8 {
    if size >= MAX_ALLOCATION_SIZE {
        return invalid_argument();
    }
    match unsafe { with_heap(|heap| heap::heap_allocate_block(heap, size, zero)) } {
        Some(ptr) if !ptr.is_null() => ptr,
        _ => out_of_memory(),
    }
}

/// Allocate `size` bytes, aligned to at least [`SMALL_GRANULARITY`].
/// Returns null with errno set on failure. A zero size yields a valid
/// minimum-size block.
pub fn allocate(size: usize) -> *mut u8 {
    allocate_inner(size, false)
}

/// Allocate a zeroed array of `count` elements of `size` bytes each,
/// checking the product for overflow.
pub fn allocate_zeroed(count: usize, size: usize) -> *mut u8 {
    match checked_total(count, size) {
        Some(total) => allocate_inner(total, true),
        None => invalid_argument(),
    }
}

/// Allocate `size` bytes aligned to `alignment`, which must be a power
/// of two no larger than [`MAX_ALIGNMENT`]. Alignments of 0 and 1 mean
/// no requirement beyond the default.
pub fn allocate_aligned(alignment: usize, size: usize) -> *mut u8 {
    if alignment <= 1 {
        return allocate(size);
    }
    if !alignment.is_power_of_two() || alignment > MAX_ALIGNMENT {
        return invalid_argument();
    }
    if size >= MAX_ALLOCATION_SIZE {
        return invalid_argument();
    }
    match unsafe { with_heap(|heap| heap::heap_allocate_block_aligned(heap, alignment, size, false)) }
    {
        Some(ptr) if !ptr.is_null() => ptr,
        _ => out_of_memory(),
    }
}

/// Resize the block at `ptr` to `size` bytes, moving it if needed.
///
/// `reallocate(null, size)` behaves as [`allocate`]; `size` 0 frees the
/// block and returns null.
///
/// # Safety
///
/// `ptr` must be null or a live pointer obtained from this allocator.
pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
    reallocate_with(ptr, size, 0, REALLOC_PRESERVE_DEFAULT)
}

/// [`reallocate`] with an explicit prior size and `REALLOC_*` flags.
/// `old_size` 0 means unknown; the block's usable size is used.
///
/// # Safety
///
/// `ptr` must be null or a live pointer obtained from this allocator,
/// and `old_size` must not exceed its usable size.
pub unsafe fn reallocate_with(ptr: *mut u8, size: usize, old_size: usize, flags: u32) -> *mut u8 {
    if size == 0 {
        deallocate(ptr);
        return null_mut();
    }
    if size >= MAX_ALLOCATION_SIZE {
        return invalid_argument();
    }
    match with_heap(|heap| heap::heap_reallocate_block(heap, ptr, size, old_size, flags)) {
        Some(new_ptr) if !new_ptr.is_null() => new_ptr,
        _ => out_of_memory(),
    }
}

/// Aligned variant of [`reallocate_with`].
///
/// # Safety
///
/// Same contract as [`reallocate_with`]; `ptr` must have been allocated
/// with the same alignment.
pub unsafe fn reallocate_aligned(
    ptr: *mut u8,
    alignment: usize,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    if alignment > 1 && (!alignment.is_power_of_two() || alignment > MAX_ALIGNMENT) {
        return invalid_argument();
    }
    if size == 0 {
        deallocate(ptr);
        return null_mut();
    }
    if size >= MAX_ALLOCATION_SIZE {
        return invalid_argument();
    }
    match with_heap(|heap| {
        heap::heap_reallocate_block_aligned(heap, ptr, alignment, size, old_size, flags)
    }) {
        Some(new_ptr) if !new_ptr.is_null() => new_ptr,
        _ => out_of_memory(),
    }
}

/// Free a block. Null is a no-op. Safe to call from any thread; frees
/// from threads other than the block's owner are deferred atomically.
///
/// # Safety
///
/// `ptr` must be null or a live pointer obtained from this allocator.
pub unsafe fn deallocate(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    heap::block_deallocate(ptr);
}

/// Usable bytes at `ptr`: the block size of its page minus the in-block
/// offset of `ptr`. At least the size originally requested.
///
/// # Safety
///
/// `ptr` must be a live pointer obtained from this allocator.
pub unsafe fn usable_size(ptr: *const u8) -> usize {
    heap::block_usable_size(ptr)
}

// ------------------------------------------------------
// GlobalAlloc adapter
// ------------------------------------------------------

/// Zero-sized handle registering the allocator as Rust's global
/// allocator.
pub struct SpanAlloc;

unsafe impl GlobalAlloc for SpanAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= SMALL_GRANULARITY {
            allocate_inner(layout.size(), false)
        } else {
            allocate_aligned(layout.align(), layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        deallocate(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= SMALL_GRANULARITY {
            return allocate_inner(layout.size(), true);
        }
        let ptr = allocate_aligned(layout.align(), layout.size());
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        reallocate_aligned(ptr, layout.align(), new_size, layout.size(), REALLOC_PRESERVE_DEFAULT)
    }
}
