use core::ptr::null_mut;
use core::sync::atomic::Ordering;

use crate::init::config;
use crate::internal::{align_up_ptr, page_of_ptr, span_of_page, span_of_ptr, thread_id};
use crate::os::{os_page_size, os_unmap};
use crate::page::{
    page_allocate_block, page_block_start, page_canonical_block, page_free_block_local,
    page_free_block_remote, page_initialize,
};
use crate::size_class::{class_page_type, class_to_size, size_to_class};
use crate::span::{span_allocate_page, span_map, span_map_huge, span_unmap};
use crate::types::{
    Block, Heap, Page, PageType, Span, FREE_PAGE_CACHE_LIMIT, LARGE_BLOCK_LIMIT, MAX_ALIGNMENT,
    MEDIUM_BLOCK_LIMIT, SIZE_CLASS_COUNT, SMALL_BLOCK_LIMIT, SMALL_CLASS_COUNT, SMALL_GRANULARITY,
    SPAN_HEADER_SIZE,
};
use crate::{REALLOC_GROW_OR_FAIL, REALLOC_NO_PRESERVE};

// ------------------------------------------------------
// Intrusive list plumbing
// ------------------------------------------------------

unsafe fn page_list_push(head: *mut *mut Page, page: *mut Page) {
    (*page).prev = null_mut();
    (*page).next = *head;
    if !(*head).is_null() {
        (**head).prev = page;
    }
    *head = page;
}

unsafe fn page_list_remove(head: *mut *mut Page, page: *mut Page) {
    if !(*page).prev.is_null() {
        (*(*page).prev).next = (*page).next;
    } else {
        debug_assert_eq!(*head, page);
        *head = (*page).next;
    }
    if !(*page).next.is_null() {
        (*(*page).next).prev = (*page).prev;
    }
    (*page).prev = null_mut();
    (*page).next = null_mut();
}

unsafe fn span_list_push(head: *mut *mut Span, span: *mut Span) {
    (*span).prev = null_mut();
    (*span).next = *head;
    if !(*head).is_null() {
        (**head).prev = span;
    }
    *head = span;
}

unsafe fn span_list_remove(head: *mut *mut Span, span: *mut Span) {
    if !(*span).prev.is_null() {
        (*(*span).prev).next = (*span).next;
    } else {
        debug_assert_eq!(*head, span);
        *head = (*span).next;
    }
    if !(*span).next.is_null() {
        (*(*span).next).prev = (*span).prev;
    }
    (*span).prev = null_mut();
    (*span).next = null_mut();
}

pub unsafe fn heap_link_available(heap: *mut Heap, page: *mut Page) {
    page_list_push(
        &mut (*heap).available_pages[(*page).size_class as usize],
        page,
    );
}

pub unsafe fn heap_unlink_available(heap: *mut Heap, page: *mut Page) {
    page_list_remove(
        &mut (*heap).available_pages[(*page).size_class as usize],
        page,
    );
}

// ------------------------------------------------------
// Page sourcing
// ------------------------------------------------------

// Pages emptied entirely by remote frees are parked on an atomic stack
// per page type; the owner takes the whole stack at once.
pub unsafe fn heap_defer_free_page(heap: *mut Heap, page: *mut Page) {
    let slot = &(*heap).deferred_pages[(*page).page_type.cache_index()];
    loop {
        let head = slot.load(Ordering::Relaxed);
        (*page).next_deferred = head;
        if slot
            .compare_exchange_weak(head, page, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        core::hint::spin_loop();
    }
}

unsafe fn heap_drain_deferred(heap: *mut Heap, type_idx: usize) -> usize {
    let mut page = (*heap).deferred_pages[type_idx].swap(null_mut(), Ordering::Acquire);
    let mut drained = 0;
    while !page.is_null() {
        let next = (*page).next_deferred;
        (*page).next_deferred = null_mut();
        // The page was full and every block came back through the
        // thread-free list, so adoption empties it completely.
        let adopted = crate::page::page_adopt_thread_free(page);
        debug_assert_eq!(adopted, (*page).block_count);
        debug_assert_eq!((*page).block_used, 0);
        (*page).local_free = null_mut();
        (*page).local_free_count = 0;
        (*page).is_full = false;
        heap_page_free(heap, page, false);
        drained += 1;
        page = next;
    }
    drained
}

// A page with no used blocks left: unlink it, optionally decommit its
// body, and either cache it for reuse or retire it into its span.
pub unsafe fn heap_page_free(heap: *mut Heap, page: *mut Page, was_available: bool) {
    if was_available {
        heap_unlink_available(heap, page);
        (*page).is_available = false;
    }
    debug_assert!(!(*page).is_full && !(*page).is_available);
    (*page).is_free = true;
    (*page).is_zero = false;
    (*page).local_free = null_mut();
    (*page).local_free_count = 0;

    // Decommit the body past the first OS page once the page saw real
    // use. Pages that never initialized much of their body are not worth
    // a kernel call.
    let threshold = config().decommit_threshold as u64;
    let page_size = (*page).page_type.page_size();
    if threshold > 0
        && page_size > os_page_size()
        && (*page).block_initialized as u64 * 100 >= (*page).block_count as u64 * threshold
    {
        let body = (page as *mut u8).add(os_page_size());
        os_unmap(body, page_size - os_page_size(), 0, false);
    }

    let type_idx = (*page).page_type.cache_index();
    if ((*heap).free_page_count[type_idx] as usize) < FREE_PAGE_CACHE_LIMIT[type_idx] {
        (*page).prev = null_mut();
        (*page).next = (*heap).free_pages[type_idx];
        (*heap).free_pages[type_idx] = page;
        (*heap).free_page_count[type_idx] += 1;
    } else {
        heap_retire_page(heap, page);
    }
}

// Retire a free page back into its span. Retired slots are not carved
// again; once the last one goes the whole span is released to the OS.
unsafe fn heap_retire_page(heap: *mut Heap, page: *mut Page) {
    let span = span_of_page(page);
    debug_assert!((*span).page_used > 0);
    (*span).page_used -= 1;
    if (*span).page_used == 0 {
        let type_idx = (*span).page_type.cache_index();
        if (*span).page_initialized == (*span).page_count {
            span_list_remove(&mut (*heap).full_spans[type_idx], span);
        } else {
            span_list_remove(&mut (*heap).partial_spans[type_idx], span);
        }
        span_unmap(span);
    }
}

// Find or create a page able to serve the class. Sources in order:
// available pages, the free-page cache, pages freed back by other
// threads, a partially carved span, a fresh span from the OS.
unsafe fn heap_get_page(heap: *mut Heap, class_idx: usize) -> *mut Page {
    let page = (*heap).available_pages[class_idx];
    if !page.is_null() {
        return page;
    }

    let page_type = class_page_type(class_idx);
    let type_idx = page_type.cache_index();
    loop {
        let page = (*heap).free_pages[type_idx];
        if !page.is_null() {
            (*heap).free_pages[type_idx] = (*page).next;
            (*heap).free_page_count[type_idx] -= 1;
            (*page).next = null_mut();
            page_initialize(page, heap, class_idx);
            (*page).is_available = true;
            heap_link_available(heap, page);
            return page;
        }
        if heap_drain_deferred(heap, type_idx) == 0 {
            break;
        }
    }

    let mut span = (*heap).partial_spans[type_idx];
    if span.is_null() {
        span = span_map(page_type);
        if span.is_null() {
            return null_mut();
        }
        span_list_push(&mut (*heap).partial_spans[type_idx], span);
    }
    let page = span_allocate_page(span, heap);
    if (*span).page_initialized == (*span).page_count {
        span_list_remove(&mut (*heap).partial_spans[type_idx], span);
        span_list_push(&mut (*heap).full_spans[type_idx], span);
    }
    page_initialize(page, heap, class_idx);
    (*page).is_zero = true;
    (*page).is_available = true;
    heap_link_available(heap, page);
    page
}

// ------------------------------------------------------
// Allocation entry points
// ------------------------------------------------------

/// Allocate one block of at least `size` bytes from the heap.
pub unsafe fn heap_allocate_block(heap: *mut Heap, size: usize, zero: bool) -> *mut u8 {
    if size <= SMALL_BLOCK_LIMIT {
        // Fast path: pop the per-class single-block list.
        let class_idx = size_to_class(size);
        let block = (*heap).free_blocks[class_idx];
        if !block.is_null() {
            (*heap).free_blocks[class_idx] = (*block).next;
            if zero {
                core::ptr::write_bytes(block as *mut u8, 0, class_to_size(class_idx));
            }
            return block as *mut u8;
        }
    } else if size > LARGE_BLOCK_LIMIT {
        return heap_allocate_huge(heap, size, 0);
    }
    let class_idx = size_to_class(size);
    let page = heap_get_page(heap, class_idx);
    if page.is_null() {
        return null_mut();
    }
    page_allocate_block(page, zero)
}

// Huge requests bypass pages and classes: a dedicated span holds just
// the span header and the payload. Mapped memory arrives zeroed, so the
// zero flag needs no work here.
unsafe fn heap_allocate_huge(heap: *mut Heap, size: usize, alignment: usize) -> *mut u8 {
    let span = span_map_huge(size, alignment);
    if span.is_null() {
        return null_mut();
    }
    (*span).page.heap = heap;
    let block = (span as *mut u8).add(SPAN_HEADER_SIZE);
    if alignment > SMALL_GRANULARITY {
        return align_up_ptr(block, alignment);
    }
    block
}

/// Allocate with an alignment stricter than the 16 byte default. The
/// caller validates that `alignment` is a power of two within the
/// supported ceiling.
pub unsafe fn heap_allocate_block_aligned(
    heap: *mut Heap,
    alignment: usize,
    size: usize,
    zero: bool,
) -> *mut u8 {
    debug_assert!(alignment.is_power_of_two() && alignment <= MAX_ALIGNMENT);
    if alignment <= SMALL_GRANULARITY {
        return heap_allocate_block(heap, size, zero);
    }
    if alignment <= MEDIUM_BLOCK_LIMIT && size + alignment <= LARGE_BLOCK_LIMIT {
        // Over-allocate so an aligned pointer fits inside the block, and
        // remember on the page that block origins need recovering.
        let ptr = heap_allocate_block(heap, size + alignment, zero);
        if ptr.is_null() {
            return null_mut();
        }
        let aligned = align_up_ptr(ptr, alignment);
        if aligned != ptr {
            let span = span_of_ptr(aligned);
            let page = page_of_ptr(span, aligned);
            (*page).has_aligned_blocks.store(true, Ordering::Relaxed);
        }
        return aligned;
    }
    heap_allocate_huge(heap, size, alignment)
}

// ------------------------------------------------------
// Reallocation
// ------------------------------------------------------

/// Resize a block, preserving contents unless told otherwise. Returns
/// null without touching the old block when the request cannot be
/// satisfied (or would move with `REALLOC_GROW_OR_FAIL` set).
pub unsafe fn heap_reallocate_block(
    heap: *mut Heap,
    ptr: *mut u8,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    if ptr.is_null() {
        return heap_allocate_block(heap, size, false);
    }

    let span = span_of_ptr(ptr);
    if (*span).page_type == PageType::Huge {
        let start = (span as usize + SPAN_HEADER_SIZE) as *mut u8;
        let capacity = start as usize + (*span).huge_size - ptr as usize;
        // Grow in place within the mapping; keep oversized spans only
        // while more than half stays in use.
        if size <= capacity && size > (*span).huge_size / 2 {
            return ptr;
        }
    } else {
        let page = page_of_ptr(span, ptr);
        let block = page_canonical_block(page, ptr) as *mut u8;
        let block_size = (*page).block_size as usize;
        if block_size >= size {
            // The block still fits. Data moves back to the block origin
            // if an aligned allocation had advanced the pointer.
            if block != ptr && (flags & REALLOC_NO_PRESERVE) == 0 {
                let available = block_size - (ptr as usize - block as usize);
                let keep = if old_size != 0 {
                    old_size.min(available)
                } else {
                    available
                };
                core::ptr::copy(ptr, block, keep.min(size));
            }
            return block;
        }
    }

    if (flags & REALLOC_GROW_OR_FAIL) != 0 {
        return null_mut();
    }
    let new_ptr = heap_allocate_block(heap, size, false);
    if new_ptr.is_null() {
        return null_mut();
    }
    if (flags & REALLOC_NO_PRESERVE) == 0 {
        let old = if old_size != 0 {
            old_size
        } else {
            block_usable_size(ptr)
        };
        core::ptr::copy_nonoverlapping(ptr, new_ptr, old.min(size));
    }
    block_deallocate(ptr);
    new_ptr
}

/// Resize keeping an explicit alignment. In-place only when the existing
/// pointer already satisfies the alignment and the block still fits.
pub unsafe fn heap_reallocate_block_aligned(
    heap: *mut Heap,
    ptr: *mut u8,
    alignment: usize,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    if alignment <= SMALL_GRANULARITY {
        return heap_reallocate_block(heap, ptr, size, old_size, flags);
    }
    if !ptr.is_null() && ptr as usize % alignment == 0 && block_usable_size(ptr) >= size {
        return ptr;
    }
    if !ptr.is_null() && (flags & REALLOC_GROW_OR_FAIL) != 0 {
        return null_mut();
    }
    let new_ptr = heap_allocate_block_aligned(heap, alignment, size, false);
    if new_ptr.is_null() {
        return null_mut();
    }
    if !ptr.is_null() {
        if (flags & REALLOC_NO_PRESERVE) == 0 {
            let old = if old_size != 0 {
                old_size
            } else {
                block_usable_size(ptr)
            };
            core::ptr::copy_nonoverlapping(ptr, new_ptr, old.min(size));
        }
        block_deallocate(ptr);
    }
    new_ptr
}

// ------------------------------------------------------
// Free and usable size
// ------------------------------------------------------

/// Return a block to its page. Huge spans unmap directly regardless of
/// the calling thread; everything else routes by ownership.
pub unsafe fn block_deallocate(ptr: *mut u8) {
    let span = span_of_ptr(ptr);
    if (*span).page_type == PageType::Huge {
        span_unmap(span);
        return;
    }
    let page = page_of_ptr(span, ptr);
    let block = page_canonical_block(page, ptr);
    let heap = (*page).heap;
    if (*heap).owner_thread.load(Ordering::Relaxed) == thread_id() {
        page_free_block_local(heap, page, block);
    } else {
        page_free_block_remote(page, block);
    }
}

/// Bytes usable at `ptr`: the block size minus the in-block offset.
pub unsafe fn block_usable_size(ptr: *const u8) -> usize {
    let span = span_of_ptr(ptr);
    if (*span).page_type == PageType::Huge {
        let start = span as usize + SPAN_HEADER_SIZE;
        return start + (*span).huge_size - ptr as usize;
    }
    let page = page_of_ptr(span, ptr);
    let start = page_block_start(page) as usize;
    let offset = (ptr as usize - start) % (*page).block_size as usize;
    (*page).block_size as usize - offset
}

// ------------------------------------------------------
// Heap teardown
// ------------------------------------------------------

// Push every fast-path block back into its page so page accounting is
// exact again.
unsafe fn heap_flush_fast_lists(heap: *mut Heap) {
    for class_idx in 0..SMALL_CLASS_COUNT {
        let mut block = (*heap).free_blocks[class_idx];
        (*heap).free_blocks[class_idx] = null_mut();
        while !block.is_null() {
            let next = (*block).next;
            let span = span_of_ptr(block as *const u8);
            let page = page_of_ptr(span, block as *const u8);
            page_free_block_local(heap, page, block);
            block = next;
        }
    }
}

/// Quiesce the heap before it is orphaned: fast lists return to their
/// pages and remotely emptied pages are adopted. Cached pages and spans
/// stay with the heap for the next owner.
pub unsafe fn heap_flush(heap: *mut Heap) {
    heap_flush_fast_lists(heap);
    for type_idx in 0..3 {
        heap_drain_deferred(heap, type_idx);
    }
}

/// Release everything the heap still holds. Pages with live blocks (and
/// their spans) are left mapped; using them after this is undefined.
pub unsafe fn heap_release(heap: *mut Heap) {
    heap_flush(heap);

    // Empty pages still sitting in availability lists move to the cache.
    for class_idx in 0..SIZE_CLASS_COUNT {
        let mut page = (*heap).available_pages[class_idx];
        while !page.is_null() {
            let next = (*page).next;
            if (*page).block_used == 0 {
                heap_page_free(heap, page, true);
            }
            page = next;
        }
    }

    // Retire the whole cache; spans unmap as their last page retires.
    for type_idx in 0..3 {
        let mut page = (*heap).free_pages[type_idx];
        (*heap).free_pages[type_idx] = null_mut();
        (*heap).free_page_count[type_idx] = 0;
        while !page.is_null() {
            let next = (*page).next;
            heap_retire_page(heap, page);
            page = next;
        }
    }
}
