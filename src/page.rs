use core::hint::spin_loop;
use core::ptr::null_mut;
use core::sync::atomic::Ordering;

use crate::heap::{heap_defer_free_page, heap_link_available, heap_page_free, heap_unlink_available};
use crate::internal::align_up;
use crate::os::os_page_size;
use crate::size_class::class_to_size;
use crate::types::{
    thread_free_count, thread_free_head, thread_free_token, Block, Heap, Page, PageType,
    SMALL_CLASS_COUNT, THREAD_FREE_LOCKED,
};

// ------------------------------------------------------
// Block addressing inside a page
// ------------------------------------------------------

#[inline]
pub unsafe fn page_block_start(page: *const Page) -> *mut u8 {
    (page as usize + (*page).block_offset as usize) as *mut u8
}

#[inline]
pub unsafe fn page_block_at(page: *const Page, index: u32) -> *mut Block {
    (page_block_start(page) as usize + index as usize * (*page).block_size as usize) as *mut Block
}

#[inline]
pub unsafe fn page_block_index(page: *const Page, block: *const Block) -> u32 {
    let offset = block as usize - page_block_start(page) as usize;
    (offset / (*page).block_size as usize) as u32
}

// Recover the block origin from a pointer that may have been advanced for
// an alignment request. Pages that never served an aligned request skip
// the division.
#[inline]
pub unsafe fn page_canonical_block(page: *const Page, ptr: *mut u8) -> *mut Block {
    let start = page_block_start(page) as usize;
    if !(*page).has_aligned_blocks.load(Ordering::Relaxed) {
        debug_assert_eq!((ptr as usize - start) % (*page).block_size as usize, 0);
        return ptr as *mut Block;
    }
    let adjust = (ptr as usize - start) % (*page).block_size as usize;
    (ptr as usize - adjust) as *mut Block
}

// ------------------------------------------------------
// Thread-free list
//
// Non-owner threads publish freed blocks through a packed 64-bit token.
// A pusher swaps the token for the lock sentinel, writes the block link,
// then stores the new head and length. The owning thread adopts the whole
// list by swapping the token for zero. Everyone else spins through the
// sentinel with a single pause per attempt.
// ------------------------------------------------------

// Returns the post-push list length and the page's block capacity, both
// observed under the sentinel lock. The owner cannot adopt (and so
// cannot recycle the page) while the sentinel is held, which makes the
// pair consistent for the caller's fully-freed check.
unsafe fn page_push_thread_free(page: *mut Page, block: *mut Block) -> (u32, u32) {
    loop {
        let token = (*page).thread_free.load(Ordering::Relaxed);
        if token == THREAD_FREE_LOCKED {
            spin_loop();
            continue;
        }
        if (*page)
            .thread_free
            .compare_exchange_weak(token, THREAD_FREE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
            continue;
        }
        let count = thread_free_count(token);
        (*block).next = if count == 0 {
            null_mut()
        } else {
            page_block_at(page, thread_free_head(token))
        };
        let length = count + 1;
        let capacity = (*page).block_count;
        debug_assert!(length <= capacity);
        (*page).thread_free.store(
            thread_free_token(page_block_index(page, block), length),
            Ordering::Release,
        );
        return (length, capacity);
    }
}

// Splice the entire thread-free list into the local free list, settling
// the in-use count for the adopted blocks. Returns the number of blocks
// adopted; adoption is all-or-nothing.
pub unsafe fn page_adopt_thread_free(page: *mut Page) -> u32 {
    loop {
        let token = (*page).thread_free.load(Ordering::Relaxed);
        if token == THREAD_FREE_LOCKED {
            spin_loop();
            continue;
        }
        if token == 0 {
            return 0;
        }
        if (*page)
            .thread_free
            .compare_exchange_weak(token, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
            continue;
        }
        let count = thread_free_count(token);
        let head = page_block_at(page, thread_free_head(token));
        let mut tail = head;
        let mut walked = 1;
        while walked < count {
            tail = (*tail).next;
            walked += 1;
        }
        (*tail).next = (*page).local_free;
        (*page).local_free = head;
        (*page).local_free_count += count;
        debug_assert!((*page).block_used >= count);
        (*page).block_used -= count;
        return count;
    }
}

// ------------------------------------------------------
// Page initialization
// ------------------------------------------------------

// Set up a page to serve one size class. The caller links the page into
// the heap's lists and decides the zero flag.
pub unsafe fn page_initialize(page: *mut Page, heap: *mut Heap, class_idx: usize) {
    debug_assert_eq!((*page).thread_free.load(Ordering::Relaxed), 0);
    let block_size = class_to_size(class_idx);
    let page_size = (*page).page_type.page_size();
    (*page).heap = heap;
    (*page).size_class = class_idx as u32;
    (*page).block_size = block_size as u32;
    (*page).block_count = ((page_size - (*page).block_offset as usize) / block_size) as u32;
    (*page).block_initialized = 0;
    (*page).block_used = 0;
    (*page).local_free = null_mut();
    (*page).local_free_count = 0;
    (*page).is_full = false;
    (*page).is_available = false;
    (*page).is_free = false;
    (*page).has_aligned_blocks.store(false, Ordering::Relaxed);
    debug_assert!((*page).block_count > 0);
}

// Carve the next uninitialized blocks from the raw page body. For small
// blocks a whole run up to the next OS page boundary is initialized at
// once to amortize the bookkeeping; the surplus lands on the local free
// list. Returns the first block of the run.
unsafe fn page_extend(page: *mut Page) -> *mut Block {
    let index = (*page).block_initialized as usize;
    debug_assert!(index < (*page).block_count as usize);
    let block_size = (*page).block_size as usize;

    let mut run = 1usize;
    if (*page).page_type == PageType::Small && block_size < os_page_size() / 2 {
        let start = page as usize + (*page).block_offset as usize + index * block_size;
        let boundary = align_up(start + 1, os_page_size());
        run = ((boundary - start) / block_size)
            .max(1)
            .min((*page).block_count as usize - index);
    }
    (*page).block_initialized += run as u32;

    let mut extra = run;
    while extra > 1 {
        extra -= 1;
        let block = page_block_at(page, (index + extra) as u32);
        (*block).next = (*page).local_free;
        (*page).local_free = block;
        (*page).local_free_count += 1;
    }
    page_block_at(page, index as u32)
}

// ------------------------------------------------------
// Block allocation
// ------------------------------------------------------

// A page is marked full only after a final adoption attempt observed an
// empty thread-free list. This keeps remote frees from ever seeing a
// page that is both linked in an owner list and fully freed remotely.
unsafe fn page_set_full(page: *mut Page) {
    debug_assert!((*page).is_available && !(*page).is_full);
    heap_unlink_available((*page).heap, page);
    (*page).is_available = false;
    (*page).is_full = true;
    (*page).is_zero = false;
}

/// Take one block out of the page, zeroing it on request unless its
/// memory is already known zero. Only fails (returning null) if the page
/// is full, which callers exclude by sourcing pages from availability
/// lists.
pub unsafe fn page_allocate_block(page: *mut Page, zero: bool) -> *mut u8 {
    let mut known_zero = false;

    // Owner-private free list first, then adoption of remote frees, then
    // the raw page body.
    let mut block = (*page).local_free;
    if block.is_null() && page_adopt_thread_free(page) > 0 {
        block = (*page).local_free;
    }
    if !block.is_null() {
        (*page).local_free = (*block).next;
        (*page).local_free_count -= 1;
    } else if (*page).block_initialized < (*page).block_count {
        block = page_extend(page);
        known_zero = (*page).is_zero;
    }
    if block.is_null() {
        debug_assert!(false, "block requested from a full page");
        return null_mut();
    }
    (*page).block_used += 1;

    // For small classes, hand the remaining local blocks to the heap's
    // fast-path list in bulk; further allocations of this class will not
    // touch the page at all.
    let class_idx = (*page).size_class as usize;
    if class_idx < SMALL_CLASS_COUNT && !(*page).local_free.is_null() {
        let heap = (*page).heap;
        debug_assert!((*heap).free_blocks[class_idx].is_null());
        (*heap).free_blocks[class_idx] = (*page).local_free;
        (*page).block_used += (*page).local_free_count;
        (*page).local_free = null_mut();
        (*page).local_free_count = 0;
    }

    if (*page).block_used == (*page).block_count
        && (*page).local_free.is_null()
        && page_adopt_thread_free(page) == 0
    {
        page_set_full(page);
    }

    if zero && !known_zero {
        core::ptr::write_bytes(block as *mut u8, 0, (*page).block_size as usize);
    }
    block as *mut u8
}

// ------------------------------------------------------
// Block return
// ------------------------------------------------------

/// Owner-thread return path: private list push, no atomics.
pub unsafe fn page_free_block_local(heap: *mut Heap, page: *mut Page, block: *mut Block) {
    debug_assert!((*page).block_used > 0);
    (*block).next = (*page).local_free;
    (*page).local_free = block;
    (*page).local_free_count += 1;
    (*page).block_used -= 1;

    if (*page).is_full {
        (*page).is_full = false;
        (*page).is_available = true;
        heap_link_available(heap, page);
    }
    if (*page).block_used == 0 {
        heap_page_free(heap, page, true);
    }
}

/// Cross-thread return path. When the push empties the page entirely the
/// page is handed to the owning heap's deferred list for later adoption.
/// Such a page was necessarily full and detached, so until it is
/// deferred no owner list holds it.
pub unsafe fn page_free_block_remote(page: *mut Page, block: *mut Block) {
    let (length, capacity) = page_push_thread_free(page, block);
    if length == capacity {
        heap_defer_free_page((*page).heap, page);
    }
}
