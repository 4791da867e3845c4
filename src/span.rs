use core::ptr::null_mut;

use log::debug;

use crate::os::{os_map, os_unmap, MapResult};
use crate::types::{Heap, Page, PageType, Span, PAGE_HEADER_SIZE, SPAN_HEADER_SIZE, SPAN_SIZE};

// ------------------------------------------------------
// Span allocation
//
// Pages are carved out of big naturally aligned OS mappings ("spans",
// 32mb). The natural alignment makes the span header recoverable from
// any interior pointer with a single mask, which is what the free path
// relies on. Each span holds pages of exactly one page type; huge blocks
// get a dedicated span of the exact required size.
// ------------------------------------------------------

unsafe fn span_write_header(span: *mut Span, page_type: PageType, mapping: MapResult) {
    (*span).page = Page::empty();
    (*span).page.page_type = page_type;
    (*span).page.block_offset = SPAN_HEADER_SIZE as u32;
    (*span).page_type = page_type;
    (*span).page_size = page_type.page_size();
    (*span).page_shift = page_type.page_shift();
    (*span).page_count = (SPAN_SIZE / page_type.page_size()) as u32;
    (*span).page_initialized = 0;
    (*span).page_used = 0;
    (*span).mapped_size = mapping.size;
    (*span).map_offset = mapping.offset;
    (*span).huge_size = 0;
    (*span).prev = null_mut();
    (*span).next = null_mut();
}

/// Map a fresh span for the given page type, aligned to the span size.
pub unsafe fn span_map(page_type: PageType) -> *mut Span {
    debug_assert!(page_type != PageType::Huge);
    let mapping = os_map(SPAN_SIZE, SPAN_SIZE);
    if mapping.ptr.is_null() {
        return null_mut();
    }
    debug_assert_eq!(mapping.ptr as usize % SPAN_SIZE, 0);
    let span = mapping.ptr as *mut Span;
    span_write_header(span, page_type, mapping);
    debug!("mapped {:?} span at {:p}", page_type, span);
    span
}

/// Map a dedicated span for one huge block, with optional extra room so
/// the block can be advanced to a requested alignment. Only the span
/// header and the payload live in the mapping; no page carving happens.
pub unsafe fn span_map_huge(size: usize, alignment: usize) -> *mut Span {
    let payload = match SPAN_HEADER_SIZE
        .checked_add(size)
        .and_then(|total| total.checked_add(alignment))
    {
        Some(total) => total,
        None => return null_mut(),
    };
    let mapping = os_map(payload, SPAN_SIZE);
    if mapping.ptr.is_null() {
        return null_mut();
    }
    let span = mapping.ptr as *mut Span;
    span_write_header(span, PageType::Huge, mapping);
    (*span).page_count = 1;
    (*span).page_initialized = 1;
    (*span).page_used = 1;
    (*span).huge_size = (mapping.size - mapping.offset) - SPAN_HEADER_SIZE;
    span
}

/// Carve the next uninitialized page slot out of the span. The first
/// page reuses the span header memory; later pages get their header
/// written at their own base.
pub unsafe fn span_allocate_page(span: *mut Span, heap: *mut Heap) -> *mut Page {
    let index = (*span).page_initialized as usize;
    debug_assert!(index < (*span).page_count as usize);
    let page = if index == 0 {
        &mut (*span).page as *mut Page
    } else {
        let page = (span as usize + index * (*span).page_size) as *mut Page;
        page.write(Page::empty());
        (*page).block_offset = PAGE_HEADER_SIZE as u32;
        page
    };
    (*page).page_type = (*span).page_type;
    (*page).heap = heap;
    (*page).is_zero = true;
    (*span).page_initialized += 1;
    (*span).page_used += 1;
    page
}

/// Return the whole span to the OS.
pub unsafe fn span_unmap(span: *mut Span) {
    debug_assert!((*span).page_type == PageType::Huge || (*span).page_used == 0);
    os_unmap(
        span as *mut u8,
        (*span).mapped_size,
        (*span).map_offset,
        true,
    );
}
