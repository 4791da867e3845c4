use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize};

// ------------------------------------------------------
// Main tuning parameters for span and page sizes
// ------------------------------------------------------

// Minimum alignment and rounding unit of every returned pointer.
// 16 bytes are needed on most platforms due to SSE registers.
pub const SMALL_GRANULARITY: usize = 16;
pub const SMALL_GRANULARITY_SHIFT: usize = 4;

// Spans are naturally aligned so a span header is recoverable from any
// interior pointer with a single mask.
pub const SPAN_SHIFT: usize = 25; // 32mb
pub const SPAN_SIZE: usize = 1 << SPAN_SHIFT;
pub const SPAN_MASK: usize = !(SPAN_SIZE - 1);

pub const SMALL_PAGE_SHIFT: usize = 16; // 64kb
pub const MEDIUM_PAGE_SHIFT: usize = 21; // 2mb
pub const LARGE_PAGE_SHIFT: usize = SPAN_SHIFT; // one page spanning the span

pub const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SHIFT;
pub const MEDIUM_PAGE_SIZE: usize = 1 << MEDIUM_PAGE_SHIFT;
pub const LARGE_PAGE_SIZE: usize = 1 << LARGE_PAGE_SHIFT;

// Small classes are spaced linearly on the granularity, the rest are
// spaced logarithmically with four sub-classes per power of two.
pub const SMALL_CLASS_COUNT: usize = 64;
pub const MEDIUM_CLASS_COUNT: usize = 28;
pub const LARGE_CLASS_COUNT: usize = 16;
pub const SIZE_CLASS_COUNT: usize = SMALL_CLASS_COUNT + MEDIUM_CLASS_COUNT + LARGE_CLASS_COUNT;

pub const SMALL_BLOCK_LIMIT: usize = SMALL_GRANULARITY * SMALL_CLASS_COUNT; // 1024
pub const MEDIUM_BLOCK_LIMIT: usize = 128 * 1024;
pub const LARGE_BLOCK_LIMIT: usize = 2 * 1024 * 1024;

// Block storage starts at this offset inside a page. The first page of a
// span stores the span header instead, so its blocks start later.
pub const PAGE_HEADER_SIZE: usize = 128;
pub const SPAN_HEADER_SIZE: usize = 256;

// Alignment requests above this return EINVAL.
pub const MAX_ALIGNMENT: usize = SPAN_SIZE / 2;

// Heap structures are carved in batches from one OS mapping.
pub const HEAPS_PER_MAP: usize = 16;

// Free pages cached per heap and page type before eviction to the span.
pub const FREE_PAGE_CACHE_LIMIT: [usize; 3] = [64, 16, 4];

// Sentinel owner for a heap without a thread.
pub const THREAD_UNOWNED: usize = 0;

// ------------------------------------------------------
// Page types
// ------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PageType {
    Small = 0,  // small blocks go into 64kb pages
    Medium = 1, // medium blocks go into 2mb pages
    Large = 2,  // large blocks get a single page spanning the whole span
    Huge = 3,   // huge blocks get a dedicated span of the exact size
}

impl PageType {
    #[inline]
    pub fn page_size(self) -> usize {
        match self {
            PageType::Small => SMALL_PAGE_SIZE,
            PageType::Medium => MEDIUM_PAGE_SIZE,
            PageType::Large | PageType::Huge => LARGE_PAGE_SIZE,
        }
    }

    #[inline]
    pub fn page_shift(self) -> u32 {
        match self {
            PageType::Small => SMALL_PAGE_SHIFT as u32,
            PageType::Medium => MEDIUM_PAGE_SHIFT as u32,
            PageType::Large | PageType::Huge => LARGE_PAGE_SHIFT as u32,
        }
    }

    // Index into the per-page-type heap caches. Huge pages are never cached.
    #[inline]
    pub fn cache_index(self) -> usize {
        debug_assert!(self != PageType::Huge);
        self as usize
    }
}

// ------------------------------------------------------
// Main internal data structures
// ------------------------------------------------------

// A free block stores the next free-list entry in its first word.
#[repr(C)]
pub struct Block {
    pub next: *mut Block,
}

// Token packing for the page's thread-free list: upper 32 bits hold the
// block index of the list head, lower 32 bits the list length. All ones
// is the lock sentinel held briefly by a pusher mid-splice.
pub const THREAD_FREE_LOCKED: u64 = u64::MAX;

#[inline]
pub fn thread_free_token(head_index: u32, count: u32) -> u64 {
    ((head_index as u64) << 32) | count as u64
}

#[inline]
pub fn thread_free_head(token: u64) -> u32 {
    (token >> 32) as u32
}

#[inline]
pub fn thread_free_count(token: u64) -> u32 {
    token as u32
}

// A page header lives at the start of the page itself, so the page of any
// block is recoverable with span masking plus page-size arithmetic.
#[repr(C)]
pub struct Page {
    pub heap: *mut Heap, // owning heap (back-reference, not ownership)
    pub prev: *mut Page, // linkage in one heap list at a time
    pub next: *mut Page,
    pub next_deferred: *mut Page, // linkage in the heap's deferred free-page stack
    pub local_free: *mut Block,   // owner-thread-private free list
    pub thread_free: AtomicU64,   // deferred frees from other threads
    pub local_free_count: u32,
    pub size_class: u32,
    pub block_size: u32,
    pub block_count: u32,       // capacity of the page for this class
    pub block_initialized: u32, // blocks carved from the raw page body so far
    pub block_used: u32,        // blocks handed out (including heap fast-list blocks)
    pub block_offset: u32,      // offset from the page base to the first block
    pub page_type: PageType,
    pub is_full: bool,
    pub is_available: bool, // linked in the heap's available list for its class
    pub is_free: bool,
    pub is_zero: bool, // raw body past block_initialized is known zero
    // Some block was returned at an interior offset. Atomic because the
    // owner sets it while non-owner frees read it to canonicalize.
    pub has_aligned_blocks: AtomicBool,
}

impl Page {
    pub const fn empty() -> Page {
        Page {
            heap: null_mut(),
            prev: null_mut(),
            next: null_mut(),
            next_deferred: null_mut(),
            local_free: null_mut(),
            thread_free: AtomicU64::new(0),
            local_free_count: 0,
            size_class: 0,
            block_size: 0,
            block_count: 0,
            block_initialized: 0,
            block_used: 0,
            block_offset: 0,
            page_type: PageType::Small,
            is_full: false,
            is_available: false,
            is_free: false,
            is_zero: false,
            has_aligned_blocks: AtomicBool::new(false),
        }
    }
}

// A span is one naturally aligned OS mapping subdivided into pages of a
// single page type. The first page header is embedded so the span's own
// metadata rides inside its first page.
#[repr(C)]
pub struct Span {
    pub page: Page, // header of the first page; must stay the first field
    pub page_type: PageType,
    pub page_size: usize,
    pub page_shift: u32,
    pub page_count: u32,
    pub page_initialized: u32, // pages carved from the span so far
    pub page_used: u32,        // carved pages not yet retired back to the span
    pub mapped_size: usize,    // OS-level mapping length
    pub map_offset: usize,     // alignment padding before the span base
    pub huge_size: usize,      // usable payload for huge spans, zero otherwise
    pub prev: *mut Span,       // linkage in one heap span list
    pub next: *mut Span,
}

// The span and page headers ride inside the first bytes of their memory.
const _: () = assert!(size_of::<Page>() <= PAGE_HEADER_SIZE);
const _: () = assert!(size_of::<Span>() <= SPAN_HEADER_SIZE);

// A heap owns a set of pages and spans, and belongs to at most one thread.
#[repr(C)]
pub struct Heap {
    pub id: u32,
    pub owner_thread: AtomicUsize, // THREAD_UNOWNED while orphaned
    // Fast path: single-block free lists per small class, filled by bulk
    // transfer from a page.
    pub free_blocks: [*mut Block; SMALL_CLASS_COUNT],
    // Partially free pages per size class.
    pub available_pages: [*mut Page; SIZE_CLASS_COUNT],
    // Fully free pages cached per page type.
    pub free_pages: [*mut Page; 3],
    pub free_page_count: [u32; 3],
    // Pages emptied entirely by other threads, awaiting adoption.
    pub deferred_pages: [AtomicPtr<Page>; 3],
    // Spans with uninitialized page slots, and fully carved spans.
    pub partial_spans: [*mut Span; 3],
    pub full_spans: [*mut Span; 3],
    pub next_orphan: *mut Heap,
}

impl Heap {
    pub fn init(&mut self, id: u32) {
        self.id = id;
        self.owner_thread = AtomicUsize::new(THREAD_UNOWNED);
        self.free_blocks = [null_mut(); SMALL_CLASS_COUNT];
        self.available_pages = [null_mut(); SIZE_CLASS_COUNT];
        self.free_pages = [null_mut(); 3];
        self.free_page_count = [0; 3];
        self.deferred_pages = [
            AtomicPtr::new(null_mut()),
            AtomicPtr::new(null_mut()),
            AtomicPtr::new(null_mut()),
        ];
        self.partial_spans = [null_mut(); 3];
        self.full_spans = [null_mut(); 3];
        self.next_orphan = null_mut();
    }
}
