use core::cell::Cell;
use core::hint::spin_loop;
use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use log::debug;

use crate::heap::{heap_flush, heap_release};
use crate::internal::{align_up, thread_id};
use crate::os::{os_init, os_map, os_unmap, MapFn, UnmapFn};
use crate::types::{Heap, HEAPS_PER_MAP, THREAD_UNOWNED};

// ------------------------------------------------------
// Configuration
// ------------------------------------------------------

/// Options recognized by [`init_with`](crate::init_with). The default
/// configuration uses plain OS pages and the built-in mapping primitives.
#[derive(Clone, Copy)]
pub struct AllocConfig {
    /// Attempt huge page mappings, falling back to ordinary pages.
    pub enable_huge_pages: bool,
    /// Override for the OS mapping primitive. Must honor the alignment
    /// contract and return zero-filled memory.
    pub memory_map: Option<MapFn>,
    /// Override for the OS unmap/decommit primitive.
    pub memory_unmap: Option<UnmapFn>,
    /// Called when an OS mapping fails; returning true retries the map.
    pub map_fail_callback: Option<fn(usize) -> bool>,
    /// Percentage of a page's block capacity that must have been carved
    /// before the page body is decommitted when the page becomes free.
    /// Zero disables decommit entirely.
    pub decommit_threshold: u32,
}

impl AllocConfig {
    pub const fn new() -> AllocConfig {
        AllocConfig {
            enable_huge_pages: false,
            memory_map: None,
            memory_unmap: None,
            map_fail_callback: None,
            decommit_threshold: 50,
        }
    }
}

impl Default for AllocConfig {
    fn default() -> AllocConfig {
        AllocConfig::new()
    }
}

static mut CONFIG: AllocConfig = AllocConfig::new();

#[inline]
pub(crate) fn config() -> &'static AllocConfig {
    // Written once during init, read-only afterwards.
    unsafe { &*core::ptr::addr_of!(CONFIG) }
}

// ------------------------------------------------------
// Global allocator state
// ------------------------------------------------------

const STATE_UNINITIALIZED: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;

static INIT_STATE: AtomicU32 = AtomicU32::new(STATE_UNINITIALIZED);

// Heap handed to the first thread that needs one.
static DEFAULT_HEAP: AtomicPtr<Heap> = AtomicPtr::new(null_mut());

// Queue of heaps whose owning thread exited, guarded by a spin lock
// whose token is the locking thread's id.
static ORPHAN_LOCK: AtomicUsize = AtomicUsize::new(0);
static ORPHAN_HEAD: AtomicPtr<Heap> = AtomicPtr::new(null_mut());

static HEAP_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

// Heap structures come out of dedicated OS mappings, tracked so finalize
// can hand them back.
struct HeapBatch {
    next: *mut HeapBatch,
    mapped_size: usize,
    map_offset: usize,
}

static BATCH_HEAD: AtomicPtr<HeapBatch> = AtomicPtr::new(null_mut());

fn orphan_lock() {
    let token = thread_id();
    while ORPHAN_LOCK
        .compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        spin_loop();
    }
}

fn orphan_unlock() {
    ORPHAN_LOCK.store(0, Ordering::Release);
}

// ------------------------------------------------------
// Heap acquisition
// ------------------------------------------------------

// Map one batch of heap structures. The first is returned to the caller,
// the surplus seeds the orphan queue.
unsafe fn heap_map_batch() -> *mut Heap {
    let header = align_up(size_of::<HeapBatch>(), 64);
    let result = os_map(header + HEAPS_PER_MAP * size_of::<Heap>(), 0);
    if result.ptr.is_null() {
        return null_mut();
    }
    let batch = result.ptr as *mut HeapBatch;
    (*batch).mapped_size = result.size;
    (*batch).map_offset = result.offset;
    loop {
        let head = BATCH_HEAD.load(Ordering::Relaxed);
        (*batch).next = head;
        if BATCH_HEAD
            .compare_exchange_weak(head, batch, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }

    let heaps = result.ptr.add(header) as *mut Heap;
    let first = heaps;
    (*first).init(HEAP_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1);
    orphan_lock();
    for index in 1..HEAPS_PER_MAP {
        let heap = heaps.add(index);
        (*heap).init(HEAP_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1);
        (*heap).next_orphan = ORPHAN_HEAD.load(Ordering::Relaxed);
        ORPHAN_HEAD.store(heap, Ordering::Relaxed);
    }
    orphan_unlock();
    debug!("mapped a batch of {} heaps", HEAPS_PER_MAP);
    first
}

// Prefer the default heap, then the orphan queue, then a fresh batch.
unsafe fn heap_acquire() -> *mut Heap {
    let default_heap = DEFAULT_HEAP.swap(null_mut(), Ordering::AcqRel);
    if !default_heap.is_null() {
        return default_heap;
    }
    orphan_lock();
    let heap = ORPHAN_HEAD.load(Ordering::Relaxed);
    if !heap.is_null() {
        ORPHAN_HEAD.store((*heap).next_orphan, Ordering::Relaxed);
        (*heap).next_orphan = null_mut();
    }
    orphan_unlock();
    if !heap.is_null() {
        return heap;
    }
    heap_map_batch()
}

unsafe fn heap_orphan(heap: *mut Heap) {
    (*heap).owner_thread.store(THREAD_UNOWNED, Ordering::Release);
    orphan_lock();
    (*heap).next_orphan = ORPHAN_HEAD.load(Ordering::Relaxed);
    ORPHAN_HEAD.store(heap, Ordering::Relaxed);
    orphan_unlock();
}

// ------------------------------------------------------
// Process lifecycle
// ------------------------------------------------------

/// Initialize the allocator with default options. Idempotent after the
/// first success; returns false only if the initial OS mapping failed.
pub fn init() -> bool {
    init_with(AllocConfig::new())
}

/// Initialize the allocator with explicit options. Options are ignored
/// if another caller already completed initialization.
pub fn init_with(options: AllocConfig) -> bool {
    loop {
        match INIT_STATE.compare_exchange(
            STATE_UNINITIALIZED,
            STATE_INITIALIZING,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(STATE_READY) => return true,
            Err(_) => spin_loop(),
        }
    }
    unsafe { core::ptr::addr_of_mut!(CONFIG).write(options) };
    os_init(options.enable_huge_pages);
    let heap = unsafe { heap_map_batch() };
    if heap.is_null() {
        INIT_STATE.store(STATE_UNINITIALIZED, Ordering::Release);
        return false;
    }
    DEFAULT_HEAP.store(heap, Ordering::Release);
    INIT_STATE.store(STATE_READY, Ordering::Release);
    debug!("process init: thread 0x{:x}", thread_id());
    true
}

#[inline]
pub(crate) fn ensure_init() -> bool {
    INIT_STATE.load(Ordering::Acquire) == STATE_READY || init()
}

/// Release everything the allocator still owns globally: orphaned heaps,
/// their cached pages and spans, and the heap structures themselves.
/// Using any pointer obtained earlier is undefined after this returns.
pub fn finalize() {
    if INIT_STATE.load(Ordering::Acquire) != STATE_READY {
        return;
    }
    thread_finalize();
    unsafe {
        let default_heap = DEFAULT_HEAP.swap(null_mut(), Ordering::AcqRel);
        if !default_heap.is_null() {
            heap_release(default_heap);
        }
        orphan_lock();
        let mut heap = ORPHAN_HEAD.load(Ordering::Relaxed);
        ORPHAN_HEAD.store(null_mut(), Ordering::Relaxed);
        orphan_unlock();
        while !heap.is_null() {
            let next = (*heap).next_orphan;
            heap_release(heap);
            heap = next;
        }
        let mut batch = BATCH_HEAD.swap(null_mut(), Ordering::Acquire);
        while !batch.is_null() {
            let next = (*batch).next;
            os_unmap(batch as *mut u8, (*batch).mapped_size, (*batch).map_offset, true);
            batch = next;
        }
    }
    INIT_STATE.store(STATE_UNINITIALIZED, Ordering::Release);
    debug!("process done");
}

// ------------------------------------------------------
// Thread lifecycle
// ------------------------------------------------------

std::thread_local! {
    static THREAD_HEAP: Cell<*mut Heap> = const { Cell::new(null_mut()) };
    // Registered on first use; its drop orphans the thread's heap when
    // the thread exits without an explicit finalize.
    static THREAD_GUARD: ThreadGuard = const { ThreadGuard };
}

struct ThreadGuard;

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        thread_finalize();
    }
}

/// Attach a heap to the current thread, reusing an orphaned one when
/// available. Called implicitly by the allocation entry points.
pub fn thread_init() -> bool {
    if !ensure_init() {
        return false;
    }
    if is_thread_initialized() {
        return true;
    }
    unsafe { with_heap(|_| ()).is_some() && is_thread_initialized() }
}

/// Detach and orphan the current thread's heap. Allocation from this
/// thread afterwards acquires a fresh heap.
pub fn thread_finalize() {
    let heap = THREAD_HEAP.with(|cell| cell.replace(null_mut()));
    if heap.is_null() {
        return;
    }
    unsafe {
        heap_flush(heap);
        heap_orphan(heap);
    }
    debug!("thread done: 0x{:x}", thread_id());
}

/// Whether the current thread holds a heap.
pub fn is_thread_initialized() -> bool {
    THREAD_HEAP.with(|cell| !cell.get().is_null())
}

// Run an operation against the current thread's heap, attaching one on
// first use. During thread teardown, when the guard can no longer be
// registered, an orphan heap is borrowed for the single operation.
#[inline]
pub(crate) unsafe fn with_heap<R>(operation: impl FnOnce(*mut Heap) -> R) -> Option<R> {
    if !ensure_init() {
        return None;
    }
    let current = THREAD_HEAP.with(|cell| cell.get());
    if !current.is_null() {
        return Some(operation(current));
    }

    let heap = heap_acquire();
    if heap.is_null() {
        return None;
    }
    (*heap).owner_thread.store(thread_id(), Ordering::Release);
    THREAD_HEAP.with(|cell| cell.set(heap));
    if THREAD_GUARD.try_with(|_| ()).is_ok() {
        debug!("thread init: 0x{:x} on heap {}", thread_id(), (*heap).id);
        return Some(operation(heap));
    }

    let result = operation(heap);
    THREAD_HEAP.with(|cell| cell.set(null_mut()));
    heap_flush(heap);
    heap_orphan(heap);
    Some(result)
}
