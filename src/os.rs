use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};

use crate::init::config;
use crate::internal::{align_up, align_up_ptr};
use crate::stats::{MAPPED_BYTES, MAPPED_RANGES};

// ------------------------------------------------------
// OS memory mapping layer
//
// One primitive to reserve memory, one to release or decommit it. When
// the caller needs alignment stricter than the kernel granularity we
// over-allocate by the alignment and report the consumed padding in
// `offset` so the eventual release can reconstruct the original base.
// ------------------------------------------------------

/// Result of a mapping request. `ptr` is null on failure. `size` is the
/// actual mapped length including padding; `offset` the padding consumed
/// in front of `ptr`.
#[derive(Clone, Copy)]
pub struct MapResult {
    pub ptr: *mut u8,
    pub offset: usize,
    pub size: usize,
}

impl MapResult {
    pub fn failed() -> MapResult {
        MapResult {
            ptr: null_mut(),
            offset: 0,
            size: 0,
        }
    }
}

/// Caller-provided mapping override. Must return memory readable and
/// writable, zero-filled, and aligned to `alignment` when non-zero.
pub type MapFn = unsafe fn(size: usize, alignment: usize) -> MapResult;

/// Caller-provided unmap override, matching the contract of [`os_unmap`].
pub type UnmapFn = unsafe fn(ptr: *mut u8, size: usize, offset: usize, release: bool);

// Page size (refined in `os_init`).
static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);

// Minimal allocation granularity of the kernel.
static OS_GRANULARITY: AtomicUsize = AtomicUsize::new(4096);

// Non-zero if huge page mappings are attempted, holding the huge page size.
static OS_HUGE_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[inline]
pub fn os_page_size() -> usize {
    OS_PAGE_SIZE.load(Ordering::Relaxed)
}

#[inline]
pub fn os_granularity() -> usize {
    OS_GRANULARITY.load(Ordering::Relaxed)
}

#[inline]
pub fn os_huge_page_size() -> usize {
    OS_HUGE_PAGE_SIZE.load(Ordering::Relaxed)
}

// Huge pages only help mappings that are multiples of the huge page size
// in both length and alignment.
#[cfg_attr(all(unix, not(target_os = "linux")), allow(dead_code))]
fn use_huge_pages(size: usize, alignment: usize) -> bool {
    let huge = os_huge_page_size();
    huge != 0 && size % huge == 0 && (alignment == 0 || alignment % huge == 0)
}

// ------------------------------------------------------
// Initialization
// ------------------------------------------------------

#[cfg(unix)]
pub fn os_init(enable_huge_pages: bool) {
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if result > 0 {
        let kernel_page = result as usize;
        OS_PAGE_SIZE.store(kernel_page.max(512), Ordering::Relaxed);
        OS_GRANULARITY.store(kernel_page, Ordering::Relaxed);
    }
    if enable_huge_pages {
        // Transparent availability is probed by simply attempting the
        // mapping later; 2mb is the universal default size.
        #[cfg(target_os = "linux")]
        OS_HUGE_PAGE_SIZE.store(1 << 21, Ordering::Relaxed);
    }
    debug!(
        "os init: page size {}, granularity {}, huge page size {}",
        os_page_size(),
        os_granularity(),
        os_huge_page_size()
    );
}

#[cfg(windows)]
pub fn os_init(enable_huge_pages: bool) {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};

    let mut si: SYSTEM_INFO = Default::default();
    unsafe { GetSystemInfo(&mut si) };
    if si.dwPageSize > 0 {
        OS_PAGE_SIZE.store((si.dwPageSize as usize).max(512), Ordering::Relaxed);
    }
    if si.dwAllocationGranularity > 0 {
        OS_GRANULARITY.store(si.dwAllocationGranularity as usize, Ordering::Relaxed);
    }
    if enable_huge_pages {
        let large = unsafe { win_enable_large_pages() };
        OS_HUGE_PAGE_SIZE.store(large, Ordering::Relaxed);
    }
    debug!(
        "os init: page size {}, granularity {}, huge page size {}",
        os_page_size(),
        os_granularity(),
        os_huge_page_size()
    );
}

// To use large pages on Windows the process first needs the "Lock pages
// in memory" privilege, set in the group policy editor.
#[cfg(windows)]
unsafe fn win_enable_large_pages() -> usize {
    use winapi::shared::minwindef::FALSE;
    use winapi::shared::winerror::ERROR_SUCCESS;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::memoryapi::GetLargePageMinimum;
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::AdjustTokenPrivileges;
    use winapi::um::winbase::LookupPrivilegeValueA;
    use winapi::um::winnt::{
        HANDLE, SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
    };

    let mut token: HANDLE = null_mut();
    if OpenProcessToken(
        GetCurrentProcess(),
        TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
        &mut token,
    ) == 0
    {
        warn!("cannot enable large OS pages, error {}", GetLastError());
        return 0;
    }
    let mut tp: TOKEN_PRIVILEGES = core::mem::zeroed();
    let mut ok = LookupPrivilegeValueA(
        null_mut(),
        b"SeLockMemoryPrivilege\0".as_ptr() as *const i8,
        &mut tp.Privileges[0].Luid,
    ) != 0;
    if ok {
        tp.PrivilegeCount = 1;
        tp.Privileges[0].Attributes = SE_PRIVILEGE_ENABLED;
        ok = AdjustTokenPrivileges(token, FALSE, &mut tp, 0, null_mut(), null_mut()) != 0
            && GetLastError() == ERROR_SUCCESS;
    }
    CloseHandle(token);
    if ok {
        GetLargePageMinimum()
    } else {
        warn!("cannot enable large OS pages, error {}", GetLastError());
        0
    }
}

// ------------------------------------------------------
// Mapping
// ------------------------------------------------------

/// Reserve at least `size` bytes, aligned to `alignment` when non-zero.
/// On failure the configured map-fail callback may request a retry;
/// otherwise the failed result is returned and the caller reports OOM.
pub fn os_map(size: usize, alignment: usize) -> MapResult {
    debug_assert!(alignment == 0 || alignment.is_power_of_two());
    let size = align_up(size, os_granularity());
    loop {
        let result = unsafe {
            match config().memory_map {
                Some(map) => map(size, alignment),
                None => os_map_raw(size, alignment),
            }
        };
        if !result.ptr.is_null() {
            debug_assert!(alignment == 0 || result.ptr as usize % alignment == 0);
            MAPPED_BYTES.increase(result.size as i64);
            MAPPED_RANGES.increase(1);
            return result;
        }
        if let Some(callback) = config().map_fail_callback {
            if callback(size) {
                continue;
            }
        }
        warn!("memory map failed: {} bytes requested", size);
        return MapResult::failed();
    }
}

/// Release a mapping obtained from [`os_map`], or decommit a sub-range.
///
/// With `release` set, `ptr`/`offset`/`size` must be exactly the values
/// returned by the original map call and the whole range is returned to
/// the OS. Otherwise the call is a best-effort decommit of `size` bytes
/// at `ptr`: the range stays reserved but its physical pages may be
/// reclaimed.
pub unsafe fn os_unmap(ptr: *mut u8, size: usize, offset: usize, release: bool) {
    if ptr.is_null() || size == 0 {
        return;
    }
    if let Some(unmap) = config().memory_unmap {
        unmap(ptr, size, offset, release);
        if release {
            MAPPED_BYTES.decrease(size as i64);
            MAPPED_RANGES.decrease(1);
        }
        return;
    }
    if release {
        os_unmap_raw(ptr, size, offset);
        MAPPED_BYTES.decrease(size as i64);
        MAPPED_RANGES.decrease(1);
    } else {
        os_decommit_raw(ptr, size);
    }
}

#[cfg(unix)]
unsafe fn os_map_raw(size: usize, alignment: usize) -> MapResult {
    use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

    let map_size = match size.checked_add(alignment) {
        Some(total) => total,
        None => return MapResult::failed(),
    };

    // Try a huge page mapping first; failure here is never fatal.
    #[cfg(target_os = "linux")]
    if use_huge_pages(size, alignment) {
        let ptr = libc::mmap(
            null_mut(),
            map_size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | libc::MAP_HUGETLB,
            -1,
            0,
        );
        if ptr != MAP_FAILED {
            // Partial unmap of a huge page mapping needs huge page
            // granularity, so keep the padding and record the offset.
            let base = ptr as *mut u8;
            let aligned = if alignment > 0 {
                align_up_ptr(base, alignment)
            } else {
                base
            };
            return MapResult {
                ptr: aligned,
                offset: aligned as usize - base as usize,
                size: map_size,
            };
        }
    }

    let ptr = libc::mmap(
        null_mut(),
        map_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == MAP_FAILED {
        return MapResult::failed();
    }
    let base = ptr as *mut u8;
    if alignment == 0 {
        return MapResult {
            ptr: base,
            offset: 0,
            size: map_size,
        };
    }

    // Trim the alignment padding so only the aligned range stays mapped.
    let aligned = align_up_ptr(base, alignment);
    let lead = aligned as usize - base as usize;
    let tail = map_size - lead - size;
    if lead > 0 && libc::munmap(base as *mut libc::c_void, lead) != 0 {
        warn!("munmap failed: {}, addr {:p}, size {}", errno::errno(), base, lead);
    }
    if tail > 0
        && libc::munmap((aligned as usize + size) as *mut libc::c_void, tail) != 0
    {
        warn!(
            "munmap failed: {}, addr 0x{:x}, size {}",
            errno::errno(),
            aligned as usize + size,
            tail
        );
    }
    MapResult {
        ptr: aligned,
        offset: 0,
        size,
    }
}

#[cfg(unix)]
unsafe fn os_unmap_raw(ptr: *mut u8, size: usize, offset: usize) {
    let base = (ptr as usize - offset) as *mut libc::c_void;
    if libc::munmap(base, size) != 0 {
        warn!(
            "munmap failed: {}, addr {:p}, size {}",
            errno::errno(),
            base,
            size
        );
        debug_assert!(false, "munmap failed");
    }
}

#[cfg(unix)]
unsafe fn os_decommit_raw(ptr: *mut u8, size: usize) {
    // Huge page mappings cannot be decommitted piecemeal.
    if os_huge_page_size() != 0 {
        return;
    }
    if libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED) != 0 {
        warn!(
            "madvise failed: {}, addr {:p}, size {}",
            errno::errno(),
            ptr,
            size
        );
    }
}

#[cfg(windows)]
unsafe fn os_map_raw(size: usize, alignment: usize) -> MapResult {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_LARGE_PAGES, MEM_RESERVE, PAGE_READWRITE};

    let map_size = match size.checked_add(alignment) {
        Some(total) => total,
        None => return MapResult::failed(),
    };

    let mut ptr: *mut u8 = null_mut();
    if use_huge_pages(size, alignment) {
        ptr = VirtualAlloc(
            null_mut(),
            map_size,
            MEM_RESERVE | MEM_COMMIT | MEM_LARGE_PAGES,
            PAGE_READWRITE,
        ) as *mut u8;
        // Fall through to a normal mapping on failure.
    }
    if ptr.is_null() {
        ptr = VirtualAlloc(null_mut(), map_size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
            as *mut u8;
    }
    if ptr.is_null() {
        return MapResult::failed();
    }
    // The padding cannot be released separately on Windows, so keep it
    // and record the offset for the eventual release.
    let aligned = if alignment > 0 {
        align_up_ptr(ptr, alignment)
    } else {
        ptr
    };
    MapResult {
        ptr: aligned,
        offset: aligned as usize - ptr as usize,
        size: map_size,
    }
}

#[cfg(windows)]
unsafe fn os_unmap_raw(ptr: *mut u8, size: usize, offset: usize) {
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;

    let base = (ptr as usize - offset) as *mut winapi::ctypes::c_void;
    let _ = size;
    if VirtualFree(base, 0, MEM_RELEASE) == 0 {
        warn!(
            "VirtualFree failed: error {}, addr {:p}",
            GetLastError(),
            base
        );
        debug_assert!(false, "VirtualFree failed");
    }
}

#[cfg(windows)]
unsafe fn os_decommit_raw(ptr: *mut u8, size: usize) {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_RESET, PAGE_READWRITE};

    if os_huge_page_size() != 0 {
        return;
    }
    // MEM_RESET keeps the range accessible while letting the OS drop the
    // backing pages under pressure.
    let reset = VirtualAlloc(ptr as *mut _, size, MEM_RESET, PAGE_READWRITE);
    if reset.is_null() {
        warn!("MEM_RESET failed, addr {:p}, size {}", ptr, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SPAN_SIZE;

    #[test]
    fn map_unmap_round_trip() {
        let result = os_map(os_granularity(), 0);
        assert!(!result.ptr.is_null());
        unsafe {
            // Mapped memory is writable and zero-filled.
            assert_eq!(*result.ptr, 0);
            result.ptr.write_bytes(0xa5, 64);
            os_unmap(result.ptr, result.size, result.offset, true);
        }
    }

    #[test]
    fn map_honors_span_alignment() {
        let result = os_map(SPAN_SIZE, SPAN_SIZE);
        assert!(!result.ptr.is_null());
        assert_eq!(result.ptr as usize % SPAN_SIZE, 0);
        unsafe { os_unmap(result.ptr, result.size, result.offset, true) };
    }

    #[test]
    fn decommit_keeps_range_usable() {
        let page = os_page_size();
        let result = os_map(4 * page, 0);
        assert!(!result.ptr.is_null());
        unsafe {
            result.ptr.write_bytes(0x5a, 4 * page);
            os_unmap(result.ptr.add(page), page, 0, false);
            // The decommitted range stays addressable.
            result.ptr.add(page).write_bytes(1, page);
            assert_eq!(*result.ptr.add(page), 1);
            os_unmap(result.ptr, result.size, result.offset, true);
        }
    }
}
