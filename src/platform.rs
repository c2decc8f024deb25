//! OS memory interface.
//!
//! Spans come from anonymous, zero-initialized mappings. Requests too
//! large for the size classes bypass the tiers and use the platform
//! `malloc`/`free` directly.

use crate::PAGE_SIZE;
use core::ptr;

/// Map `num_pages` fresh pages from the OS.
///
/// The mapping is private, anonymous and zero-initialized. Returns null
/// if the OS refuses. Mappings are never unmapped; the page cache
/// retains returned spans for reuse and the OS reclaims everything at
/// process exit.
#[cfg(unix)]
pub fn map_pages(num_pages: usize) -> *mut u8 {
    let bytes = num_pages * PAGE_SIZE;
    // SAFETY: anonymous mapping, no fd, no fixed address.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return ptr::null_mut();
    }
    addr as *mut u8
}

/// Map `num_pages` fresh pages from the OS via an anonymous file
/// mapping, the pagefile-backed equivalent of the POSIX path.
#[cfg(windows)]
pub fn map_pages(num_pages: usize) -> *mut u8 {
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFile, FILE_MAP_ALL_ACCESS, PAGE_READWRITE,
    };

    let bytes = num_pages * PAGE_SIZE;
    // SAFETY: anonymous pagefile-backed mapping; the view outlives the
    // handle, which we close immediately.
    unsafe {
        let mapping = CreateFileMappingW(
            INVALID_HANDLE_VALUE,
            ptr::null(),
            PAGE_READWRITE,
            (bytes as u64 >> 32) as u32,
            bytes as u32,
            ptr::null(),
        );
        if mapping == 0 {
            return ptr::null_mut();
        }
        let view = MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, bytes);
        CloseHandle(mapping);
        view.Value as *mut u8
    }
}

/// Direct platform allocation for requests above the class limit.
pub fn large_alloc(bytes: usize) -> *mut u8 {
    // SAFETY: plain malloc; null on failure is our failure mode too.
    unsafe { libc::malloc(bytes) as *mut u8 }
}

/// Release a block obtained from [`large_alloc`].
///
/// # Safety
///
/// `ptr` must have come from [`large_alloc`] and not been freed since.
pub unsafe fn large_free(ptr: *mut u8) {
    unsafe { libc::free(ptr as *mut libc::c_void) };
}
