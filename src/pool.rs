//! Process-wide pool state and the public facade.
//!
//! The central cache and page cache are process-wide statics, lazily
//! touched on first use. Each thread reaches its own front end through
//! thread-local storage; when a thread exits, its residual cached
//! blocks are flushed back to the central cache. If TLS is already
//! gone (allocation during thread teardown), calls fall through to the
//! central cache directly.

use crate::central_cache::CentralCache;
use crate::page_cache::PageCache;
use crate::platform;
use crate::size_class::{self, ALIGNMENT, MAX_BYTES};
use crate::span::FreeObject;
use crate::sync::SpinMutex;
use crate::thread_cache::ThreadCache;
use core::cell::UnsafeCell;
use core::mem::{align_of, size_of};
use core::ptr;

static PAGE_CACHE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new());
static CENTRAL_CACHE: CentralCache = CentralCache::new();

/// Thread-local front end. Dropping it (thread exit) returns every
/// cached block to the central cache.
struct LocalCache(UnsafeCell<ThreadCache>);

impl Drop for LocalCache {
    fn drop(&mut self) {
        // SAFETY: drop runs once, on the owning thread.
        unsafe { (*self.0.get()).flush(&CENTRAL_CACHE, &PAGE_CACHE) };
    }
}

thread_local! {
    static THREAD_CACHE: LocalCache = const { LocalCache(UnsafeCell::new(ThreadCache::new())) };
}

/// Run `f` against this thread's cache. `None` means TLS is being torn
/// down; callers then go straight to the central cache.
#[inline]
fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    THREAD_CACHE
        .try_with(|cell| {
            // SAFETY: only the owning thread reaches this cell, and the
            // pool never re-enters it from inside `f`.
            unsafe { f(&mut *cell.0.get()) }
        })
        .ok()
}

/// Snapshot of pool-wide counters, taken under the page cache lock.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Pages ever mapped from the OS.
    pub pages_mapped: usize,
    /// Census of spans waiting in the page cache: `(page_count, spans)`.
    pub free_spans: Vec<(usize, usize)>,
    /// Span tracker slots installed so far.
    pub spans_tracked: usize,
}

/// The allocator facade. All associated functions are thread-safe; no
/// external locking is required.
pub struct MemoryPool;

impl MemoryPool {
    /// Allocate `size` bytes, 8-byte aligned. A zero `size` is treated
    /// as one alignment unit; sizes above `MAX_BYTES` bypass the tiers
    /// and use the platform allocator. Returns null only when the OS
    /// denies a new mapping and nothing cached can satisfy the request.
    pub fn allocate(size: usize) -> *mut u8 {
        match with_thread_cache(|tc| unsafe { tc.allocate(size, &CENTRAL_CACHE, &PAGE_CACHE) }) {
            Some(p) => p,
            None => Self::allocate_without_tls(size),
        }
    }

    /// Release a block from [`allocate`](Self::allocate). Null is a
    /// no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(size)` with the same `size` and
    /// must not be freed twice or used afterwards.
    pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        let via_tls = with_thread_cache(|tc| unsafe {
            tc.deallocate(ptr, size, &CENTRAL_CACHE, &PAGE_CACHE)
        });
        if via_tls.is_none() {
            unsafe { Self::deallocate_without_tls(ptr, size) };
        }
    }

    #[cold]
    fn allocate_without_tls(size: usize) -> *mut u8 {
        let size = if size == 0 { ALIGNMENT } else { size };
        if size > MAX_BYTES {
            return platform::large_alloc(size);
        }
        CENTRAL_CACHE.fetch_range(size_class::class_index(size), &PAGE_CACHE) as *mut u8
    }

    #[cold]
    unsafe fn deallocate_without_tls(ptr: *mut u8, size: usize) {
        let size = if size == 0 { ALIGNMENT } else { size };
        if size > MAX_BYTES {
            unsafe { platform::large_free(ptr) };
            return;
        }
        let index = size_class::class_index(size);
        let obj = ptr as *mut FreeObject;
        // SAFETY: single-block chain handed to the central cache.
        unsafe { (*obj).next = ptr::null_mut() };
        CENTRAL_CACHE.return_range(obj, size_class::class_size(index), index, &PAGE_CACHE);
    }

    /// Allocate storage for one `T`. The value is not initialized.
    ///
    /// Types must not need more than `ALIGNMENT`-byte alignment.
    pub fn allocate_value<T>() -> *mut T {
        debug_assert!(align_of::<T>() <= ALIGNMENT);
        Self::allocate(size_of::<T>()) as *mut T
    }

    /// Release storage from [`allocate_value`](Self::allocate_value)
    /// without dropping the pointee.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate`](Self::deallocate).
    pub unsafe fn deallocate_value<T>(ptr: *mut T) {
        unsafe { Self::deallocate(ptr as *mut u8, size_of::<T>()) };
    }

    /// Allocate storage for one `T` and move `value` into it. On OOM
    /// the value is dropped and null is returned.
    pub fn new_value<T>(value: T) -> *mut T {
        let p = Self::allocate_value::<T>();
        if p.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: fresh, correctly sized and aligned storage.
        unsafe { p.write(value) };
        p
    }

    /// Drop the pointee and release its storage. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`new_value`](Self::new_value) (or an
    /// `allocate_value` whose pointee was initialized) and not be used
    /// again.
    pub unsafe fn delete_value<T>(ptr: *mut T) {
        if ptr.is_null() {
            return;
        }
        unsafe {
            ptr::drop_in_place(ptr);
            Self::deallocate_value(ptr);
        }
    }

    /// Allocate storage for `count` values of `T`. The element count is
    /// stashed in one alignment unit preceding the returned block, so
    /// [`deallocate_array`](Self::deallocate_array) can recompute the
    /// total size from the pointer alone. Elements are uninitialized.
    pub fn allocate_array<T>(count: usize) -> *mut T {
        debug_assert!(align_of::<T>() <= ALIGNMENT);
        if count == 0 {
            return ptr::null_mut();
        }
        let bytes = match size_of::<T>()
            .checked_mul(count)
            .and_then(|b| b.checked_add(ALIGNMENT))
        {
            Some(b) => b,
            None => return ptr::null_mut(),
        };
        let base = Self::allocate(bytes);
        if base.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: the header word fits in the leading alignment unit.
        unsafe {
            (base as *mut usize).write(count);
            base.add(ALIGNMENT) as *mut T
        }
    }

    /// Release an array from [`allocate_array`](Self::allocate_array)
    /// without dropping any elements. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_array::<T>` and not be freed
    /// twice; the header word in front of it must be intact.
    pub unsafe fn deallocate_array<T>(ptr: *mut T) {
        if ptr.is_null() {
            return;
        }
        unsafe {
            let base = (ptr as *mut u8).sub(ALIGNMENT);
            let count = (base as *const usize).read();
            let bytes = ALIGNMENT + count * size_of::<T>();
            Self::deallocate(base, bytes);
        }
    }

    /// Prime the caches so the next `count` allocations of `size` can
    /// be served without touching the OS. Sizes above `MAX_BYTES` are
    /// not cached and are ignored.
    pub fn warmup(size: usize, count: usize) {
        if size > MAX_BYTES || count == 0 {
            return;
        }
        let mut held = Vec::with_capacity(count);
        for _ in 0..count {
            let p = Self::allocate(size);
            if p.is_null() {
                break;
            }
            held.push(p);
        }
        for p in held.into_iter().rev() {
            // SAFETY: freeing blocks we just allocated, same sizes.
            unsafe { Self::deallocate(p, size) };
        }
    }

    /// Prime a ladder of representative small sizes.
    pub fn warmup_defaults() {
        for size in [8, 16, 32, 64, 128, 256, 512, 1024] {
            Self::warmup(size, 32);
        }
    }

    /// Pool-wide counters; mainly for tests and diagnostics.
    pub fn stats() -> PoolStats {
        let page = PAGE_CACHE.lock();
        PoolStats {
            pages_mapped: page.pages_mapped(),
            free_spans: page.free_spans(),
            spans_tracked: CENTRAL_CACHE.spans_tracked(),
        }
    }
}
