//! Thread cache (front end): per-thread free lists.
//!
//! One instance per thread, reached through thread-local storage. The
//! fast path (list hit) takes no locks at all; every field is touched
//! only by the owning thread. Misses refill from the central cache,
//! and a list that outgrows its threshold sends most of itself back in
//! one bulk transfer.

use crate::central_cache::CentralCache;
use crate::page_cache::PageCache;
use crate::platform;
use crate::size_class::{self, ALIGNMENT, MAX_BYTES, NUM_CLASSES};
use crate::span::FreeObject;
use crate::sync::SpinMutex;
use core::ptr;

/// List length past which excess blocks go back to the central cache.
pub const LIST_RETURN_THRESHOLD: usize = 64;

/// Per-size-class free list.
struct FreeList {
    head: *mut FreeObject,
    len: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    fn pop(&mut self) -> *mut FreeObject {
        let obj = self.head;
        if !obj.is_null() {
            // SAFETY: head is a live free block owned by this list.
            self.head = unsafe { (*obj).next };
            self.len -= 1;
        }
        obj
    }

    #[inline]
    fn push(&mut self, obj: *mut FreeObject) {
        // SAFETY: the block is free and ownership passes to this list.
        unsafe { (*obj).next = self.head };
        self.head = obj;
        self.len += 1;
    }
}

pub struct ThreadCache {
    lists: [FreeList; NUM_CLASSES],
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { FreeList::new() }; NUM_CLASSES],
        }
    }

    /// Allocate `size` bytes. Returns null only when the OS denies a
    /// new mapping and nothing cached can satisfy the request.
    ///
    /// # Safety
    ///
    /// Must only be called from the thread that owns this cache.
    #[inline]
    pub unsafe fn allocate(
        &mut self,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) -> *mut u8 {
        let size = if size == 0 { ALIGNMENT } else { size };
        if size > MAX_BYTES {
            return platform::large_alloc(size);
        }

        let index = size_class::class_index(size);
        let obj = self.lists[index].pop();
        if !obj.is_null() {
            return obj as *mut u8;
        }
        unsafe { self.fetch_from_central(index, central, page_cache) }
    }

    /// Release a block previously allocated with the same `size`.
    ///
    /// # Safety
    ///
    /// Must only be called from the owning thread. `ptr` must come from
    /// an earlier `allocate(size)` on this pool and not be freed twice;
    /// a mismatched `size` is undefined behavior. Null is a no-op.
    #[inline]
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) {
        if ptr.is_null() {
            return;
        }
        let size = if size == 0 { ALIGNMENT } else { size };
        if size > MAX_BYTES {
            unsafe { platform::large_free(ptr) };
            return;
        }

        let index = size_class::class_index(size);
        self.lists[index].push(ptr as *mut FreeObject);
        if self.lists[index].len > LIST_RETURN_THRESHOLD {
            unsafe { self.return_to_central(index, central, page_cache) };
        }
    }

    /// Miss path: pull a chain from the central cache, hand the first
    /// block to the caller and keep the rest.
    #[cold]
    unsafe fn fetch_from_central(
        &mut self,
        index: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) -> *mut u8 {
        let head = central.fetch_range(index, page_cache);
        if head.is_null() {
            return ptr::null_mut();
        }

        // SAFETY: the fetched chain is ours now.
        unsafe {
            let rest = (*head).next;
            (*head).next = ptr::null_mut();
            if !rest.is_null() {
                let mut count = 0;
                let mut cur = rest;
                while !cur.is_null() {
                    count += 1;
                    cur = (*cur).next;
                }
                let list = &mut self.lists[index];
                list.head = rest;
                list.len += count;
            }
        }
        head as *mut u8
    }

    /// Keep a quarter of the list (rounded up, at least one block) and
    /// hand the surplus back in a single chain.
    unsafe fn return_to_central(
        &mut self,
        index: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) {
        let list = &mut self.lists[index];
        let total = list.len;
        if total <= 1 {
            return;
        }
        let keep = (total + 3) / 4;

        // SAFETY: splitting a chain this list owns.
        unsafe {
            let mut split = list.head;
            let mut kept = 1;
            for _ in 0..keep - 1 {
                let next = (*split).next;
                if next.is_null() {
                    // Chain shorter than the counter claimed; return
                    // whatever actually follows the split node.
                    break;
                }
                split = next;
                kept += 1;
            }

            let surplus = (*split).next;
            (*split).next = ptr::null_mut();
            let returned = total - kept;
            list.len = kept;

            if !surplus.is_null() && returned > 0 {
                central.return_range(
                    surplus,
                    returned * size_class::class_size(index),
                    index,
                    page_cache,
                );
            }
        }
    }

    /// Hand every cached block back to the central cache. Runs when the
    /// owning thread exits.
    ///
    /// # Safety
    ///
    /// Must only be called from the owning thread.
    pub unsafe fn flush(&mut self, central: &CentralCache, page_cache: &SpinMutex<PageCache>) {
        for index in 0..NUM_CLASSES {
            let list = &mut self.lists[index];
            if list.head.is_null() {
                continue;
            }
            let head = list.head;
            let len = list.len;
            list.head = ptr::null_mut();
            list.len = 0;
            central.return_range(head, len * size_class::class_size(index), index, page_cache);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::class_index;

    fn env() -> Box<ThreadCache> {
        Box::new(ThreadCache::new())
    }

    #[test]
    fn test_allocate_and_deallocate() {
        static CENTRAL: CentralCache = CentralCache::new();
        static PAGE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new());
        let mut tc = env();

        unsafe {
            let p = tc.allocate(16, &CENTRAL, &PAGE);
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGNMENT, 0);
            // The block is fully usable.
            p.write_bytes(0x42, 16);
            tc.deallocate(p, 16, &CENTRAL, &PAGE);
        }
    }

    #[test]
    fn test_lifo_reuse() {
        static CENTRAL: CentralCache = CentralCache::new();
        static PAGE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new());
        let mut tc = env();

        unsafe {
            let p = tc.allocate(16, &CENTRAL, &PAGE);
            let q = tc.allocate(16, &CENTRAL, &PAGE);
            assert_ne!(p, q);
            tc.deallocate(p, 16, &CENTRAL, &PAGE);
            // The block just freed is the next one handed out.
            let r = tc.allocate(16, &CENTRAL, &PAGE);
            assert_eq!(r, p);
            tc.deallocate(r, 16, &CENTRAL, &PAGE);
            tc.deallocate(q, 16, &CENTRAL, &PAGE);
        }
    }

    #[test]
    fn test_zero_size_promoted() {
        static CENTRAL: CentralCache = CentralCache::new();
        static PAGE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new());
        let mut tc = env();

        unsafe {
            let p = tc.allocate(0, &CENTRAL, &PAGE);
            assert!(!p.is_null());
            // Usable for a full alignment unit.
            p.write_bytes(0xFF, ALIGNMENT);
            tc.deallocate(p, 0, &CENTRAL, &PAGE);
        }
    }

    #[test]
    fn test_null_dealloc_noop() {
        static CENTRAL: CentralCache = CentralCache::new();
        static PAGE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new());
        let mut tc = env();
        unsafe { tc.deallocate(ptr::null_mut(), 64, &CENTRAL, &PAGE) };
    }

    #[test]
    fn test_large_bypass() {
        static CENTRAL: CentralCache = CentralCache::new();
        static PAGE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new());
        let mut tc = env();

        unsafe {
            let p = tc.allocate(MAX_BYTES + 1, &CENTRAL, &PAGE);
            assert!(!p.is_null());
            p.write_bytes(0x5A, MAX_BYTES + 1);
            tc.deallocate(p, MAX_BYTES + 1, &CENTRAL, &PAGE);
        }
        // Neither tier ever saw the request.
        assert_eq!(CENTRAL.spans_tracked(), 0);
        assert_eq!(PAGE.lock().pages_mapped(), 0);
    }

    #[test]
    fn test_threshold_bulk_return() {
        static CENTRAL: CentralCache = CentralCache::new();
        static PAGE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new());
        let mut tc = env();
        let index = class_index(32);

        unsafe {
            let ptrs: Vec<*mut u8> = (0..LIST_RETURN_THRESHOLD + 1)
                .map(|_| {
                    let p = tc.allocate(32, &CENTRAL, &PAGE);
                    assert!(!p.is_null());
                    p
                })
                .collect();

            // The first THRESHOLD frees just accumulate.
            for &p in &ptrs[..LIST_RETURN_THRESHOLD] {
                tc.deallocate(p, 32, &CENTRAL, &PAGE);
            }
            assert_eq!(tc.lists[index].len, LIST_RETURN_THRESHOLD);

            // One more tips the list over: keep ceil(65 / 4) = 17.
            tc.deallocate(ptrs[LIST_RETURN_THRESHOLD], 32, &CENTRAL, &PAGE);
            assert_eq!(tc.lists[index].len, 17);
        }
    }

    #[test]
    fn test_flush_empties_lists() {
        static CENTRAL: CentralCache = CentralCache::new();
        static PAGE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new());
        let mut tc = env();

        unsafe {
            let mut ptrs = Vec::new();
            for size in [8usize, 24, 128, 1024] {
                for _ in 0..10 {
                    ptrs.push((tc.allocate(size, &CENTRAL, &PAGE), size));
                }
            }
            for (p, size) in ptrs {
                tc.deallocate(p, size, &CENTRAL, &PAGE);
            }
            tc.flush(&CENTRAL, &PAGE);
        }
        for list in tc.lists.iter() {
            assert!(list.head.is_null());
            assert_eq!(list.len, 0);
        }
    }

    #[test]
    fn test_mixed_classes_stay_distinct() {
        static CENTRAL: CentralCache = CentralCache::new();
        static PAGE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new());
        let mut tc = env();

        unsafe {
            let mut seen = std::collections::HashSet::new();
            let mut allocs: Vec<(usize, *mut u8)> = Vec::new();
            for size in [8usize, 16, 72, 256, 4096] {
                for _ in 0..50 {
                    let p = tc.allocate(size, &CENTRAL, &PAGE);
                    assert!(!p.is_null());
                    assert!(seen.insert(p as usize), "duplicate block handed out");
                    allocs.push((size, p));
                }
            }
            for (size, p) in allocs {
                tc.deallocate(p, size, &CENTRAL, &PAGE);
            }
        }
    }
}
