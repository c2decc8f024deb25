//! Central cache (middle tier): per-size-class shared free lists.
//!
//! One spinlocked list per size class. A miss refills the list with a
//! whole span from the page cache, carved into equal blocks. Span
//! trackers record how many blocks of each span are back on the list;
//! a delayed-return sweep hands fully idle spans back to the page
//! cache so their pages can be reused or coalesced.

use crate::page_cache::PageCache;
use crate::size_class::{self, NUM_CLASSES};
use crate::span::{self, FreeObject};
use crate::sync::SpinMutex;
use crate::PAGE_SIZE;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{trace, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Pages per refill span for classes whose block fits inside it.
pub const SPAN_PAGES: usize = 8;

/// Bulk returns accumulated on a class before a delayed-return sweep.
pub const MAX_DELAY_COUNT: usize = 48;

/// Wall-clock interval after which a sweep runs regardless of count.
pub const DELAY_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the span tracker table. Spans carved after the table
/// fills are still usable; they just stay resident for the rest of the
/// process, which bounds the table's memory instead of the heap's.
pub const MAX_SPAN_TRACKERS: usize = 1024;

/// Per-class list state, all guarded by the class spinlock.
struct CentralList {
    head: *mut FreeObject,
    /// Bulk returns since the last sweep.
    delay_count: usize,
    /// When the last sweep ran. `None` until the first sweep, which
    /// therefore runs on the first bulk return.
    last_return: Option<Instant>,
}

// SAFETY: the owning SpinMutex serializes all access to the raw list.
unsafe impl Send for CentralList {}

impl CentralList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            delay_count: 0,
            last_return: None,
        }
    }
}

/// Carving record for one span: where it is and how many of its blocks
/// are currently free on the central list.
///
/// Fields are atomics because the table is shared across all size
/// classes while each class holds only its own spinlock. The address
/// is published last with release ordering and cleared (zeroed) when
/// the span is handed back, so scanners never match a stale record.
pub struct SpanTracker {
    addr: AtomicUsize,
    pages: AtomicUsize,
    block_count: AtomicUsize,
    free_count: AtomicUsize,
}

impl SpanTracker {
    const fn new() -> Self {
        Self {
            addr: AtomicUsize::new(0),
            pages: AtomicUsize::new(0),
            block_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
        }
    }

    fn retire(&self) {
        self.addr.store(0, Ordering::Release);
    }
}

pub struct CentralCache {
    lists: [SpinMutex<CentralList>; NUM_CLASSES],
    trackers: [SpanTracker; MAX_SPAN_TRACKERS],
    /// Tracker slots handed out so far. Only ever grows.
    span_count: AtomicUsize,
}

impl CentralCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { SpinMutex::new(CentralList::new()) }; NUM_CLASSES],
            trackers: [const { SpanTracker::new() }; MAX_SPAN_TRACKERS],
            span_count: AtomicUsize::new(0),
        }
    }

    /// Detach one block of class `index` for a thread cache.
    ///
    /// Refills from the page cache when the list is empty. Returns a
    /// single block with a cleared link, or null when the OS is out of
    /// memory. The page cache lock is taken while the class spinlock is
    /// held; that nesting is safe because the page cache never calls
    /// back into this tier.
    pub fn fetch_range(&self, index: usize, page_cache: &SpinMutex<PageCache>) -> *mut FreeObject {
        if index >= NUM_CLASSES {
            debug_assert!(false, "size class {} out of range", index);
            return ptr::null_mut();
        }

        let mut list = self.lists[index].lock();

        if !list.head.is_null() {
            let block = list.head;
            // SAFETY: head is a live free block owned by this list.
            unsafe {
                list.head = (*block).next;
                (*block).next = ptr::null_mut();
            }
            match self.tracker_slot_for(block as usize) {
                Some(slot) => {
                    self.trackers[slot].free_count.fetch_sub(1, Ordering::Relaxed);
                }
                // Span carved after the tracker table filled up.
                None => trace!("block {:p} has no span tracker", block),
            }
            return block;
        }

        // Refill: fetch a span and carve it into blocks.
        let block_size = size_class::class_size(index);
        let num_pages = if block_size <= SPAN_PAGES * PAGE_SIZE {
            SPAN_PAGES
        } else {
            (block_size + PAGE_SIZE - 1) / PAGE_SIZE
        };
        let span_addr = page_cache.lock().allocate_span(num_pages);
        if span_addr.is_null() {
            return ptr::null_mut();
        }

        let block_count = num_pages * PAGE_SIZE / block_size;
        // SAFETY: the span is fresh, page-aligned, and large enough for
        // block_count blocks of block_size bytes.
        let first = unsafe {
            let head = span::carve(span_addr, block_size, block_count);
            list.head = (*head).next;
            (*head).next = ptr::null_mut();
            head
        };
        self.install_tracker(span_addr as usize, num_pages, block_count);
        first
    }

    /// Splice a null-terminated chain of `byte_count / block_size`
    /// blocks back onto class `index` and maybe run a sweep.
    pub fn return_range(
        &self,
        start: *mut FreeObject,
        byte_count: usize,
        index: usize,
        page_cache: &SpinMutex<PageCache>,
    ) {
        if start.is_null() || index >= NUM_CLASSES {
            return;
        }

        let mut list = self.lists[index].lock();

        // Walk the incoming chain to its terminator.
        let mut tail = start;
        let mut count = 1;
        // SAFETY: callers hand over a null-terminated chain of free
        // blocks they own; ownership transfers to this list.
        unsafe {
            while !(*tail).next.is_null() {
                tail = (*tail).next;
                count += 1;
            }
            (*tail).next = list.head;
        }
        debug_assert_eq!(count, byte_count / size_class::class_size(index));
        list.head = start;

        list.delay_count += 1;
        let due = list.delay_count >= MAX_DELAY_COUNT
            || list
                .last_return
                .map_or(true, |at| at.elapsed() >= DELAY_INTERVAL);
        if due {
            self.perform_delay_return(index, &mut list, page_cache);
        }
    }

    /// Sweep class `index`: census the list per span, hand fully idle
    /// spans back to the page cache, refresh the rest.
    fn perform_delay_return(
        &self,
        index: usize,
        list: &mut CentralList,
        page_cache: &SpinMutex<PageCache>,
    ) {
        list.delay_count = 0;
        list.last_return = Some(Instant::now());

        // Observed free blocks per tracker slot.
        let mut observed: HashMap<usize, usize> = HashMap::new();
        let mut cur = list.head;
        while !cur.is_null() {
            if let Some(slot) = self.tracker_slot_for(cur as usize) {
                *observed.entry(slot).or_insert(0) += 1;
            }
            // SAFETY: every node on the list is a live free block.
            cur = unsafe { (*cur).next };
        }

        // Persist the census; collect spans whose every block is here.
        let mut idle: Vec<(usize, usize, usize)> = Vec::new();
        for (&slot, &free) in &observed {
            let tracker = &self.trackers[slot];
            tracker.free_count.store(free, Ordering::Relaxed);
            if free == tracker.block_count.load(Ordering::Relaxed) {
                idle.push((
                    slot,
                    tracker.addr.load(Ordering::Relaxed),
                    tracker.pages.load(Ordering::Relaxed),
                ));
            }
        }
        if idle.is_empty() {
            return;
        }

        // Unthread every block belonging to an idle span, keeping the
        // survivors in list order.
        let ranges: Vec<(usize, usize)> = idle
            .iter()
            .map(|&(_, base, pages)| (base, base + pages * PAGE_SIZE))
            .collect();
        let mut new_head: *mut FreeObject = ptr::null_mut();
        let mut new_tail: *mut FreeObject = ptr::null_mut();
        let mut cur = list.head;
        // SAFETY: rethreading nodes this list owns.
        unsafe {
            while !cur.is_null() {
                let next = (*cur).next;
                let at = cur as usize;
                if !ranges.iter().any(|&(start, end)| at >= start && at < end) {
                    if new_head.is_null() {
                        new_head = cur;
                    } else {
                        (*new_tail).next = cur;
                    }
                    new_tail = cur;
                }
                cur = next;
            }
            if !new_tail.is_null() {
                (*new_tail).next = ptr::null_mut();
            }
        }
        list.head = new_head;

        trace!(
            "class {}: returning {} idle span(s) to the page cache",
            index,
            idle.len()
        );
        let mut cache = page_cache.lock();
        for (slot, base, pages) in idle {
            self.trackers[slot].retire();
            cache.deallocate_span(base as *mut u8, pages);
        }
    }

    fn install_tracker(&self, addr: usize, pages: usize, block_count: usize) {
        let slot = self.span_count.fetch_add(1, Ordering::Relaxed);
        if slot >= MAX_SPAN_TRACKERS {
            warn!(
                "span tracker table full; span {:#x} will stay resident",
                addr
            );
            return;
        }
        let tracker = &self.trackers[slot];
        tracker.pages.store(pages, Ordering::Relaxed);
        tracker.block_count.store(block_count, Ordering::Relaxed);
        tracker.free_count.store(block_count - 1, Ordering::Relaxed);
        // Publish last; scanners key on a nonzero address.
        tracker.addr.store(addr, Ordering::Release);
    }

    /// Linear scan for the tracker whose span contains `block`.
    /// Addresses compare as plain integers.
    fn tracker_slot_for(&self, block: usize) -> Option<usize> {
        let installed = self.span_count.load(Ordering::Acquire).min(MAX_SPAN_TRACKERS);
        for slot in 0..installed {
            let tracker = &self.trackers[slot];
            let addr = tracker.addr.load(Ordering::Acquire);
            if addr == 0 {
                continue;
            }
            let end = addr + tracker.pages.load(Ordering::Relaxed) * PAGE_SIZE;
            if block >= addr && block < end {
                return Some(slot);
            }
        }
        None
    }

    /// Tracker slots handed out so far (cumulative; retired slots are
    /// not reused).
    pub fn spans_tracked(&self) -> usize {
        self.span_count.load(Ordering::Relaxed).min(MAX_SPAN_TRACKERS)
    }
}
