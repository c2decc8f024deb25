//! Page cache (back-end): best-fit cache of page-aligned spans.
//!
//! Process-wide, serialized by a single lock around the whole struct.
//! Spans are obtained from the OS in multi-page chunks, split on
//! demand, and coalesced with their immediate successor when freed.
//! Nothing is ever unmapped; a returned span waits here for reuse.

use crate::platform;
use crate::PAGE_SIZE;
use core::ptr;
use log::{debug, trace, warn};
use std::collections::BTreeMap;

struct SpanInfo {
    /// Current page count of the span (changes on split/merge).
    pages: usize,
    /// Whether the span sits in a `free_spans` bucket right now.
    free: bool,
}

pub struct PageCache {
    /// Page count -> LIFO stack of free span base addresses. Best-fit
    /// lookup takes the smallest key >= the request.
    free_spans: BTreeMap<usize, Vec<usize>>,
    /// Base address -> record of every span this cache has issued,
    /// free or not. Validates deallocations and drives coalescing.
    span_map: BTreeMap<usize, SpanInfo>,
    /// Total pages ever obtained from the OS.
    pages_mapped: usize,
}

impl PageCache {
    pub const fn new() -> Self {
        Self {
            free_spans: BTreeMap::new(),
            span_map: BTreeMap::new(),
            pages_mapped: 0,
        }
    }

    /// Hand out a span of at least `num_pages` pages (exactly
    /// `num_pages` after splitting). Returns null if the OS is out of
    /// memory.
    pub fn allocate_span(&mut self, num_pages: usize) -> *mut u8 {
        if num_pages == 0 {
            return ptr::null_mut();
        }

        // Best fit: smallest bucket that can satisfy the request.
        if let Some((&bucket_pages, _)) = self.free_spans.range(num_pages..).next() {
            let base = {
                let bucket = self.free_spans.get_mut(&bucket_pages).unwrap();
                let base = bucket.pop().unwrap();
                if bucket.is_empty() {
                    self.free_spans.remove(&bucket_pages);
                }
                base
            };

            if bucket_pages > num_pages {
                // Keep the leading pages, re-list the trailing rest.
                let rest_base = base + num_pages * PAGE_SIZE;
                let rest_pages = bucket_pages - num_pages;
                self.span_map.insert(
                    rest_base,
                    SpanInfo {
                        pages: rest_pages,
                        free: true,
                    },
                );
                self.free_spans.entry(rest_pages).or_default().push(rest_base);
                trace!(
                    "split span {:#x}: {} pages kept, {} pages re-listed",
                    base,
                    num_pages,
                    rest_pages
                );
            }

            let info = self.span_map.get_mut(&base).unwrap();
            info.pages = num_pages;
            info.free = false;
            return base as *mut u8;
        }

        // Nothing cached is big enough; go to the OS.
        let addr = platform::map_pages(num_pages);
        if addr.is_null() {
            warn!("OS refused a {}-page mapping", num_pages);
            return ptr::null_mut();
        }
        self.pages_mapped += num_pages;
        debug!("mapped {} pages from the OS at {:p}", num_pages, addr);
        self.span_map.insert(
            addr as usize,
            SpanInfo {
                pages: num_pages,
                free: false,
            },
        );
        addr
    }

    /// Take back a span previously issued by [`allocate_span`].
    ///
    /// Addresses this cache never issued are ignored, as is a span that
    /// is already free; the cache cannot tell either apart from a
    /// double free or a foreign pointer. The span is merged with its
    /// immediate successor when that successor is also free.
    pub fn deallocate_span(&mut self, addr: *mut u8, num_pages: usize) {
        let base = addr as usize;
        match self.span_map.get(&base) {
            None => {
                warn!("span {:#x} was not issued by this cache; ignoring", base);
                return;
            }
            Some(info) if info.free => return,
            Some(info) => debug_assert_eq!(info.pages, num_pages),
        }

        let mut pages = num_pages;

        // Coalesce forward only: the successor's base is a direct map
        // lookup, so no neighbor links are needed.
        let next_base = base + pages * PAGE_SIZE;
        if let Some(next) = self.span_map.get(&next_base) {
            if next.free {
                let next_pages = next.pages;
                self.unlink_free(next_base, next_pages);
                self.span_map.remove(&next_base);
                pages += next_pages;
                trace!(
                    "coalesced span {:#x} with successor {:#x} into {} pages",
                    base,
                    next_base,
                    pages
                );
            }
        }

        let info = self.span_map.get_mut(&base).unwrap();
        info.pages = pages;
        info.free = true;
        self.free_spans.entry(pages).or_default().push(base);
    }

    fn unlink_free(&mut self, base: usize, pages: usize) {
        if let Some(bucket) = self.free_spans.get_mut(&pages) {
            if let Some(pos) = bucket.iter().position(|&a| a == base) {
                bucket.swap_remove(pos);
            }
            if bucket.is_empty() {
                self.free_spans.remove(&pages);
            }
        }
    }

    /// Total pages ever obtained from the OS.
    pub fn pages_mapped(&self) -> usize {
        self.pages_mapped
    }

    /// Number of free spans currently cached with exactly `num_pages`.
    pub fn free_span_count(&self, num_pages: usize) -> usize {
        self.free_spans.get(&num_pages).map_or(0, Vec::len)
    }

    /// Census of the free-span index: `(page_count, span_count)`,
    /// ascending by page count.
    pub fn free_spans(&self) -> Vec<(usize, usize)> {
        self.free_spans
            .iter()
            .map(|(&pages, bucket)| (pages, bucket.len()))
            .collect()
    }
}
