//! The embedded free-list convention.
//!
//! A free block's first machine word is the address of the next free
//! block on its list; an in-use block is opaque caller data. The pool
//! alone reads or writes that word, and only while the block is on a
//! free list. `ALIGNMENT` is at least a pointer wide on supported
//! targets, so every class-0 block can hold the link.

use core::ptr;

/// View of a free block as a list node.
#[repr(transparent)]
pub struct FreeObject {
    pub next: *mut FreeObject,
}

// SAFETY: a FreeObject is plain memory owned by whichever list holds it.
unsafe impl Send for FreeObject {}

/// Carve a fresh span into `block_count` blocks of `block_size` bytes,
/// threading each block's first word to the next. Returns the head of
/// the null-terminated chain.
///
/// # Safety
///
/// `start` must point at `block_count * block_size` writable bytes that
/// nothing else references.
pub unsafe fn carve(start: *mut u8, block_size: usize, block_count: usize) -> *mut FreeObject {
    debug_assert!(block_count > 0);
    unsafe {
        for i in 1..block_count {
            let current = start.add((i - 1) * block_size) as *mut FreeObject;
            let next = start.add(i * block_size) as *mut FreeObject;
            (*current).next = next;
        }
        let last = start.add((block_count - 1) * block_size) as *mut FreeObject;
        (*last).next = ptr::null_mut();
        start as *mut FreeObject
    }
}

/// Number of nodes in a null-terminated chain.
///
/// # Safety
///
/// Every node reachable from `head` must be a live free block.
pub unsafe fn chain_len(head: *mut FreeObject) -> usize {
    let mut n = 0;
    let mut cur = head;
    while !cur.is_null() {
        n += 1;
        cur = unsafe { (*cur).next };
    }
    n
}
