//! Size class mapping: byte counts to free-list indices.
//!
//! Classes are linear: class `i` holds blocks of `(i + 1) * ALIGNMENT`
//! bytes, from 8 bytes up to 256 KiB. Requests above [`MAX_BYTES`] are
//! not classed at all; they bypass the tiered caches entirely.

/// Block granularity. Also the minimum allocation size and the
/// guaranteed alignment of every pointer the pool hands out.
pub const ALIGNMENT: usize = 8;

/// Largest request served from the tiered caches.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size classes, one per `ALIGNMENT` step up to `MAX_BYTES`.
pub const NUM_CLASSES: usize = MAX_BYTES / ALIGNMENT;

/// Round a byte count up to the next multiple of `ALIGNMENT`.
#[inline]
pub const fn round_up(bytes: usize) -> usize {
    (bytes + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Map a byte count to its size class index.
///
/// Zero-sized requests are promoted to one alignment unit. The result
/// is only meaningful for `bytes <= MAX_BYTES`; callers route larger
/// requests to the platform allocator before indexing.
#[inline]
pub const fn class_index(bytes: usize) -> usize {
    let bytes = if bytes < ALIGNMENT { ALIGNMENT } else { bytes };
    (bytes + ALIGNMENT - 1) / ALIGNMENT - 1
}

/// Block size for a given class index.
#[inline]
pub const fn class_size(index: usize) -> usize {
    (index + 1) * ALIGNMENT
}
