//! tierpool: a three-tier memory pool for small and medium objects.
//!
//! Implements the tcmalloc-style cache hierarchy with three tiers:
//! - Thread-local caches (fast path, no locks)
//! - Central free lists (per-size-class spinlocks)
//! - Page cache (span management, OS interface)
//!
//! Blocks of up to [`size_class::MAX_BYTES`] are served from per-thread
//! free lists keyed by size class; larger requests bypass the tiers and
//! go straight to the platform allocator. Free blocks thread their list
//! linkage through their own first word, so the pool carries no
//! per-block metadata.
//!
//! # Usage
//!
//! ```
//! use tierpool::MemoryPool;
//!
//! let p = MemoryPool::allocate(64);
//! assert!(!p.is_null());
//! unsafe { MemoryPool::deallocate(p, 64) };
//! ```

pub mod central_cache;
pub mod page_cache;
pub mod platform;
pub mod pool;
pub mod size_class;
pub mod span;
pub mod sync;
pub mod thread_cache;

/// Page size used by the pool (4 KiB).
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

// Re-export the facade at crate root for convenience
pub use pool::{MemoryPool, PoolStats};
