//! # OROBOROS Small Object Allocator
//!
//! Slab allocation for the many tiny objects a frame churns through:
//! particles, events, script values, scratch nodes.
//!
//! ## Architecture Rules
//!
//! 1. **Size classes** - requests are rounded up to a multiple of the
//!    object alignment and served from that class's chunks
//! 2. **No side tables** - free blocks link to each other through their
//!    own first byte; a chunk only keeps a bitmask of which blocks are free
//! 3. **One spare chunk** - each class keeps at most one completely free
//!    chunk, the rest go back to the system immediately
//!
//! ## Example
//!
//! ```rust
//! use oroboros_alloc::{AllocatorConfig, SmallObjectAllocator};
//!
//! let mut allocator = SmallObjectAllocator::new(&AllocatorConfig::default())?;
//! let p = allocator.allocate(24)?;
//! allocator.deallocate(p.as_ptr(), 24)?;
//! # Ok::<(), oroboros_alloc::AllocError>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod budget;
pub mod config;
pub mod error;
pub mod memory;
pub mod stats;

pub use budget::MemoryBudget;
pub use config::{
    get_offset, AllocatorConfig, DEFAULT_CHUNK_SIZE, DEFAULT_OBJECT_ALIGNMENT,
    MAX_BLOCK_SIZE_LIMIT, MAX_SMALL_OBJECT_SIZE,
};
pub use error::{AllocError, AllocResult};
pub use memory::{
    allocate_with_retry, build_buckets, diagnose_rejected, BucketSet, Chunk, FixedAllocator,
    LargeObjects, Route, SizeClasses, SmallObjectAllocator, CHUNK_ALIGN,
};
pub use stats::{AllocatorStats, BucketStats};
