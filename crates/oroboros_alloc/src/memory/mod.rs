//! # Memory Management
//!
//! Chunked slabs for many small, short-lived objects.
//!
//! ## Layers
//!
//! - [`Chunk`] - one slab of at most 255 equally sized blocks
//! - [`FixedAllocator`] - a growable set of chunks for one block size
//! - [`SmallObjectAllocator`] - one `FixedAllocator` per size class, plus
//!   the system path for large and over-aligned objects
//! - [`BucketSet`] - the seam that lets other front ends share bucket
//!   construction, trim-and-retry and mismatch diagnosis

mod chunk;
mod fixed;
mod front;
mod size_class;
mod small;
mod system;

#[cfg(debug_assertions)]
pub use chunk::POISON;
pub use chunk::{Chunk, CHUNK_ALIGN, MAX_BLOCKS_PER_CHUNK};
pub use fixed::{FixedAllocator, MAX_OBJECTS_PER_CHUNK, MIN_OBJECTS_PER_CHUNK};
pub use front::{allocate_with_retry, build_buckets, diagnose_rejected, BucketSet};
pub use size_class::{Route, SizeClasses};
pub use small::SmallObjectAllocator;
pub use system::{large_layout, LargeObjects, LARGE_OBJECT_ALIGN};
