//! # Size Classes
//!
//! Maps a request onto a bucket or onto the system path.
//!
//! Bucket `i` serves blocks of `(i + 1) * object_align_size` bytes, so a
//! request of `n` bytes lands in bucket `ceil(n / object_align_size) - 1`.

use std::alloc::Layout;

use crate::config::{get_offset, AllocatorConfig};
use crate::error::AllocResult;
use crate::memory::chunk::CHUNK_ALIGN;
use crate::memory::system;

/// Where a request is served from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// The bucket at this index.
    Bucket(usize),
    /// The system allocator, with this layout.
    System(Layout),
}

/// Size-to-bucket mapping of one allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClasses {
    max_object_size: usize,
    object_align_size: usize,
}

impl SizeClasses {
    /// Builds the mapping for a validated configuration.
    #[must_use]
    pub const fn new(config: &AllocatorConfig) -> Self {
        Self {
            max_object_size: config.max_object_size,
            object_align_size: config.object_align_size,
        }
    }

    /// Largest request served from a bucket.
    #[inline]
    #[must_use]
    pub const fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    /// Bucket granularity.
    #[inline]
    #[must_use]
    pub const fn object_align_size(&self) -> usize {
        self.object_align_size
    }

    /// Number of buckets.
    #[inline]
    #[must_use]
    pub const fn bucket_count(&self) -> usize {
        get_offset(self.max_object_size, self.object_align_size)
    }

    /// Block size of bucket `index`.
    #[inline]
    #[must_use]
    pub const fn block_size(&self, index: usize) -> usize {
        (index + 1) * self.object_align_size
    }

    /// Bucket serving `num_bytes`, or `None` for a large request.
    /// Zero bytes are served as one.
    #[inline]
    #[must_use]
    pub const fn bucket_index(&self, num_bytes: usize) -> Option<usize> {
        if num_bytes > self.max_object_size {
            return None;
        }
        let num_bytes = if num_bytes == 0 { 1 } else { num_bytes };
        Some(get_offset(num_bytes, self.object_align_size) - 1)
    }

    /// Routes a request given by byte count alone.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::AllocationFailure`](crate::AllocError::AllocationFailure)
    /// if a large request has no valid layout.
    pub fn route_size(&self, num_bytes: usize) -> AllocResult<Route> {
        match self.bucket_index(num_bytes) {
            Some(index) => Ok(Route::Bucket(index)),
            None => system::large_layout(num_bytes).map(Route::System),
        }
    }

    /// Routes a typed request.
    ///
    /// Alignments above [`CHUNK_ALIGN`] always take the system path. Below
    /// that, the size is padded to the alignment, which makes the chosen
    /// block size a multiple of the alignment.
    #[must_use]
    pub fn route_layout(&self, layout: Layout) -> Route {
        if layout.align() > CHUNK_ALIGN {
            return Route::System(layout);
        }
        let request = layout.pad_to_align().size().max(layout.align());
        match self.bucket_index(request) {
            Some(index) => Route::Bucket(index),
            None => Route::System(layout),
        }
    }
}
