//! # Allocator Error Types
//!
//! All errors that can occur in the small object allocator.

use thiserror::Error;

/// Errors that can occur while allocating or freeing small objects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The system allocator (or the memory budget) refused a chunk or a
    /// large object.
    #[error("allocation failure: could not obtain {bytes} bytes")]
    AllocationFailure {
        /// Size of the refused request.
        bytes: usize,
    },

    /// Allocation still failed after releasing excess memory and retrying.
    #[error("out of memory: {bytes} byte request failed after trim and retry")]
    OutOfMemory {
        /// Size the caller asked for.
        bytes: usize,
    },

    /// Invalid construction parameters or configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The pointer does not belong to any chunk of this allocator.
    #[error("pointer {addr:#x} is not owned by this allocator")]
    ForeignPointer {
        /// Address of the rejected pointer.
        addr: usize,
    },

    /// The pointer belongs to a bucket other than the one the size selects.
    #[error("pointer {addr:#x} freed with size {size} but lives in a {block_size} byte bucket")]
    SizeMismatch {
        /// Address of the rejected pointer.
        addr: usize,
        /// Size passed to deallocate.
        size: usize,
        /// Block size of the bucket that actually owns the pointer.
        block_size: usize,
    },

    /// The pointer is inside a chunk but not at the start of a block.
    #[error("pointer {addr:#x} is not on a block boundary")]
    MisalignedPointer {
        /// Address of the rejected pointer.
        addr: usize,
    },

    /// The block is already on its chunk's free list.
    #[error("double free of block {addr:#x}")]
    DoubleFree {
        /// Address of the rejected pointer.
        addr: usize,
    },
}

impl AllocError {
    /// Returns true for the out-of-memory family of errors.
    ///
    /// These are the only errors the trim-and-retry path reacts to.
    #[must_use]
    pub const fn is_memory_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailure { .. } | Self::OutOfMemory { .. }
        )
    }
}

/// Result type for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;
