//! # Memory Budget
//!
//! Shared accounting of bytes held in chunk buffers.
//!
//! Every bucket of an allocator reserves from the same budget before it
//! grows and returns the bytes when a chunk is released. A budget without
//! a limit only counts.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{AllocError, AllocResult};

/// Byte counter with an optional ceiling.
#[derive(Debug, Default)]
pub struct MemoryBudget {
    /// Bytes currently reserved by live chunks.
    used: AtomicUsize,
    /// Ceiling, if any.
    limit: Option<usize>,
}

impl MemoryBudget {
    /// Creates a budget. `None` means unlimited.
    #[must_use]
    pub const fn new(limit: Option<usize>) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    /// Bytes currently reserved.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// The configured ceiling.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Reserves `bytes`, failing if the ceiling would be exceeded.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::AllocationFailure`] when the reservation does
    /// not fit.
    pub fn try_reserve(&self, bytes: usize) -> AllocResult<()> {
        let Some(limit) = self.limit else {
            self.used.fetch_add(bytes, Ordering::Relaxed);
            return Ok(());
        };

        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= limit)
            })
            .map(|_| ())
            .map_err(|_| AllocError::AllocationFailure { bytes })
    }

    /// Returns `bytes` previously reserved.
    #[inline]
    pub fn release(&self, bytes: usize) {
        let previous = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "budget released more than reserved");
    }
}
