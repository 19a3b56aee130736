//! # Small Object Allocator
//!
//! One [`FixedAllocator`] per size class plus the system path for anything
//! larger than `max_object_size`.
//!
//! ## Performance Characteristics
//!
//! - Allocation: O(1) amortized (bucket pick is a division)
//! - Deallocation with size: O(1) bucket pick, then the bucket's lookup
//! - Deallocation without size: linear in the number of chunks
//!
//! ## Memory Exhaustion
//!
//! When a bucket cannot grow, every bucket gives back its empty chunk and
//! spare chunk-array capacity, and the request is retried once. A second
//! failure is reported as [`AllocError::OutOfMemory`].

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::budget::MemoryBudget;
use crate::config::AllocatorConfig;
use crate::error::{AllocError, AllocResult};
use crate::memory::fixed::FixedAllocator;
use crate::memory::front::{self, BucketSet};
use crate::memory::size_class::{Route, SizeClasses};
use crate::memory::system::LargeObjects;
use crate::stats::AllocatorStats;

/// Size-routed allocator for many small objects.
///
/// # Thread Safety
///
/// Not thread-safe. For a shared heap with per-bucket locking see the
/// `oroboros_smallobj` crate.
#[derive(Debug)]
pub struct SmallObjectAllocator {
    /// Bucket `i` serves blocks of `(i + 1) * object_align_size` bytes.
    pool: Box<[FixedAllocator]>,
    classes: SizeClasses,
    page_size: usize,
    budget: Arc<MemoryBudget>,
    large: LargeObjects,
}

impl SmallObjectAllocator {
    /// Builds every bucket for `config`. Chunks are created lazily.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidConfig`] if `config` fails validation
    /// - [`AllocError::AllocationFailure`] if the bucket array cannot be
    ///   reserved
    pub fn new(config: &AllocatorConfig) -> AllocResult<Self> {
        config.validate()?;
        let classes = SizeClasses::new(config);
        let budget = Arc::new(MemoryBudget::new(config.memory_limit));

        let pool = front::build_buckets(config, &classes, &budget)?.into_boxed_slice();

        tracing::info!(
            "small object allocator: {} buckets up to {} bytes, {} byte pages",
            pool.len(),
            classes.max_object_size(),
            config.page_size
        );

        Ok(Self {
            pool,
            classes,
            page_size: config.page_size,
            budget,
            large: LargeObjects::new(),
        })
    }

    /// Builds an allocator with [`AllocatorConfig::default`].
    ///
    /// # Errors
    ///
    /// Never fails for the default configuration; the `Result` mirrors
    /// [`new`](Self::new).
    pub fn with_defaults() -> AllocResult<Self> {
        Self::new(&AllocatorConfig::default())
    }

    /// Largest request served from a bucket.
    #[inline]
    #[must_use]
    pub const fn max_object_size(&self) -> usize {
        self.classes.max_object_size()
    }

    /// Bucket granularity.
    #[inline]
    #[must_use]
    pub const fn alignment(&self) -> usize {
        self.classes.object_align_size()
    }

    /// Target bytes per chunk.
    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// The size-to-bucket mapping.
    #[inline]
    #[must_use]
    pub const fn size_classes(&self) -> &SizeClasses {
        &self.classes
    }

    /// Number of buckets.
    #[inline]
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.pool.len()
    }

    /// Bucket at `index`.
    #[inline]
    #[must_use]
    pub fn bucket(&self, index: usize) -> Option<&FixedAllocator> {
        self.pool.get(index)
    }

    /// Shared accounting of chunk memory.
    #[inline]
    #[must_use]
    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    /// Allocates `num_bytes`.
    ///
    /// Zero bytes are served as one. Requests above
    /// [`max_object_size`](Self::max_object_size) go to the system allocator.
    ///
    /// # Errors
    ///
    /// - [`AllocError::OutOfMemory`] if a bucket cannot grow even after
    ///   [`trim_excess_memory`](Self::trim_excess_memory)
    /// - [`AllocError::AllocationFailure`] if the system allocator refuses a
    ///   large object
    pub fn allocate(&mut self, num_bytes: usize) -> AllocResult<NonNull<u8>> {
        match self.classes.route_size(num_bytes)? {
            Route::Bucket(index) => self.allocate_small(index, num_bytes),
            Route::System(layout) => self.large.allocate(layout),
        }
    }

    /// Returns memory obtained from [`allocate`](Self::allocate).
    ///
    /// A null `p` is ignored. `num_bytes` must be the size passed to
    /// `allocate`; a different size is detected and nothing is freed.
    ///
    /// # Errors
    ///
    /// - [`AllocError::SizeMismatch`] if `p` is owned but by another size class
    /// - [`AllocError::ForeignPointer`] if this allocator does not own `p`
    /// - [`AllocError::MisalignedPointer`] or [`AllocError::DoubleFree`] for
    ///   a bad pointer into an owned chunk
    pub fn deallocate(&mut self, p: *mut u8, num_bytes: usize) -> AllocResult<()> {
        let Some(p) = NonNull::new(p) else {
            return Ok(());
        };

        match self.classes.route_size(num_bytes)? {
            Route::Bucket(index) => self.deallocate_small(p, index, num_bytes),
            Route::System(layout) => match self.large.deallocate(p, layout) {
                Err(AllocError::ForeignPointer { .. }) => Err(self.diagnose(p, num_bytes)),
                other => other,
            },
        }
    }

    /// Returns memory without knowing its size.
    ///
    /// Scans every bucket for the owning chunk, then the large objects.
    ///
    /// # Errors
    ///
    /// Same as [`deallocate`](Self::deallocate), except that a size mismatch
    /// cannot occur.
    pub fn deallocate_unsized(&mut self, p: *mut u8) -> AllocResult<()> {
        let Some(p) = NonNull::new(p) else {
            return Ok(());
        };

        for bucket in self.pool.iter_mut() {
            if let Some(chunk) = bucket.has_block(p) {
                return bucket.deallocate(p, Some(chunk));
            }
        }
        self.large.deallocate_unsized(p)
    }

    /// Allocates memory fitting `layout`.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate).
    pub fn allocate_layout(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        match self.classes.route_layout(layout) {
            Route::Bucket(index) => self.allocate_small(index, layout.size()),
            Route::System(layout) => self.large.allocate(layout),
        }
    }

    /// Returns memory obtained from [`allocate_layout`](Self::allocate_layout)
    /// with the same `layout`.
    ///
    /// # Errors
    ///
    /// Same as [`deallocate`](Self::deallocate).
    pub fn deallocate_layout(&mut self, p: NonNull<u8>, layout: Layout) -> AllocResult<()> {
        match self.classes.route_layout(layout) {
            Route::Bucket(index) => self.deallocate_small(p, index, layout.size()),
            Route::System(layout) => match self.large.deallocate(p, layout) {
                Err(AllocError::ForeignPointer { .. }) => Err(self.diagnose(p, layout.size())),
                other => other,
            },
        }
    }

    /// Releases every bucket's empty chunk and spare chunk-array capacity.
    ///
    /// Returns true if anything was released.
    pub fn trim_excess_memory(&mut self) -> bool {
        let mut found = false;
        for bucket in self.pool.iter_mut() {
            found |= bucket.trim_empty_chunk();
        }
        for bucket in self.pool.iter_mut() {
            found |= bucket.trim_chunk_list();
        }
        found
    }

    /// Checks every bucket's bookkeeping.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        if self.pool.len() != self.classes.bucket_count() {
            return true;
        }
        self.pool.iter().enumerate().any(|(index, bucket)| {
            bucket.block_size() != self.classes.block_size(index) || bucket.is_corrupt()
        })
    }

    /// Snapshot of every bucket and the large objects.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            buckets: self.pool.iter().map(FixedAllocator::stats).collect(),
            large_live: self.large.live_count(),
            large_bytes: self.large.bytes(),
        }
    }

    fn allocate_small(&mut self, index: usize, num_bytes: usize) -> AllocResult<NonNull<u8>> {
        front::allocate_with_retry(self, index, num_bytes)
    }

    fn deallocate_small(
        &mut self,
        p: NonNull<u8>,
        index: usize,
        num_bytes: usize,
    ) -> AllocResult<()> {
        match self.pool[index].deallocate(p, None) {
            Err(AllocError::ForeignPointer { .. }) => Err(self.diagnose(p, num_bytes)),
            other => other,
        }
    }

    fn diagnose(&self, p: NonNull<u8>, num_bytes: usize) -> AllocError {
        front::diagnose_rejected(self, p, num_bytes, None)
    }
}

impl BucketSet for SmallObjectAllocator {
    fn size_classes(&self) -> &SizeClasses {
        &self.classes
    }

    fn memory_budget(&self) -> &MemoryBudget {
        &self.budget
    }

    fn allocate_from(&mut self, index: usize) -> AllocResult<NonNull<u8>> {
        self.pool[index].allocate()
    }

    fn release_excess(&mut self) -> bool {
        self.trim_excess_memory()
    }

    fn owner_block_size(&self, p: NonNull<u8>, skip: Option<usize>) -> Option<usize> {
        self.pool
            .iter()
            .enumerate()
            .filter(|&(index, _)| Some(index) != skip)
            .find(|(_, bucket)| bucket.has_block(p).is_some())
            .map(|(_, bucket)| bucket.block_size())
            .or_else(|| self.large.layout_of(p).map(|layout| layout.size()))
    }
}
