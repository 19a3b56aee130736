//! # Small Object Heap
//!
//! Shared front end over the bucket allocators. Each size class sits behind
//! its own lock, so threads allocating different sizes never contend.
//!
//! ## Lock Order
//!
//! At most one bucket lock is held at any time. Trim-and-retry and size
//! mismatch diagnosis release the current bucket before visiting others.
//!
//! ## Safety Note
//!
//! [`SmallBox`](crate::SmallBox) dereferences its block without unsafe
//! code, so freeing that block behind the box's back must not be possible
//! from safe code. The raw-pointer free functions are therefore `unsafe`:
//! the caller promises the block is not owned by a live box. Every other
//! misuse (foreign pointers, wrong sizes, double frees) is still detected
//! and reported.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use oroboros_alloc::{
    allocate_with_retry, build_buckets, diagnose_rejected, AllocError, AllocResult,
    AllocatorConfig, AllocatorStats, BucketSet, FixedAllocator, LargeObjects, MemoryBudget, Route,
    SizeClasses,
};
use parking_lot::Mutex;

/// Thread-safe small object heap.
///
/// Not a global: create one at startup and hand `&SmallObjectHeap` (or an
/// `Arc`) to every system that allocates from it.
///
/// # Example
///
/// ```rust
/// use oroboros_alloc::AllocatorConfig;
/// use oroboros_smallobj::SmallObjectHeap;
///
/// let heap = SmallObjectHeap::new(&AllocatorConfig::default())?;
/// let p = heap.allocate(48)?;
/// // SAFETY: `p` came from `allocate` and nothing else refers to it.
/// unsafe { heap.deallocate(p.as_ptr(), 48)? };
/// # Ok::<(), oroboros_alloc::AllocError>(())
/// ```
#[derive(Debug)]
pub struct SmallObjectHeap {
    /// One lock per size class.
    buckets: Box<[Mutex<FixedAllocator>]>,
    /// Size-to-bucket mapping.
    classes: SizeClasses,
    /// Shared accounting of chunk memory.
    budget: Arc<MemoryBudget>,
    /// Objects above the small size limit.
    large: Mutex<LargeObjects>,
}

impl SmallObjectHeap {
    /// Builds every bucket for `config`.
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

        let buckets: Box<[Mutex<FixedAllocator>]> = build_buckets(config, &classes, &budget)?
            .into_iter()
            .map(Mutex::new)
            .collect();

        tracing::info!(
            "small object heap: {} buckets up to {} bytes, limit {:?}",
            buckets.len(),
            classes.max_object_size(),
            config.memory_limit
        );

        Ok(Self {
            buckets,
            classes,
            budget,
            large: Mutex::new(LargeObjects::new()),
        })
    }

    /// The size-to-bucket mapping.
    #[inline]
    #[must_use]
    pub const fn size_classes(&self) -> &SizeClasses {
        &self.classes
    }

    /// Shared accounting of chunk memory.
    #[inline]
    #[must_use]
    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocates `num_bytes`.
    ///
    /// # Errors
    ///
    /// - [`AllocError::OutOfMemory`] if a bucket cannot grow even after
    ///   [`trim_excess_memory`](Self::trim_excess_memory)
    /// - [`AllocError::AllocationFailure`] if the system allocator refuses a
    ///   large object
    pub fn allocate(&self, num_bytes: usize) -> AllocResult<NonNull<u8>> {
        match self.classes.route_size(num_bytes)? {
            Route::Bucket(index) => self.allocate_small(index, num_bytes),
            Route::System(layout) => self.large.lock().allocate(layout),
        }
    }

    /// Allocates memory fitting `layout`.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate).
    pub fn allocate_layout(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        match self.classes.route_layout(layout) {
            Route::Bucket(index) => self.allocate_small(index, layout.size()),
            Route::System(layout) => self.large.lock().allocate(layout),
        }
    }

    fn allocate_small(&self, index: usize, num_bytes: usize) -> AllocResult<NonNull<u8>> {
        let mut set = self;
        allocate_with_retry(&mut set, index, num_bytes)
    }

    // ========================================================================
    // Deallocation
    // ========================================================================

    /// Returns memory obtained from [`allocate`](Self::allocate) with the
    /// same `num_bytes`. A null `p` is ignored.
    ///
    /// # Safety
    ///
    /// `p` must not be the block of a live [`SmallBox`](crate::SmallBox),
    /// and nothing may access the block after this call. Pointers this heap
    /// does not own, or owns under another size, are rejected without
    /// being touched.
    ///
    /// # Errors
    ///
    /// - [`AllocError::SizeMismatch`] if `p` is owned by another size class
    /// - [`AllocError::ForeignPointer`] if this heap does not own `p`
    /// - [`AllocError::MisalignedPointer`] or [`AllocError::DoubleFree`] for
    ///   a bad pointer into an owned chunk
    pub unsafe fn deallocate(&self, p: *mut u8, num_bytes: usize) -> AllocResult<()> {
        let Some(p) = NonNull::new(p) else {
            return Ok(());
        };
        match self.classes.route_size(num_bytes)? {
            Route::Bucket(index) => self.deallocate_small(p, index, num_bytes),
            Route::System(layout) => self.deallocate_large(p, layout),
        }
    }

    /// Returns memory obtained from [`allocate_layout`](Self::allocate_layout)
    /// with the same `layout`.
    ///
    /// # Safety
    ///
    /// Same as [`deallocate`](Self::deallocate).
    ///
    /// # Errors
    ///
    /// Same as [`deallocate`](Self::deallocate).
    pub unsafe fn deallocate_layout(&self, p: NonNull<u8>, layout: Layout) -> AllocResult<()> {
        match self.classes.route_layout(layout) {
            Route::Bucket(index) => self.deallocate_small(p, index, layout.size()),
            Route::System(layout) => self.deallocate_large(p, layout),
        }
    }

    /// Returns memory without knowing its size, by scanning every bucket.
    ///
    /// # Safety
    ///
    /// Same as [`deallocate`](Self::deallocate). Freeing a boxed block is
    /// refused at compile time:
    ///
    /// ```compile_fail,E0133
    /// use oroboros_alloc::AllocatorConfig;
    /// use oroboros_smallobj::{SmallBox, SmallObjectHeap};
    ///
    /// let heap = SmallObjectHeap::new(&AllocatorConfig::default()).unwrap();
    /// let boxed = SmallBox::new_in(1u64, &heap).unwrap();
    /// heap.deallocate_unsized(SmallBox::as_ptr(&boxed) as *mut u8).unwrap();
    /// ```
    ///
    /// # Errors
    ///
    /// Same as [`deallocate`](Self::deallocate), except that a size mismatch
    /// cannot occur.
    pub unsafe fn deallocate_unsized(&self, p: *mut u8) -> AllocResult<()> {
        let Some(p) = NonNull::new(p) else {
            return Ok(());
        };
        for bucket in self.buckets.iter() {
            let mut bucket = bucket.lock();
            if let Some(chunk) = bucket.has_block(p) {
                return bucket.deallocate(p, Some(chunk));
            }
        }
        self.large.lock().deallocate_unsized(p)
    }

    fn deallocate_small(&self, p: NonNull<u8>, index: usize, num_bytes: usize) -> AllocResult<()> {
        let result = self.buckets[index].lock().deallocate(p, None);
        match result {
            Err(AllocError::ForeignPointer { .. }) => {
                Err(diagnose_rejected(&self, p, num_bytes, Some(index)))
            }
            other => other,
        }
    }

    fn deallocate_large(&self, p: NonNull<u8>, layout: Layout) -> AllocResult<()> {
        let result = self.large.lock().deallocate(p, layout);
        match result {
            Err(AllocError::ForeignPointer { .. }) => {
                Err(diagnose_rejected(&self, p, layout.size(), None))
            }
            other => other,
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Releases every bucket's empty chunk and spare chunk-array capacity.
    ///
    /// Buckets are visited one at a time; allocation in other buckets
    /// continues meanwhile. Returns true if anything was released.
    pub fn trim_excess_memory(&self) -> bool {
        let mut found = false;
        for bucket in self.buckets.iter() {
            found |= bucket.lock().trim_empty_chunk();
        }
        for bucket in self.buckets.iter() {
            found |= bucket.lock().trim_chunk_list();
        }
        found
    }

    /// Checks every bucket's bookkeeping.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.buckets.iter().enumerate().any(|(index, bucket)| {
            let bucket = bucket.lock();
            bucket.block_size() != self.classes.block_size(index) || bucket.is_corrupt()
        })
    }

    /// Snapshot of every bucket and the large objects.
    ///
    /// Buckets are locked one after another, so under concurrent traffic the
    /// snapshot is not atomic across buckets.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let buckets = self.buckets.iter().map(|bucket| bucket.lock().stats()).collect();
        let large = self.large.lock();
        AllocatorStats {
            buckets,
            large_live: large.live_count(),
            large_bytes: large.bytes(),
        }
    }
}

impl BucketSet for &SmallObjectHeap {
    fn size_classes(&self) -> &SizeClasses {
        &self.classes
    }

    fn memory_budget(&self) -> &MemoryBudget {
        &self.budget
    }

    fn allocate_from(&mut self, index: usize) -> AllocResult<NonNull<u8>> {
        self.buckets[index].lock().allocate()
    }

    fn release_excess(&mut self) -> bool {
        self.trim_excess_memory()
    }

    fn owner_block_size(&self, p: NonNull<u8>, skip: Option<usize>) -> Option<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|&(index, _)| Some(index) != skip)
            .find_map(|(_, bucket)| {
                let bucket = bucket.lock();
                bucket.has_block(p).map(|_| bucket.block_size())
            })
            .or_else(|| self.large.lock().layout_of(p).map(|layout| layout.size()))
    }
}

// Thread safety is guaranteed by:
// - parking_lot::Mutex per bucket, held for the whole bucket operation
// - parking_lot::Mutex for the large object registry
// - MemoryBudget is atomic and shared by every bucket
