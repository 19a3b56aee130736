//! # Front End Routines
//!
//! Bucket construction, trim-and-retry and size mismatch diagnosis. The
//! single-threaded [`SmallObjectAllocator`](crate::SmallObjectAllocator)
//! and the locked heap in `oroboros_smallobj` both route through these, so
//! they report exhaustion and bad frees identically.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::budget::MemoryBudget;
use crate::config::AllocatorConfig;
use crate::error::{AllocError, AllocResult};
use crate::memory::fixed::FixedAllocator;
use crate::memory::size_class::SizeClasses;

/// A set of size-class buckets plus the large object path.
///
/// Implemented by every allocator front end. Methods take `&mut self` so a
/// single-threaded allocator can implement them directly; a locked heap
/// implements them on `&Heap`.
pub trait BucketSet {
    /// Size-to-bucket mapping.
    fn size_classes(&self) -> &SizeClasses;

    /// Shared accounting of chunk memory.
    fn memory_budget(&self) -> &MemoryBudget;

    /// Allocates one block from bucket `index`.
    ///
    /// # Errors
    ///
    /// Whatever [`FixedAllocator::allocate`] returns.
    fn allocate_from(&mut self, index: usize) -> AllocResult<NonNull<u8>>;

    /// Releases every bucket's spare memory. Returns true if anything was
    /// released.
    fn release_excess(&mut self) -> bool;

    /// Block size of whatever owns `p`: a bucket other than `skip`, or a
    /// large object.
    fn owner_block_size(&self, p: NonNull<u8>, skip: Option<usize>) -> Option<usize>;
}

/// Builds one bucket per size class of a validated `config`.
///
/// # Errors
///
/// - [`AllocError::AllocationFailure`] if the bucket array cannot be reserved
/// - [`AllocError::InvalidConfig`] if a bucket rejects its block size
pub fn build_buckets(
    config: &AllocatorConfig,
    classes: &SizeClasses,
    budget: &Arc<MemoryBudget>,
) -> AllocResult<Vec<FixedAllocator>> {
    let count = classes.bucket_count();
    let mut buckets = Vec::new();
    buckets
        .try_reserve_exact(count)
        .map_err(|_| AllocError::AllocationFailure {
            bytes: count.saturating_mul(size_of::<FixedAllocator>()),
        })?;
    for index in 0..count {
        buckets.push(FixedAllocator::with_budget(
            classes.block_size(index),
            config.page_size,
            Arc::clone(budget),
        )?);
    }
    Ok(buckets)
}

/// Allocates from bucket `index`; on exhaustion releases excess memory
/// everywhere and retries once.
///
/// # Errors
///
/// [`AllocError::OutOfMemory`] if the retry is exhausted too. Other bucket
/// errors pass through unchanged.
pub fn allocate_with_retry<B: BucketSet + ?Sized>(
    set: &mut B,
    index: usize,
    num_bytes: usize,
) -> AllocResult<NonNull<u8>> {
    match set.allocate_from(index) {
        Err(err) if err.is_memory_exhaustion() => {
            tracing::warn!(
                "bucket {}B exhausted ({}), trimming excess memory and retrying",
                set.size_classes().block_size(index),
                err
            );
            set.release_excess();
            set.allocate_from(index).map_err(|err| {
                if err.is_memory_exhaustion() {
                    tracing::error!(
                        "out of memory: {} byte request, {} bytes held in chunks",
                        num_bytes,
                        set.memory_budget().used()
                    );
                    AllocError::OutOfMemory { bytes: num_bytes }
                } else {
                    err
                }
            })
        }
        other => other,
    }
}

/// Explains why the size-selected owner rejected `p`.
///
/// Another owner means the caller passed the wrong size; no owner at all
/// means the pointer is foreign.
pub fn diagnose_rejected<B: BucketSet + ?Sized>(
    set: &B,
    p: NonNull<u8>,
    num_bytes: usize,
    skip: Option<usize>,
) -> AllocError {
    let addr = p.as_ptr() as usize;
    match set.owner_block_size(p, skip) {
        Some(block_size) => {
            tracing::warn!(
                "pointer {:#x} freed with size {} but owned by the {}B class",
                addr,
                num_bytes,
                block_size
            );
            AllocError::SizeMismatch {
                addr,
                size: num_bytes,
                block_size,
            }
        }
        None => AllocError::ForeignPointer { addr },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two buckets over a tiny budget, no large objects.
    struct Pair {
        classes: SizeClasses,
        budget: Arc<MemoryBudget>,
        buckets: Vec<FixedAllocator>,
        trims: usize,
    }

    impl Pair {
        fn new(limit: Option<usize>) -> Self {
            let config = AllocatorConfig {
                page_size: 64,
                max_object_size: 16,
                object_align_size: 8,
                memory_limit: limit,
            };
            let classes = SizeClasses::new(&config);
            let budget = Arc::new(MemoryBudget::new(limit));
            let buckets = build_buckets(&config, &classes, &budget).unwrap();
            Self {
                classes,
                budget,
                buckets,
                trims: 0,
            }
        }
    }

    impl BucketSet for Pair {
        fn size_classes(&self) -> &SizeClasses {
            &self.classes
        }

        fn memory_budget(&self) -> &MemoryBudget {
            &self.budget
        }

        fn allocate_from(&mut self, index: usize) -> AllocResult<NonNull<u8>> {
            self.buckets[index].allocate()
        }

        fn release_excess(&mut self) -> bool {
            self.trims += 1;
            self.buckets
                .iter_mut()
                .fold(false, |found, bucket| bucket.trim_empty_chunk() | found)
        }

        fn owner_block_size(&self, p: NonNull<u8>, skip: Option<usize>) -> Option<usize> {
            self.buckets
                .iter()
                .enumerate()
                .filter(|&(index, _)| Some(index) != skip)
                .find(|(_, bucket)| bucket.has_block(p).is_some())
                .map(|(_, bucket)| bucket.block_size())
        }
    }

    #[test]
    fn test_build_buckets_one_per_class() {
        let pair = Pair::new(None);
        let sizes: Vec<usize> = pair.buckets.iter().map(FixedAllocator::block_size).collect();
        assert_eq!(sizes, vec![8, 16]);
    }

    #[test]
    fn test_retry_recovers_after_trim() {
        // The 128-byte chunk of the 16-byte class fits only once the
        // 64-byte chunk of the 8-byte class is gone.
        let mut pair = Pair::new(Some(128));
        let p = pair.buckets[0].allocate().unwrap();
        pair.buckets[0].deallocate(p, None).unwrap();
        assert_eq!(pair.budget.used(), 64);

        let q = allocate_with_retry(&mut pair, 1, 16).unwrap();
        assert_eq!(pair.trims, 1);
        assert_eq!(pair.buckets[0].chunk_count(), 0);
        assert_eq!(pair.buckets[1].has_block(q), Some(0));
    }

    #[test]
    fn test_retry_gives_up_once() {
        let mut pair = Pair::new(Some(128));
        let _held = pair.buckets[0].allocate().unwrap();

        assert_eq!(
            allocate_with_retry(&mut pair, 1, 12),
            Err(AllocError::OutOfMemory { bytes: 12 })
        );
        assert_eq!(pair.trims, 1);
    }

    #[test]
    fn test_diagnose_rejected() {
        let mut pair = Pair::new(None);
        let p = pair.buckets[0].allocate().unwrap();
        let addr = p.as_ptr() as usize;

        assert_eq!(
            diagnose_rejected(&pair, p, 16, Some(1)),
            AllocError::SizeMismatch {
                addr,
                size: 16,
                block_size: 8,
            }
        );
        assert_eq!(
            diagnose_rejected(&pair, p, 8, Some(0)),
            AllocError::ForeignPointer { addr }
        );
    }
}
