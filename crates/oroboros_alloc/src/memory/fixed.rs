//! # Fixed Allocator
//!
//! Serves blocks of one size from a growable array of [`Chunk`]s.
//!
//! Three cached chunk indices keep the common paths O(1):
//!
//! - `alloc_chunk` - where the next allocation is tried first
//! - `dealloc_chunk` - where the last deallocation landed, start of the
//!   vicinity search
//! - `empty_chunk` - the single chunk allowed to sit completely unused
//!
//! The caches are indices, not pointers. Growing the array cannot
//! invalidate them. Removing a chunk (always by swap-with-last-then-pop)
//! re-derives every cache that referred to the moved or removed chunk.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::budget::MemoryBudget;
use crate::error::{AllocError, AllocResult};
use crate::memory::chunk::{Chunk, MAX_BLOCKS_PER_CHUNK};
use crate::stats::BucketStats;

/// Fewest blocks a chunk is created with, however large the block.
pub const MIN_OBJECTS_PER_CHUNK: usize = 8;

/// Most blocks a chunk is created with, however small the block.
pub const MAX_OBJECTS_PER_CHUNK: usize = MAX_BLOCKS_PER_CHUNK;

/// Allocator for blocks of a single size.
///
/// # Thread Safety
///
/// Not thread-safe. Every operation takes `&mut self`, so callers sharing a
/// `FixedAllocator` across threads must hold a lock for the whole call
/// (including the vicinity search inside [`deallocate`](Self::deallocate)).
#[derive(Debug)]
pub struct FixedAllocator {
    /// Bytes per block.
    block_size: usize,
    /// Blocks per chunk, in `[8, 255]`.
    num_blocks: u8,
    /// Owned chunks.
    chunks: Vec<Chunk>,
    /// Chunk tried first by `allocate`.
    alloc_chunk: Option<usize>,
    /// Chunk of the most recent deallocation.
    dealloc_chunk: Option<usize>,
    /// The only completely free chunk, if any.
    empty_chunk: Option<usize>,
    /// Shared byte accounting for chunk buffers.
    budget: Arc<MemoryBudget>,
}

impl FixedAllocator {
    /// Creates an allocator with its own unlimited budget.
    ///
    /// `num_blocks = clamp(page_size / block_size, 8, 255)`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] if `block_size` is zero or
    /// larger than `page_size`.
    pub fn new(block_size: usize, page_size: usize) -> AllocResult<Self> {
        Self::with_budget(block_size, page_size, Arc::new(MemoryBudget::new(None)))
    }

    /// Creates an allocator that reserves chunk memory from `budget`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] if `block_size` is zero or
    /// larger than `page_size`.
    pub fn with_budget(
        block_size: usize,
        page_size: usize,
        budget: Arc<MemoryBudget>,
    ) -> AllocResult<Self> {
        if block_size == 0 {
            return Err(AllocError::InvalidConfig(
                "block size must be at least one byte".into(),
            ));
        }
        if page_size < block_size {
            return Err(AllocError::InvalidConfig(format!(
                "page size {page_size} is smaller than block size {block_size}"
            )));
        }

        let num_blocks =
            (page_size / block_size).clamp(MIN_OBJECTS_PER_CHUNK, MAX_OBJECTS_PER_CHUNK);
        let num_blocks = u8::try_from(num_blocks).map_err(|_| {
            AllocError::InvalidConfig(format!("{num_blocks} blocks do not fit a chunk"))
        })?;

        Ok(Self {
            block_size,
            num_blocks,
            chunks: Vec::new(),
            alloc_chunk: None,
            dealloc_chunk: None,
            empty_chunk: None,
            budget,
        })
    }

    /// Bytes per block.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks per chunk.
    #[inline]
    #[must_use]
    pub const fn num_blocks(&self) -> u8 {
        self.num_blocks
    }

    /// Bytes per chunk buffer.
    #[inline]
    #[must_use]
    pub const fn chunk_byte_len(&self) -> usize {
        self.block_size * self.num_blocks as usize
    }

    /// Number of chunks currently owned.
    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of blocks handed out and not yet returned.
    #[must_use]
    pub fn blocks_in_use(&self) -> usize {
        self.chunks
            .iter()
            .map(|chunk| usize::from(chunk.num_blocks() - chunk.blocks_available()))
            .sum()
    }

    /// Number of completely free chunks. Always 0 or 1.
    #[must_use]
    pub fn count_empty_chunks(&self) -> usize {
        self.chunks.iter().filter(|chunk| chunk.is_empty()).count()
    }

    /// The chunk at `index`, if it exists.
    #[inline]
    #[must_use]
    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    /// Snapshot of this bucket.
    #[must_use]
    pub fn stats(&self) -> BucketStats {
        BucketStats {
            block_size: self.block_size,
            num_blocks: self.num_blocks,
            chunk_count: self.chunks.len(),
            blocks_in_use: self.blocks_in_use(),
            has_empty_chunk: self.empty_chunk.is_some(),
        }
    }

    /// Returns true if the next [`allocate`](Self::allocate) has to create a
    /// chunk.
    #[must_use]
    pub fn needs_new_chunk(&self) -> bool {
        self.chunks.iter().all(Chunk::is_filled)
    }

    /// Hands out one block.
    ///
    /// Tries the cached allocation chunk, then the cached empty chunk, then
    /// the first chunk with room, and finally grows the chunk array.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::AllocationFailure`] if a new chunk is needed and
    /// the budget or the system allocator refuses it.
    pub fn allocate(&mut self) -> AllocResult<NonNull<u8>> {
        let index = match self.alloc_chunk {
            Some(index) if !self.chunks[index].is_filled() => {
                if self.empty_chunk == Some(index) {
                    self.empty_chunk = None;
                }
                index
            }
            _ => {
                if let Some(empty) = self.empty_chunk.take() {
                    empty
                } else if let Some(open) = self.chunks.iter().position(|chunk| !chunk.is_filled()) {
                    open
                } else {
                    self.make_new_chunk()?
                }
            }
        };

        self.alloc_chunk = Some(index);
        self.chunks[index]
            .allocate()
            .ok_or(AllocError::AllocationFailure {
                bytes: self.block_size,
            })
    }

    /// Returns the block at `p`.
    ///
    /// The owning chunk is looked up in order: `hint`, the cached
    /// deallocation chunk, the cached allocation chunk, then a vicinity
    /// search outward from the deallocation chunk.
    ///
    /// When the owner becomes completely free it is cached as the empty
    /// chunk. If another chunk is already cached empty, one of the two is
    /// released at once, so there is never more than one empty chunk.
    ///
    /// # Errors
    ///
    /// - [`AllocError::ForeignPointer`] if no chunk contains `p`
    /// - [`AllocError::MisalignedPointer`] or [`AllocError::DoubleFree`] as
    ///   reported by the owning chunk
    pub fn deallocate(&mut self, p: NonNull<u8>, hint: Option<usize>) -> AllocResult<()> {
        let owner = self
            .find_owner(p, hint)
            .ok_or(AllocError::ForeignPointer {
                addr: p.as_ptr() as usize,
            })?;

        self.dealloc_chunk = Some(owner);
        self.do_deallocate(p, owner)
    }

    /// Index of the chunk containing `p`, by linear scan.
    #[must_use]
    pub fn has_block(&self, p: NonNull<u8>) -> Option<usize> {
        self.chunks.iter().position(|chunk| chunk.has_block(p))
    }

    /// Releases the cached empty chunk.
    ///
    /// Returns true if a chunk was released.
    pub fn trim_empty_chunk(&mut self) -> bool {
        let Some(empty) = self.empty_chunk.take() else {
            return false;
        };

        let last = self.chunks.len() - 1;
        self.remove_chunk(empty);

        if self.chunks.is_empty() {
            self.alloc_chunk = None;
            self.dealloc_chunk = None;
        } else {
            let back = self.chunks.len() - 1;
            self.dealloc_chunk = Self::remap(self.dealloc_chunk, empty, last, 0);
            self.alloc_chunk = Self::remap(self.alloc_chunk, empty, last, back);
        }
        true
    }

    /// Releases the spare capacity of the chunk array.
    ///
    /// Returns true if there was spare capacity.
    pub fn trim_chunk_list(&mut self) -> bool {
        if self.chunks.len() == self.chunks.capacity() {
            return false;
        }
        self.chunks.shrink_to_fit();
        true
    }

    /// Validates the cached indices and every chunk's free list.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        let empty_count = self.count_empty_chunks();

        if self.chunks.is_empty() {
            return empty_count > 0
                || self.alloc_chunk.is_some()
                || self.dealloc_chunk.is_some()
                || self.empty_chunk.is_some();
        }

        let in_range = |cache: Option<usize>| cache.is_some_and(|index| index < self.chunks.len());
        if !in_range(self.alloc_chunk) || !in_range(self.dealloc_chunk) {
            return true;
        }

        match (empty_count, self.empty_chunk) {
            (0, None) => {}
            (1, Some(index)) => {
                if !self.chunks.get(index).is_some_and(Chunk::is_empty) {
                    return true;
                }
            }
            _ => return true,
        }

        self.chunks.iter().any(Chunk::is_corrupt)
    }

    fn find_owner(&self, p: NonNull<u8>, hint: Option<usize>) -> Option<usize> {
        let holds = |cache: Option<usize>| {
            cache.filter(|&index| self.chunks.get(index).is_some_and(|chunk| chunk.has_block(p)))
        };

        holds(hint)
            .or_else(|| holds(self.dealloc_chunk))
            .or_else(|| holds(self.alloc_chunk))
            .or_else(|| self.vicinity_find(p))
    }

    /// Searches outward from the deallocation chunk, alternating between the
    /// next lower and the next higher index.
    fn vicinity_find(&self, p: NonNull<u8>) -> Option<usize> {
        let len = self.chunks.len();
        if len == 0 {
            return None;
        }

        let start = self.dealloc_chunk.unwrap_or(0).min(len - 1);
        let mut lo = Some(start);
        let mut hi = (start + 1 < len).then_some(start + 1);

        loop {
            if let Some(index) = lo {
                if self.chunks[index].has_block(p) {
                    return Some(index);
                }
                lo = index.checked_sub(1);
                if lo.is_none() && hi.is_none() {
                    return None;
                }
            }
            if let Some(index) = hi {
                if self.chunks[index].has_block(p) {
                    return Some(index);
                }
                hi = (index + 1 < len).then_some(index + 1);
                if hi.is_none() && lo.is_none() {
                    return None;
                }
            }
        }
    }

    fn do_deallocate(&mut self, p: NonNull<u8>, owner: usize) -> AllocResult<()> {
        self.chunks[owner].deallocate(p)?;
        if !self.chunks[owner].is_empty() {
            return Ok(());
        }

        let Some(empty) = self.empty_chunk else {
            self.empty_chunk = Some(owner);
            return Ok(());
        };

        // Two empty chunks: release whichever keeps the array compact.
        let last = self.chunks.len() - 1;
        if last == owner {
            self.dealloc_chunk = Some(empty);
            self.remove_chunk(owner);
        } else {
            self.remove_chunk(empty);
        }

        let survivor = self.dealloc_chunk;
        let alloc_stale = self
            .alloc_chunk
            .map_or(true, |index| index == last || self.chunks[index].is_filled());
        if alloc_stale {
            self.alloc_chunk = survivor;
        }
        self.empty_chunk = survivor;
        Ok(())
    }

    fn make_new_chunk(&mut self) -> AllocResult<usize> {
        let bytes = self.chunk_byte_len();
        self.budget.try_reserve(bytes)?;

        if self.chunks.len() == self.chunks.capacity() {
            let additional = self.chunks.len().max(4);
            if self.chunks.try_reserve(additional).is_err() {
                self.budget.release(bytes);
                return Err(AllocError::AllocationFailure {
                    bytes: additional * std::mem::size_of::<Chunk>(),
                });
            }
        }

        let chunk = match Chunk::new(self.block_size, self.num_blocks) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.budget.release(bytes);
                return Err(err);
            }
        };
        self.chunks.push(chunk);

        let index = self.chunks.len() - 1;
        self.alloc_chunk = Some(index);
        self.dealloc_chunk = Some(0);
        tracing::debug!(
            "bucket {}B: new chunk #{} ({} blocks, {} bytes reserved overall)",
            self.block_size,
            index,
            self.num_blocks,
            self.budget.used()
        );
        Ok(index)
    }

    /// Swaps the chunk at `index` with the last one and drops it.
    fn remove_chunk(&mut self, index: usize) {
        let chunk = self.chunks.swap_remove(index);
        self.budget.release(chunk.byte_len());
        tracing::trace!(
            "bucket {}B: released chunk #{}, {} left",
            self.block_size,
            index,
            self.chunks.len()
        );
    }

    /// Re-derives a cache after the chunk at `removed` was swap-removed and
    /// the chunk at `last` took its place.
    const fn remap(
        cache: Option<usize>,
        removed: usize,
        last: usize,
        fallback: usize,
    ) -> Option<usize> {
        match cache {
            Some(index) if index == removed => Some(fallback),
            Some(index) if index == last => Some(removed),
            other => other,
        }
    }
}

impl Drop for FixedAllocator {
    fn drop(&mut self) {
        let outstanding = self.blocks_in_use();
        if outstanding > 0 {
            tracing::debug!(
                "bucket {}B dropped with {} blocks still allocated",
                self.block_size,
                outstanding
            );
        }
        self.budget
            .release(self.chunks.len() * self.chunk_byte_len());
    }
}
