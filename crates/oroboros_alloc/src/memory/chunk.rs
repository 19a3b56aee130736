//! # Chunk
//!
//! A single slab of equally sized blocks.
//!
//! ## Safety Note
//!
//! This module owns raw memory and therefore requires unsafe code.
//! Every pointer handed out or read here is derived from the chunk's own
//! base pointer, and every offset is bounds-checked against `num_blocks`
//! before it is applied. No reference into the buffer is ever created.
//!
//! ## Free List Encoding
//!
//! ```text
//!   block:   [0]      [1]      [2]      [3]
//!   byte 0:  ─> 3     ─> 2     ─> 4     ─> 1       head = 0, available = 4
//! ```
//!
//! The first byte of every free block holds the index of the next free
//! block, which caps a chunk at 255 blocks. A 256-bit mask beside the
//! buffer mirrors which blocks are on the list, so a double free is caught
//! in O(1) in every build.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{AllocError, AllocResult};

/// Alignment of every chunk buffer.
///
/// Blocks start at multiples of the block size from this base, so a block
/// is aligned to `min(CHUNK_ALIGN, largest power of two dividing block_size)`.
pub const CHUNK_ALIGN: usize = 16;

/// Maximum number of blocks per chunk (the free-list link is one byte).
pub const MAX_BLOCKS_PER_CHUNK: usize = u8::MAX as usize;

/// Fill pattern for the payload of free blocks in debug builds.
#[cfg(debug_assertions)]
pub const POISON: u8 = 0xDD;

/// A contiguous buffer of `num_blocks` blocks of `block_size` bytes.
///
/// # Thread Safety
///
/// Not thread-safe. The owning allocator serializes access.
#[derive(Debug)]
pub struct Chunk {
    /// Start of the owned buffer.
    data: NonNull<u8>,
    /// Layout the buffer was allocated with.
    layout: Layout,
    /// Bytes per block.
    block_size: usize,
    /// Blocks in the buffer.
    num_blocks: u8,
    /// Head of the intrusive free list.
    first_available_block: u8,
    /// Length of the free list.
    blocks_available: u8,
    /// Bit `i` is set while block `i` is on the free list.
    free_mask: [u64; 4],
}

// SAFETY: the buffer is owned exclusively by this chunk and every mutation
// goes through `&mut self`.
unsafe impl Send for Chunk {}

impl Chunk {
    /// Allocates a buffer and threads every block onto the free list.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidConfig`] if `block_size` or `num_blocks` is zero
    /// - [`AllocError::AllocationFailure`] if the system allocator refuses
    pub fn new(block_size: usize, num_blocks: u8) -> AllocResult<Self> {
        if block_size == 0 {
            return Err(AllocError::InvalidConfig(
                "block size must be at least one byte".into(),
            ));
        }
        if num_blocks == 0 {
            return Err(AllocError::InvalidConfig(
                "a chunk needs at least one block".into(),
            ));
        }

        let len = block_size
            .checked_mul(usize::from(num_blocks))
            .ok_or(AllocError::AllocationFailure { bytes: usize::MAX })?;
        let layout = Layout::from_size_align(len, CHUNK_ALIGN)
            .map_err(|_| AllocError::AllocationFailure { bytes: len })?;

        // SAFETY: `len >= 1` because both factors are non-zero.
        let raw = unsafe { alloc::alloc(layout) };
        let data = NonNull::new(raw).ok_or(AllocError::AllocationFailure { bytes: len })?;

        let mut chunk = Self {
            data,
            layout,
            block_size,
            num_blocks,
            first_available_block: 0,
            blocks_available: num_blocks,
            free_mask: [0; 4],
        };
        for index in 0..num_blocks {
            // The last link points one past the end and is never followed.
            chunk.write_link(index, index.wrapping_add(1));
            chunk.set_free(index, true);
            #[cfg(debug_assertions)]
            chunk.poison(index);
        }
        Ok(chunk)
    }

    /// Bytes per block.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks in this chunk.
    #[inline]
    #[must_use]
    pub const fn num_blocks(&self) -> u8 {
        self.num_blocks
    }

    /// Index of the free-list head. Meaningful only while blocks are available.
    #[inline]
    #[must_use]
    pub const fn first_available_block(&self) -> u8 {
        self.first_available_block
    }

    /// Number of free blocks.
    #[inline]
    #[must_use]
    pub const fn blocks_available(&self) -> u8 {
        self.blocks_available
    }

    /// Total buffer length in bytes.
    #[inline]
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.layout.size()
    }

    /// True when no block is free.
    #[inline]
    #[must_use]
    pub const fn is_filled(&self) -> bool {
        self.blocks_available == 0
    }

    /// True when every block is free.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.blocks_available == self.num_blocks
    }

    /// Pops the free-list head. O(1).
    ///
    /// Returns `None` if the chunk is filled.
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        if self.is_filled() {
            return None;
        }

        let index = self.first_available_block;
        #[cfg(debug_assertions)]
        self.check_poison(index);

        self.first_available_block = self.read_link(index);
        self.blocks_available -= 1;
        self.set_free(index, false);
        NonNull::new(self.block_ptr(index))
    }

    /// Pushes the block at `p` onto the free list. O(1).
    ///
    /// # Errors
    ///
    /// - [`AllocError::ForeignPointer`] if `p` is outside this chunk
    /// - [`AllocError::MisalignedPointer`] if `p` is not on a block boundary
    /// - [`AllocError::DoubleFree`] if the block is already free
    pub fn deallocate(&mut self, p: NonNull<u8>) -> AllocResult<()> {
        let index = self.block_index(p)?;
        if self.is_free(index) {
            return Err(AllocError::DoubleFree {
                addr: p.as_ptr() as usize,
            });
        }
        #[cfg(debug_assertions)]
        self.poison(index);

        self.write_link(index, self.first_available_block);
        self.first_available_block = index;
        self.blocks_available += 1;
        self.set_free(index, true);
        Ok(())
    }

    /// True if `data <= p < data + byte_len`.
    #[inline]
    #[must_use]
    pub fn has_block(&self, p: NonNull<u8>) -> bool {
        let addr = p.as_ptr() as usize;
        let base = self.data.as_ptr() as usize;
        addr >= base && addr - base < self.byte_len()
    }

    /// True if `p` is a block of this chunk that sits on the free list.
    #[must_use]
    pub fn is_block_available(&self, p: NonNull<u8>) -> bool {
        self.block_index(p).is_ok_and(|index| self.is_free(index))
    }

    /// Validates the free list.
    ///
    /// Returns true if the available count exceeds the block count, a link
    /// points outside the chunk, a block appears twice on the list, or the
    /// list disagrees with the free mask.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        if self.blocks_available > self.num_blocks {
            return true;
        }

        let mut seen = [0u64; 4];
        let mut index = self.first_available_block;
        for visited in 0..self.blocks_available {
            if index >= self.num_blocks {
                return true;
            }
            let word = usize::from(index / 64);
            let bit = 1u64 << (index % 64);
            if seen[word] & bit != 0 {
                return true;
            }
            seen[word] |= bit;
            if visited + 1 < self.blocks_available {
                index = self.read_link(index);
            }
        }
        seen != self.free_mask
    }

    /// Maps a pointer to its block index.
    fn block_index(&self, p: NonNull<u8>) -> AllocResult<u8> {
        let addr = p.as_ptr() as usize;
        if !self.has_block(p) {
            return Err(AllocError::ForeignPointer { addr });
        }
        let offset = addr - self.data.as_ptr() as usize;
        if offset % self.block_size != 0 {
            return Err(AllocError::MisalignedPointer { addr });
        }
        u8::try_from(offset / self.block_size).map_err(|_| AllocError::ForeignPointer { addr })
    }

    #[inline]
    fn is_free(&self, index: u8) -> bool {
        self.free_mask[usize::from(index / 64)] & (1u64 << (index % 64)) != 0
    }

    #[inline]
    fn set_free(&mut self, index: u8, free: bool) {
        let word = &mut self.free_mask[usize::from(index / 64)];
        let bit = 1u64 << (index % 64);
        if free {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }

    #[inline]
    fn block_ptr(&self, index: u8) -> *mut u8 {
        debug_assert!(index < self.num_blocks);
        // SAFETY: index < num_blocks, so the offset lies inside the buffer.
        unsafe { self.data.as_ptr().add(usize::from(index) * self.block_size) }
    }

    #[inline]
    fn read_link(&self, index: u8) -> u8 {
        // SAFETY: in-bounds; byte 0 of a free block was written by
        // `new` or `deallocate`.
        unsafe { self.block_ptr(index).read() }
    }

    #[inline]
    fn write_link(&mut self, index: u8, next: u8) {
        // SAFETY: in-bounds and the block is not handed out.
        unsafe { self.block_ptr(index).write(next) }
    }

    #[cfg(debug_assertions)]
    fn poison(&mut self, index: u8) {
        // SAFETY: bytes 1..block_size of an in-bounds block.
        unsafe {
            std::ptr::write_bytes(self.block_ptr(index).add(1), POISON, self.block_size - 1);
        }
    }

    #[cfg(debug_assertions)]
    fn check_poison(&self, index: u8) {
        let block = self.block_ptr(index);
        let intact = (1..self.block_size).all(|offset| {
            // SAFETY: bytes 1..block_size of a free block, initialized by `poison`.
            let byte = unsafe { block.add(offset).read() };
            byte == POISON
        });
        if !intact {
            tracing::warn!(
                "write after free detected in block {} of chunk {:p} (block size {})",
                index,
                self.data,
                self.block_size
            );
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: `data` was returned by `alloc::alloc` with `layout`.
        unsafe { alloc::dealloc(self.data.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_chunk_init_threads_free_list() {
        let chunk = Chunk::new(8, 10).unwrap();
        assert_eq!(chunk.blocks_available(), 10);
        assert_eq!(chunk.first_available_block(), 0);
        assert_eq!(chunk.byte_len(), 80);
        assert!(chunk.is_empty());
        assert!(!chunk.is_corrupt());
        for index in 0..10u8 {
            assert_eq!(chunk.read_link(index), index + 1);
        }
    }

    #[test]
    fn test_chunk_rejects_zero_sizes() {
        assert!(matches!(Chunk::new(0, 8), Err(AllocError::InvalidConfig(_))));
        assert!(matches!(Chunk::new(8, 0), Err(AllocError::InvalidConfig(_))));
    }

    #[test]
    fn test_chunk_allocates_in_order_until_filled() {
        let mut chunk = Chunk::new(12, 255).unwrap();
        let base = chunk.data.as_ptr() as usize;

        let mut seen = HashSet::new();
        for expected in 0..255usize {
            let p = chunk.allocate().unwrap();
            assert_eq!(p.as_ptr() as usize, base + expected * 12);
            assert!(seen.insert(p.as_ptr() as usize));
        }
        assert!(chunk.is_filled());
        assert!(chunk.allocate().is_none());
        assert!(!chunk.is_corrupt());
    }

    #[test]
    fn test_chunk_round_trip_restores_state() {
        let mut chunk = Chunk::new(16, 8).unwrap();
        let _a = chunk.allocate().unwrap();
        let before = chunk.blocks_available();

        let b = chunk.allocate().unwrap();
        assert_eq!(chunk.blocks_available(), before - 1);
        chunk.deallocate(b).unwrap();

        assert_eq!(chunk.blocks_available(), before);
        assert!(chunk.first_available_block() < chunk.num_blocks());
        assert!(chunk.is_block_available(b));
        assert!(!chunk.is_corrupt());
    }

    #[test]
    fn test_chunk_reuses_last_freed_block_first() {
        let mut chunk = Chunk::new(4, 8).unwrap();
        let a = chunk.allocate().unwrap();
        let b = chunk.allocate().unwrap();
        let c = chunk.allocate().unwrap();

        chunk.deallocate(a).unwrap();
        chunk.deallocate(c).unwrap();

        assert_eq!(chunk.allocate(), Some(c));
        assert_eq!(chunk.allocate(), Some(a));
        assert!(!chunk.is_block_available(b));
    }

    #[test]
    fn test_chunk_has_block_bounds() {
        let mut chunk = Chunk::new(8, 8).unwrap();
        let first = chunk.allocate().unwrap();
        assert!(chunk.has_block(first));

        let base = chunk.data.as_ptr() as usize;
        let last_byte = NonNull::new((base + 63) as *mut u8).unwrap();
        let past_end = NonNull::new((base + 64) as *mut u8).unwrap();
        assert!(chunk.has_block(last_byte));
        assert!(!chunk.has_block(past_end));
    }

    #[test]
    fn test_chunk_rejects_bad_pointers() {
        let mut chunk = Chunk::new(8, 8).unwrap();
        let p = chunk.allocate().unwrap();
        let base = p.as_ptr() as usize;

        let inside = NonNull::new((base + 3) as *mut u8).unwrap();
        assert_eq!(
            chunk.deallocate(inside),
            Err(AllocError::MisalignedPointer { addr: base + 3 })
        );

        let outside = NonNull::new((base + 4096) as *mut u8).unwrap();
        assert_eq!(
            chunk.deallocate(outside),
            Err(AllocError::ForeignPointer { addr: base + 4096 })
        );
        assert_eq!(chunk.blocks_available(), 7);
    }

    #[test]
    fn test_chunk_double_free_on_empty_chunk() {
        let mut chunk = Chunk::new(8, 8).unwrap();
        let p = chunk.allocate().unwrap();
        chunk.deallocate(p).unwrap();
        assert_eq!(
            chunk.deallocate(p),
            Err(AllocError::DoubleFree { addr: p.as_ptr() as usize })
        );
        assert!(!chunk.is_corrupt());
    }

    #[test]
    fn test_chunk_double_free_detected() {
        let mut chunk = Chunk::new(8, 8).unwrap();
        let p = chunk.allocate().unwrap();
        let q = chunk.allocate().unwrap();
        chunk.deallocate(p).unwrap();
        assert!(matches!(chunk.deallocate(p), Err(AllocError::DoubleFree { .. })));
        assert_eq!(chunk.blocks_available(), 7);
        assert!(!chunk.is_corrupt());

        // The block comes back once, never twice.
        let x = chunk.allocate().unwrap();
        let y = chunk.allocate().unwrap();
        assert_eq!(x, p);
        assert_ne!(x, y);
        assert_ne!(y, q);
    }

    #[test]
    fn test_chunk_double_free_after_reuse_cycle() {
        let mut chunk = Chunk::new(16, 255).unwrap();
        let held: Vec<_> = (0..200).map(|_| chunk.allocate().unwrap()).collect();
        for &p in held.iter().step_by(2) {
            chunk.deallocate(p).unwrap();
        }
        for &p in held.iter().step_by(2) {
            assert!(matches!(chunk.deallocate(p), Err(AllocError::DoubleFree { .. })));
        }
        for &p in held.iter().skip(1).step_by(2) {
            chunk.deallocate(p).unwrap();
        }
        assert!(chunk.is_empty());
        assert!(!chunk.is_corrupt());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_chunk_poisons_freed_blocks() {
        let mut chunk = Chunk::new(8, 8).unwrap();
        let p = chunk.allocate().unwrap();
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAB, 8) };
        chunk.deallocate(p).unwrap();

        for offset in 1..8 {
            assert_eq!(unsafe { p.as_ptr().add(offset).read() }, POISON);
        }
    }

    #[test]
    fn test_chunk_detects_corrupt_free_list() {
        let mut chunk = Chunk::new(8, 8).unwrap();
        // Make block 0 link back to itself: a cycle.
        chunk.write_link(0, 0);
        assert!(chunk.is_corrupt());

        chunk.write_link(0, 200);
        assert!(chunk.is_corrupt());

        chunk.write_link(0, 1);
        assert!(!chunk.is_corrupt());

        // A list that skips a block the mask still marks free.
        chunk.write_link(0, 2);
        chunk.blocks_available = 7;
        assert!(chunk.is_corrupt());
    }

    #[test]
    fn test_chunk_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Chunk>();
    }
}
