//! # System Path
//!
//! Large and over-aligned objects bypass the buckets and go straight to the
//! global allocator. Every live large object is registered with its layout,
//! so freeing one checks ownership and size before memory is returned.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

use crate::error::{AllocError, AllocResult};

/// Alignment of large objects requested by byte count alone.
pub const LARGE_OBJECT_ALIGN: usize = 16;

/// Layout of a large object requested by byte count.
///
/// # Errors
///
/// Returns [`AllocError::AllocationFailure`] if `num_bytes` overflows when
/// rounded up to [`LARGE_OBJECT_ALIGN`].
pub fn large_layout(num_bytes: usize) -> AllocResult<Layout> {
    Layout::from_size_align(num_bytes.max(1), LARGE_OBJECT_ALIGN)
        .map_err(|_| AllocError::AllocationFailure { bytes: num_bytes })
}

/// Zero-sized layouts are served as one byte.
fn normalize(layout: Layout) -> AllocResult<Layout> {
    Layout::from_size_align(layout.size().max(1), layout.align()).map_err(|_| {
        AllocError::AllocationFailure {
            bytes: layout.size(),
        }
    })
}

/// Registry of live objects served by the global allocator.
///
/// # Thread Safety
///
/// Not thread-safe; wrap in a lock to share.
#[derive(Debug, Default)]
pub struct LargeObjects {
    /// Address -> layout the object was allocated with.
    live: HashMap<usize, Layout>,
    /// Sum of live object sizes.
    bytes: usize,
}

impl LargeObjects {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live large objects.
    #[inline]
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Bytes in live large objects.
    #[inline]
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    /// Layout of the live object at `p`, if `p` is one.
    #[must_use]
    pub fn layout_of(&self, p: NonNull<u8>) -> Option<Layout> {
        self.live.get(&(p.as_ptr() as usize)).copied()
    }

    /// Allocates from the global allocator and registers the object.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::AllocationFailure`] if the global allocator
    /// returns null.
    pub fn allocate(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        let layout = normalize(layout)?;
        self.live.try_reserve(1).map_err(|_| AllocError::AllocationFailure {
            bytes: layout.size(),
        })?;

        // SAFETY: `normalize` guarantees a non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let p = NonNull::new(raw).ok_or(AllocError::AllocationFailure {
            bytes: layout.size(),
        })?;

        self.live.insert(p.as_ptr() as usize, layout);
        self.bytes += layout.size();
        Ok(p)
    }

    /// Unregisters the object at `p` and returns it to the global allocator.
    ///
    /// # Errors
    ///
    /// - [`AllocError::ForeignPointer`] if `p` is not a live large object
    /// - [`AllocError::SizeMismatch`] if `layout` differs from the layout the
    ///   object was allocated with; the object stays live
    pub fn deallocate(&mut self, p: NonNull<u8>, layout: Layout) -> AllocResult<()> {
        let addr = p.as_ptr() as usize;
        let layout = normalize(layout)?;
        let recorded = self
            .live
            .get(&addr)
            .copied()
            .ok_or(AllocError::ForeignPointer { addr })?;
        if recorded != layout {
            return Err(AllocError::SizeMismatch {
                addr,
                size: layout.size(),
                block_size: recorded.size(),
            });
        }

        self.release(addr, recorded);
        Ok(())
    }

    /// Frees the object at `p` using its recorded layout.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::ForeignPointer`] if `p` is not a live large
    /// object.
    pub fn deallocate_unsized(&mut self, p: NonNull<u8>) -> AllocResult<()> {
        let addr = p.as_ptr() as usize;
        let layout = self
            .live
            .get(&addr)
            .copied()
            .ok_or(AllocError::ForeignPointer { addr })?;
        self.release(addr, layout);
        Ok(())
    }

    fn release(&mut self, addr: usize, layout: Layout) {
        self.live.remove(&addr);
        self.bytes -= layout.size();
        // SAFETY: `addr` was registered by `allocate` with exactly `layout`
        // and has just been unregistered, so it is freed once.
        unsafe { alloc::dealloc(addr as *mut u8, layout) }
    }
}

impl Drop for LargeObjects {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            tracing::debug!(
                "releasing {} large objects ({} bytes) still live at shutdown",
                self.live.len(),
                self.bytes
            );
        }
        for (addr, layout) in self.live.drain() {
            // SAFETY: every registered entry is a live allocation with its layout.
            unsafe { alloc::dealloc(addr as *mut u8, layout) }
        }
    }
}
