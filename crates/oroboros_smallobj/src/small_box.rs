//! # Small Box
//!
//! Owning pointer to a value stored in a [`SmallObjectHeap`] block.
//!
//! ## Safety Note
//!
//! This module writes values into raw heap blocks and therefore requires
//! unsafe code. The block is obtained with `Layout::new::<T>()` and freed
//! with the same layout, so a box can never be returned to the wrong size
//! class. The value is initialized before the box exists and dropped
//! exactly once. The heap's raw free functions are `unsafe`, so safe code
//! cannot release a block while its box is alive.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use oroboros_alloc::AllocResult;

use crate::heap::SmallObjectHeap;

/// A `T` living in a small object heap block.
///
/// Dropping the box drops the value and returns the block to its heap.
/// The box borrows the heap, so the heap outlives every box.
pub struct SmallBox<'h, T> {
    ptr: NonNull<T>,
    heap: &'h SmallObjectHeap,
    _owns: PhantomData<T>,
}

// SAFETY: the box owns its `T` exclusively; the heap reference is `Sync`.
unsafe impl<T: Send> Send for SmallBox<'_, T> {}
// SAFETY: shared access to the box only hands out `&T`.
unsafe impl<T: Sync> Sync for SmallBox<'_, T> {}

impl<'h, T> SmallBox<'h, T> {
    /// Moves `value` into a block from `heap`.
    ///
    /// # Errors
    ///
    /// Returns the heap's allocation error; `value` is dropped.
    pub fn new_in(value: T, heap: &'h SmallObjectHeap) -> AllocResult<Self> {
        let ptr = heap.allocate_layout(Layout::new::<T>())?.cast::<T>();
        // SAFETY: the block is at least `size_of::<T>()` bytes, aligned for
        // `T` and not aliased.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            heap,
            _owns: PhantomData,
        })
    }

    /// The heap this box allocates from.
    #[inline]
    #[must_use]
    pub fn heap(this: &Self) -> &'h SmallObjectHeap {
        this.heap
    }

    /// Address of the value's block.
    #[inline]
    #[must_use]
    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }

    /// Moves the value out and frees the block.
    #[must_use]
    pub fn into_inner(this: Self) -> T {
        let this = std::mem::ManuallyDrop::new(this);
        // SAFETY: the value is initialized and, with `Drop` suppressed,
        // read exactly once.
        let value = unsafe { this.ptr.as_ptr().read() };
        this.release();
        value
    }

    /// Returns the block to the heap without touching the value.
    fn release(&self) {
        let layout = Layout::new::<T>();
        // SAFETY: the box owns the block, the value is already gone and the
        // box is never used again.
        let result = unsafe { self.heap.deallocate_layout(self.ptr.cast::<u8>(), layout) };
        if let Err(err) = result {
            tracing::error!("small box block could not be freed: {}", err);
        }
    }
}

impl<T> Deref for SmallBox<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: initialized in `new_in`, valid until drop.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for SmallBox<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in `deref`, and `&mut self` makes the access unique.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for SmallBox<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the value is initialized and dropped only here.
        unsafe { std::ptr::drop_in_place(self.ptr.as_ptr()) };
        self.release();
    }
}

impl<T: fmt::Debug> fmt::Debug for SmallBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display> fmt::Display for SmallBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T: PartialEq> PartialEq for SmallBox<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl<T: Eq> Eq for SmallBox<'_, T> {}

/// Types that are built on the small object heap.
///
/// ```rust
/// use oroboros_alloc::AllocatorConfig;
/// use oroboros_smallobj::{SmallObject, SmallObjectHeap};
///
/// struct Spark {
///     x: f32,
///     y: f32,
///     ttl: u16,
/// }
///
/// impl SmallObject for Spark {}
///
/// let heap = SmallObjectHeap::new(&AllocatorConfig::particles())?;
/// let spark = Spark { x: 1.0, y: 2.0, ttl: 30 }.into_small_box(&heap)?;
/// assert_eq!(spark.ttl, 30);
/// # Ok::<(), oroboros_alloc::AllocError>(())
/// ```
pub trait SmallObject: Sized {
    /// Moves `self` into a block from `heap`.
    ///
    /// # Errors
    ///
    /// Returns the heap's allocation error.
    fn into_small_box(self, heap: &SmallObjectHeap) -> AllocResult<SmallBox<'_, Self>> {
        SmallBox::new_in(self, heap)
    }
}
