//! # OROBOROS Small Object Heap
//!
//! Thread-safe front end over `oroboros_alloc` for engine objects that are
//! created and destroyed by the thousand every frame.
//!
//! ## Architecture Rules
//!
//! 1. **No global heap** - every construction site receives the heap it
//!    allocates from
//! 2. **One lock per size class** - allocations of different sizes never
//!    contend
//! 3. **Typed boxes** - a [`SmallBox`] frees with the layout it was built
//!    with, so it cannot be returned to the wrong bucket
//!
//! ## Example
//!
//! ```rust
//! use oroboros_alloc::AllocatorConfig;
//! use oroboros_smallobj::{SmallBox, SmallObjectHeap};
//!
//! let heap = SmallObjectHeap::new(&AllocatorConfig::default())?;
//! let mut hits = SmallBox::new_in(0u32, &heap)?;
//! *hits += 1;
//! assert_eq!(*hits, 1);
//! # Ok::<(), oroboros_alloc::AllocError>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod heap;
pub mod small_box;

pub use heap::SmallObjectHeap;
pub use small_box::{SmallBox, SmallObject};
