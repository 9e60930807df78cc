//! An explicit free list memory allocator built on boundary tags. Memory is
//! obtained from the OS in page-aligned chunks, carved into blocks framed by
//! matching header and footer tag words, recycled through a doubly linked
//! free list that lives inside the free blocks themselves, and handed back
//! to the OS as soon as an entire chunk falls idle (one chunk is always kept
//! warm).
//!
//! ```text
//!              first fit ----------------------------------+
//!                  |                                        |
//!                  v                                        v
//! +-------+--------------+-------+     +-------+-------+--------------+-------+
//! | chunk | Free         | Block | --- | chunk | Block | Free         | Block |
//! +-------+--------------+-------+     +-------+-------+--------------+-------+
//!              ^                                             ^
//!              |                                             |
//!              +------------------ free list ----------------+
//! ```
//!
//! The raw engine is [`ChunkAllocator`], a single-mutator instance:
//!
//! ```rust
//! use challoc::ChunkAllocator;
//!
//! let mut allocator = ChunkAllocator::new();
//!
//! unsafe {
//!     let address = allocator.alloc(100);
//!     assert!(!address.is_null());
//!     assert_eq!(address as usize % 16, 0);
//!     allocator.dealloc(address);
//! }
//! ```
//!
//! For a thread safe handle, or to serve the whole program through
//! `#[global_allocator]`, use [`Challoc`].

use std::ptr::NonNull;

mod align;
mod allocator;
mod block;
mod chunk;
mod freelist;
mod platform;
mod tag;

/// Non-null pointer to `T`. We use this in most places instead of `*mut T`
/// so the compiler yells at us whenever a code path forgets the `None` case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::{Challoc, ChunkAllocator};
