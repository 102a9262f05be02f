//! Constant-time arena heap for hard real-time and safety-critical systems.
//!
//! This crate manages a single caller-provided contiguous memory region (the
//! "arena") and services allocation, deallocation, and in-place resize
//! requests in worst-case time bounded by a small constant, independent of
//! arena size, live allocation count, or fragmentation pattern. It requests
//! nothing from the operating system, performs no I/O, and hides no memory
//! overhead beyond one two-word header per allocation.
//!
//! # Design
//!
//! Free memory is indexed by power-of-two size classes. A word-sized bit
//! mask records which classes are non-empty, so finding the smallest
//! adequate class is two bit operations; the head of that class is
//! guaranteed large enough, so placement never traverses a list. Fragment
//! sizes are implicit in the address-order links, which keeps splitting and
//! coalescing pointer-only. The price is power-of-two internal
//! fragmentation: a worst-case request wastes up to half its fragment.
//!
//! # Usage
//!
//! ```rust
//! use rt_heap::{Heap, MIN_ARENA_SIZE};
//!
//! // The arena must be aligned to `rt_heap::ALIGNMENT`.
//! #[repr(C, align(16))]
//! struct Arena([u8; 4096]);
//!
//! let mut arena = Arena([0; 4096]);
//! assert!(arena.0.len() >= MIN_ARENA_SIZE);
//!
//! let mut handle = unsafe { Heap::init(arena.0.as_mut_ptr(), arena.0.len()) }.unwrap();
//! let heap = unsafe { handle.as_mut() };
//!
//! let ptr = heap.allocate(64).unwrap();
//! // Use the allocated memory...
//! unsafe {
//!     heap.deallocate(ptr.as_ptr());
//! }
//! assert_eq!(heap.diagnostics().allocated, 0);
//! ```
//!
//! For use as the global allocator, wrap the heap in [`LockedHeap`].
//!
//! # Performance Characteristics
//!
//! | Operation | Time | Notes |
//! |-----------|------|-------|
//! | `allocate` | O(1) | bit-mask bin lookup, at most one split |
//! | `deallocate` | O(1) | at most two neighbor merges |
//! | `reallocate` | O(1) + copy | copy only when the payload moves |
//!
//! # Thread Safety
//!
//! [`Heap`] is `Send` but not `Sync`: operations never block or suspend,
//! and callers provide mutual exclusion. [`LockedHeap`] is the ready-made
//! spin-locked wrapper.

#![cfg_attr(not(test), no_std)]

mod fragment;
mod heap;
mod locked;

pub use self::{
    fragment::ALIGNMENT,
    heap::{Diagnostics, Heap, InitError, MIN_ARENA_SIZE},
    locked::LockedHeap,
};
