//! Spin-locked [`GlobalAlloc`] adapter.
//!
//! The engine itself is single-threaded by design; this module provides the
//! caller-side critical section for programs that want the heap as their
//! global allocator:
//!
//! ```rust,ignore
//! use rt_heap::LockedHeap;
//!
//! #[global_allocator]
//! static HEAP: LockedHeap = LockedHeap::empty();
//!
//! fn main() {
//!     unsafe {
//!         HEAP.init(arena_base, arena_size).expect("arena unusable");
//!     }
//!     // Allocations beyond this point are served from the arena.
//! }
//! ```

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use spin::mutex::SpinMutex;

use crate::{
    fragment::ALIGNMENT,
    heap::{Diagnostics, Heap, InitError},
};

/// A heap handle behind a spin lock, usable as `#[global_allocator]`.
///
/// Starts empty; every request fails with null until [`LockedHeap::init`]
/// attaches an arena. The lock is held only for the duration of a single
/// engine operation, all of which are constant-time.
///
/// Alignment requests above [`ALIGNMENT`] are not supported and yield null.
pub struct LockedHeap {
    heap: SpinMutex<Option<NonNull<Heap>>>,
}

// The handle is only ever dereferenced under the lock.
unsafe impl Send for LockedHeap {}
unsafe impl Sync for LockedHeap {}

impl LockedHeap {
    /// Creates a detached adapter with no arena behind it.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            heap: SpinMutex::new(None),
        }
    }

    /// Initializes the heap over the given arena and attaches it.
    ///
    /// # Errors
    ///
    /// Propagates [`InitError`] from [`Heap::init`]; the adapter stays
    /// detached in that case.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::init`]. Additionally, the arena must stay
    /// valid for as long as this adapter can receive requests.
    pub unsafe fn init(&self, base: *mut u8, size: usize) -> Result<(), InitError> {
        let handle = unsafe { Heap::init(base, size)? };
        *self.heap.lock() = Some(handle);
        Ok(())
    }

    /// Snapshot of the attached heap's counters, or `None` while detached.
    #[must_use]
    pub fn diagnostics(&self) -> Option<Diagnostics> {
        let guard = self.heap.lock();
        let handle = (*guard)?;
        Some(unsafe { handle.as_ref() }.diagnostics())
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        let mut guard = self.heap.lock();
        let Some(handle) = guard.as_mut() else {
            return ptr::null_mut();
        };
        unsafe { handle.as_mut() }
            .allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut guard = self.heap.lock();
        if let Some(handle) = guard.as_mut() {
            unsafe { handle.as_mut().deallocate(ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        let mut guard = self.heap.lock();
        let Some(handle) = guard.as_mut() else {
            return ptr::null_mut();
        };
        unsafe { handle.as_mut().reallocate(ptr, new_size) }
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }
}
