//! The constant-time heap engine.
//!
//! A [`Heap`] lives at the base of a caller-provided arena and manages the
//! rest of the arena as a flat sequence of fragments. Free fragments are
//! indexed by power-of-two size classes ("bins"): a word-sized bit mask
//! records which bins are non-empty, so placement reduces to two bit
//! operations and never walks a list.
//!
//! # Algorithm
//!
//! - **Allocation**: round the request up to a power of two (header
//!   included), mask away the bins that are too small, and take the head of
//!   the lowest remaining non-empty bin. Every member of that bin is
//!   guaranteed large enough, so the head fits without traversal. Oversized
//!   fragments are split and the tail is re-binned.
//! - **Deallocation**: clear the used flag and eagerly coalesce with the at
//!   most two address-order neighbors.
//! - **Reallocation**: shrink in place, expand into a free successor,
//!   expand backward into a free predecessor (moving the payload), or fall
//!   back to allocate-copy-free, in that order.
//!
//! All three run in bounded constant time regardless of arena size, live
//! allocation count, or fragmentation.
//!
//! # Thread Safety
//!
//! The engine is `Send` but not `Sync`; callers provide serialization (see
//! [`LockedHeap`](crate::LockedHeap) for a ready-made wrapper).

use core::{
    cmp,
    ptr::{self, NonNull},
};

use log::{debug, trace};
use snafu::{Location, Snafu, ensure};

use crate::fragment::{ALIGNMENT, FRAGMENT_SIZE_MAX, FRAGMENT_SIZE_MIN, Fragment};

/// One bin per bit of the mask word. Bins above `log2(Fmax/Fmin)` can never
/// be populated, but keeping the full range makes indexing by
/// `floor(log2(size / Fmin))` always well-formed.
const NUM_BINS: usize = usize::BITS as usize;

/// Space reserved at the arena base for the instance record, padded so the
/// first fragment lands on an [`ALIGNMENT`] boundary.
const INSTANCE_SIZE_PADDED: usize = size_of::<Heap>().next_multiple_of(ALIGNMENT);

/// Smallest arena [`Heap::init`] accepts: the instance record plus one
/// minimum-size fragment.
pub const MIN_ARENA_SIZE: usize = INSTANCE_SIZE_PADDED + FRAGMENT_SIZE_MIN;

const _: () = assert!(INSTANCE_SIZE_PADDED.is_multiple_of(ALIGNMENT));

/// Errors that can occur while initializing a heap over an arena.
#[derive(Debug, Snafu)]
pub enum InitError {
    /// The arena base pointer was null.
    #[snafu(display("arena base pointer is null"))]
    NullBase {
        #[snafu(implicit)]
        location: Location,
    },
    /// The arena base was not aligned to [`ALIGNMENT`].
    #[snafu(display("arena base {base:#x} is not aligned to {ALIGNMENT} bytes"))]
    MisalignedBase {
        /// The offending base address.
        base: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The arena cannot hold the instance record and one fragment.
    #[snafu(display("arena size {size} is below the minimum of {MIN_ARENA_SIZE} bytes"))]
    ArenaTooSmall {
        /// The offending arena size.
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A value-copy snapshot of the heap's runtime counters.
///
/// Returned by [`Heap::diagnostics`]. All byte quantities refer to whole
/// fragments, header included, so `allocated` for a single 1-byte
/// allocation reads as one minimum fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Diagnostics {
    /// Total bytes governed by fragments, excluding the instance record.
    pub capacity: usize,
    /// Bytes currently held by used fragments.
    pub allocated: usize,
    /// Largest value `allocated` has ever reached. Monotonic.
    pub peak_allocated: usize,
    /// Largest amount ever requested, satisfied or not. Monotonic.
    pub peak_request_size: usize,
    /// Number of failed allocation and reallocation attempts.
    pub oom_count: u64,
}

/// The heap instance, written in place at the base of the caller's arena.
///
/// Obtained from [`Heap::init`]; lives exactly as long as the arena.
/// Discarding the arena discards the heap, there is no teardown.
#[repr(C)]
pub struct Heap {
    /// Free-list heads, one per size class; smallest classes first.
    bins: [*mut Fragment; NUM_BINS],
    /// Bit `i` set iff `bins[i]` is non-empty.
    nonempty_bin_mask: usize,
    /// One past the last arena byte; sizes the last fragment.
    arena_end: *mut u8,
    diagnostics: Diagnostics,
}

unsafe impl Send for Heap {}

/// Size-class index for a fragment of `size` bytes:
/// `floor(log2(size / Fmin))`.
fn bin_index(size: usize) -> usize {
    debug_assert!(size >= FRAGMENT_SIZE_MIN);
    debug_assert!(size.is_multiple_of(FRAGMENT_SIZE_MIN));
    (size / FRAGMENT_SIZE_MIN).ilog2() as usize
}

impl Heap {
    /// Creates a heap instance at the base of the given arena.
    ///
    /// The instance record occupies the first [`MIN_ARENA_SIZE`] minus one
    /// fragment of the arena; the remainder becomes a single free root
    /// fragment. Capacity is the arena size minus the instance record,
    /// clamped to the largest representable fragment and rounded down to a
    /// multiple of the minimum fragment size.
    ///
    /// # Errors
    ///
    /// Fails without side effects if `base` is null or misaligned, or if
    /// `size` is below [`MIN_ARENA_SIZE`].
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the memory range `base..base + size` is valid, writable, and not
    ///   in use by anything else
    /// - the range remains valid and exclusively owned by the heap for the
    ///   lifetime of the returned handle
    /// - the handle is not used concurrently without external serialization
    #[expect(clippy::cast_ptr_alignment)]
    pub unsafe fn init(base: *mut u8, size: usize) -> Result<NonNull<Self>, InitError> {
        ensure!(!base.is_null(), NullBaseSnafu);
        ensure!(
            base.addr().is_multiple_of(ALIGNMENT),
            MisalignedBaseSnafu { base: base.addr() }
        );
        ensure!(size >= MIN_ARENA_SIZE, ArenaTooSmallSnafu { size });

        let mut capacity = size - INSTANCE_SIZE_PADDED;
        if capacity > FRAGMENT_SIZE_MAX {
            capacity = FRAGMENT_SIZE_MAX;
        }
        capacity -= capacity % FRAGMENT_SIZE_MIN;
        debug_assert!(capacity >= FRAGMENT_SIZE_MIN);

        let heap = base.cast::<Self>();
        unsafe {
            let arena_start = base.add(INSTANCE_SIZE_PADDED);
            heap.write(Self {
                bins: [ptr::null_mut(); NUM_BINS],
                nonempty_bin_mask: 0,
                arena_end: arena_start.add(capacity),
                diagnostics: Diagnostics {
                    capacity,
                    allocated: 0,
                    peak_allocated: 0,
                    peak_request_size: 0,
                    oom_count: 0,
                },
            });

            let root = Fragment::carve(arena_start);
            debug_assert_eq!((*heap).fragment_size(root), capacity);
            (*heap).rebin(root, capacity);

            debug!("heap initialized: capacity={capacity} bytes, arena={size} bytes");
            Ok(NonNull::new_unchecked(heap))
        }
    }

    /// Allocates `amount` bytes and returns an [`ALIGNMENT`]-aligned
    /// payload pointer, or `None` if the request cannot be satisfied.
    ///
    /// A zero `amount` yields `None` without counting as an out-of-memory
    /// event. Runs in constant time.
    #[must_use]
    pub fn allocate(&mut self, amount: usize) -> Option<NonNull<u8>> {
        let mut out = None;

        // Requests close to the capacity limit are rejected up front so the
        // power-of-two round-up below cannot overflow.
        if amount > 0 && amount <= self.diagnostics.capacity - ALIGNMENT {
            let alloc_size = (amount + ALIGNMENT).next_power_of_two();
            debug_assert!(alloc_size >= FRAGMENT_SIZE_MIN);
            debug_assert!(alloc_size <= FRAGMENT_SIZE_MAX);

            // Bins at `optimal_bin` and above hold only fragments of at
            // least `alloc_size` bytes, so the head of the lowest non-empty
            // one fits without any list traversal.
            let optimal_bin = bin_index(alloc_size);
            let suitable_bins = self.nonempty_bin_mask & (usize::MAX << optimal_bin);
            if suitable_bins != 0 {
                let chosen_bin = suitable_bins.trailing_zeros() as usize;
                debug_assert!(chosen_bin >= optimal_bin);
                let frag = self.bins[chosen_bin];
                debug_assert!(!frag.is_null());

                unsafe {
                    let frag_size = self.fragment_size(frag);
                    debug_assert!(frag_size >= alloc_size);
                    debug_assert!(!Fragment::is_used(frag));
                    self.unbin(frag, frag_size);

                    let leftover = frag_size - alloc_size;
                    if leftover >= FRAGMENT_SIZE_MIN {
                        let tail = Fragment::carve(frag.cast::<u8>().add(alloc_size));
                        Fragment::interlink(tail, Fragment::next(frag));
                        Fragment::interlink(frag, tail);
                        debug_assert_eq!(self.fragment_size(tail), leftover);
                        self.rebin(tail, leftover);
                    }

                    self.diagnostics.allocated += alloc_size;
                    debug_assert!(self.diagnostics.allocated <= self.diagnostics.capacity);
                    self.diagnostics.peak_allocated =
                        cmp::max(self.diagnostics.peak_allocated, self.diagnostics.allocated);

                    Fragment::set_used(frag, true);
                    out = NonNull::new(Fragment::payload(frag));
                }
            }
        }

        self.diagnostics.peak_request_size =
            cmp::max(self.diagnostics.peak_request_size, amount);
        if out.is_none() && amount > 0 {
            self.diagnostics.oom_count += 1;
            trace!("allocation of {amount} bytes failed");
        }
        out
    }

    /// Returns a payload previously obtained from this heap. A null
    /// `pointer` is a no-op. Runs in constant time.
    ///
    /// The freed fragment is eagerly merged with its free address-order
    /// neighbors, so no two adjacent free fragments ever exist.
    ///
    /// # Safety
    ///
    /// `pointer` must be null or a live payload pointer returned by
    /// [`Heap::allocate`] or [`Heap::reallocate`] on this heap. Passing a
    /// foreign or already-freed pointer is undefined behavior (debug builds
    /// assert on what they can detect).
    pub unsafe fn deallocate(&mut self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }
        unsafe {
            let frag = Fragment::from_payload(pointer);
            debug_assert!(frag.addr() >= self.arena_start().addr());
            debug_assert!(frag.addr() <= self.arena_end.addr() - FRAGMENT_SIZE_MIN);
            debug_assert!(Fragment::is_used(frag)); // Catch double-free.

            let frag_size = self.fragment_size(frag);
            // Mark free first so a double-free trips the assert above even
            // when the fragment is merged away below.
            Fragment::set_used(frag, false);
            debug_assert!(self.diagnostics.allocated >= frag_size);
            self.diagnostics.allocated -= frag_size;

            let prev = Fragment::prev(frag);
            let next = Fragment::next(frag);
            let join_left = !prev.is_null() && !Fragment::is_used(prev);
            let join_right = !next.is_null() && !Fragment::is_used(next);
            if join_left && join_right {
                // [ prev ][ frag ][ next ] => [ ------- prev ------- ]
                let prev_size = self.fragment_size(prev);
                let next_size = self.fragment_size(next);
                self.unbin(prev, prev_size);
                self.unbin(next, next_size);
                Fragment::interlink(prev, Fragment::next(next));
                self.rebin(prev, prev_size + frag_size + next_size);
            } else if join_left {
                // [ prev ][ frag ][ next ] => [ --- prev --- ][ next ]
                let prev_size = self.fragment_size(prev);
                self.unbin(prev, prev_size);
                Fragment::interlink(prev, next);
                self.rebin(prev, prev_size + frag_size);
            } else if join_right {
                // [ prev ][ frag ][ next ] => [ prev ][ --- frag --- ]
                let next_size = self.fragment_size(next);
                self.unbin(next, next_size);
                Fragment::interlink(frag, Fragment::next(next));
                self.rebin(frag, frag_size + next_size);
            } else {
                self.rebin(frag, frag_size);
            }
        }
    }

    /// Resizes the allocation at `pointer` to `new_amount` bytes.
    ///
    /// The first `min(old_amount, new_amount)` payload bytes are preserved
    /// in every successful case. Four strategies are tried in order:
    /// shrink in place, expand into a free successor (pointer unchanged),
    /// expand backward into a free predecessor (payload moves to the
    /// returned pointer), and allocate-copy-free.
    ///
    /// A null `pointer` delegates to [`Heap::allocate`]; a zero
    /// `new_amount` delegates to [`Heap::deallocate`] and returns `None`.
    /// On failure `None` is returned and the original allocation is left
    /// valid and unchanged.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::deallocate`]: `pointer` must be null or a
    /// live payload pointer of this heap.
    pub unsafe fn reallocate(
        &mut self,
        pointer: *mut u8,
        new_amount: usize,
    ) -> Option<NonNull<u8>> {
        if pointer.is_null() {
            return self.allocate(new_amount);
        }
        if new_amount == 0 {
            unsafe { self.deallocate(pointer) };
            return None;
        }

        self.diagnostics.peak_request_size =
            cmp::max(self.diagnostics.peak_request_size, new_amount);
        if new_amount > self.diagnostics.capacity - ALIGNMENT {
            self.diagnostics.oom_count += 1;
            trace!("reallocation to {new_amount} bytes failed");
            return None;
        }

        unsafe {
            let frag = Fragment::from_payload(pointer);
            debug_assert!(Fragment::is_used(frag)); // Catch use-after-free.
            let frag_size = self.fragment_size(frag);
            let old_amount = frag_size - ALIGNMENT;
            let new_frag_size = (new_amount + ALIGNMENT).next_power_of_two();
            debug_assert!(new_frag_size >= FRAGMENT_SIZE_MIN);
            debug_assert!(new_frag_size <= FRAGMENT_SIZE_MAX);

            let prev = Fragment::prev(frag);
            let next = Fragment::next(frag);
            let prev_free = !prev.is_null() && !Fragment::is_used(prev);
            let next_free = !next.is_null() && !Fragment::is_used(next);
            let prev_size = if prev_free { self.fragment_size(prev) } else { 0 };
            let next_size = if next_free { self.fragment_size(next) } else { 0 };

            // Shrink or same size: the payload stays where it is.
            if new_frag_size <= frag_size {
                let leftover = frag_size - new_frag_size;
                if leftover >= FRAGMENT_SIZE_MIN {
                    debug_assert!(self.diagnostics.allocated >= leftover);
                    self.diagnostics.allocated -= leftover;
                    let tail = Fragment::carve(frag.cast::<u8>().add(new_frag_size));
                    Fragment::interlink(frag, tail);
                    if next_free {
                        // [ frag ][ tail ][ next ] => [ frag ][ --- tail --- ]
                        self.unbin(next, next_size);
                        Fragment::interlink(tail, Fragment::next(next));
                        self.rebin(tail, leftover + next_size);
                    } else {
                        Fragment::interlink(tail, next);
                        self.rebin(tail, leftover);
                    }
                    debug_assert_eq!(self.fragment_size(frag), new_frag_size);
                }
                return NonNull::new(pointer);
            }

            // Expand forward: absorb a free successor, payload in place.
            if next_free && frag_size + next_size >= new_frag_size {
                self.unbin(next, next_size);
                let leftover = (frag_size + next_size) - new_frag_size;
                if leftover >= FRAGMENT_SIZE_MIN {
                    // [ frag ][ --- next --- ] => [ --- frag --- ][ tail ]
                    let tail = Fragment::carve(frag.cast::<u8>().add(new_frag_size));
                    Fragment::interlink(tail, Fragment::next(next));
                    Fragment::interlink(frag, tail);
                    self.rebin(tail, leftover);
                    self.diagnostics.allocated += new_frag_size - frag_size;
                } else {
                    // [ frag ][ --- next --- ] => [ ------ frag ------ ]
                    Fragment::interlink(frag, Fragment::next(next));
                    self.diagnostics.allocated += next_size;
                }
                self.diagnostics.peak_allocated =
                    cmp::max(self.diagnostics.peak_allocated, self.diagnostics.allocated);
                return NonNull::new(pointer);
            }

            // Expand backward (and possibly forward): the payload moves to
            // a strictly lower address, so an overlap-tolerant copy is
            // required. The move may overwrite `frag`'s own header, hence
            // all sizes were captured above and `frag` is not touched past
            // this point.
            if prev_free && prev_size + frag_size + next_size >= new_frag_size {
                self.unbin(prev, prev_size);
                if next_free {
                    self.unbin(next, next_size);
                }
                let out = Fragment::payload(prev);
                ptr::copy(pointer, out, old_amount);
                Fragment::set_used(prev, true);

                let leftover = (prev_size + frag_size + next_size) - new_frag_size;
                let successor = if next_free { Fragment::next(next) } else { next };
                if leftover >= FRAGMENT_SIZE_MIN {
                    let tail = Fragment::carve(prev.cast::<u8>().add(new_frag_size));
                    Fragment::interlink(tail, successor);
                    Fragment::interlink(prev, tail);
                    self.rebin(tail, leftover);
                    self.diagnostics.allocated += new_frag_size - frag_size;
                } else {
                    Fragment::interlink(prev, successor);
                    self.diagnostics.allocated += prev_size + next_size;
                }
                self.diagnostics.peak_allocated =
                    cmp::max(self.diagnostics.peak_allocated, self.diagnostics.allocated);
                return NonNull::new(out);
            }

            // Last resort: relocate into a fresh fragment. The inner
            // allocate accounts for the OOM on failure; the original
            // allocation is preserved in that case. The old fragment is
            // still live while the inner allocate runs, so the peak it
            // records double-counts the pair; the peak must only see
            // settled states and is re-derived once the old fragment is
            // freed.
            let peak_before = self.diagnostics.peak_allocated;
            let out = self.allocate(new_amount);
            if let Some(out) = out {
                ptr::copy_nonoverlapping(
                    pointer,
                    out.as_ptr(),
                    cmp::min(old_amount, new_amount),
                );
                self.deallocate(pointer);
                self.diagnostics.peak_allocated =
                    cmp::max(peak_before, self.diagnostics.allocated);
            }
            out
        }
    }

    /// Largest amount a single allocation can ever request from this heap:
    /// `2^floor(log2(capacity))` minus one header.
    ///
    /// Larger requests fail fast without being matched against the bins.
    #[must_use]
    pub fn max_allocation_size(&self) -> usize {
        (1usize << self.diagnostics.capacity.ilog2()) - ALIGNMENT
    }

    /// Returns a snapshot of the runtime counters.
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    /// Checks the internal consistency of the heap's bookkeeping.
    ///
    /// Intended for periodic self-tests in safety-critical applications; a
    /// `false` result indicates heap corruption or a defect in the engine.
    /// Runs in time proportional to the number of bins, not fragments.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        let mut valid = true;

        for (index, &head) in self.bins.iter().enumerate() {
            let mask_bit_set = self.nonempty_bin_mask & (1usize << index) != 0;
            valid = valid && (mask_bit_set == !head.is_null());
        }

        let diag = &self.diagnostics;
        valid = valid
            && diag.capacity >= FRAGMENT_SIZE_MIN
            && diag.capacity <= FRAGMENT_SIZE_MAX
            && diag.capacity.is_multiple_of(FRAGMENT_SIZE_MIN);
        valid = valid
            && diag.allocated <= diag.capacity
            && diag.allocated.is_multiple_of(FRAGMENT_SIZE_MIN)
            && diag.peak_allocated >= diag.allocated
            && diag.peak_allocated <= diag.capacity
            && diag.peak_allocated.is_multiple_of(FRAGMENT_SIZE_MIN);
        valid = valid && (diag.peak_request_size < diag.capacity || diag.oom_count > 0);
        if diag.peak_request_size == 0 {
            valid = valid && diag.allocated == 0 && diag.peak_allocated == 0 && diag.oom_count == 0;
        } else {
            // When no request has ever failed, the peak request must have
            // been satisfied, which bounds it by the peak allocation. The
            // sum cannot overflow in that case.
            valid = valid
                && (diag.oom_count > 0
                    || diag.peak_request_size + ALIGNMENT <= diag.peak_allocated);
        }
        valid
    }

    /// Address of the first fragment.
    fn arena_start(&self) -> *const u8 {
        unsafe { ptr::from_ref(self).cast::<u8>().add(INSTANCE_SIZE_PADDED) }
    }

    /// Size of a fragment, derived from its successor (or the arena-end
    /// sentinel for the last fragment).
    unsafe fn fragment_size(&self, frag: *const Fragment) -> usize {
        debug_assert!(frag.addr() >= self.arena_start().addr());
        let next = unsafe { Fragment::next(frag) };
        let end = if next.is_null() {
            self.arena_end.addr()
        } else {
            next.addr()
        };
        let size = end - frag.addr();
        debug_assert!(size >= FRAGMENT_SIZE_MIN);
        debug_assert!(size <= self.diagnostics.capacity);
        debug_assert!(size.is_multiple_of(FRAGMENT_SIZE_MIN));
        size
    }

    /// Pushes a free fragment onto the head of its bin (most recently used
    /// first) and marks the bin non-empty.
    unsafe fn rebin(&mut self, fragment: *mut Fragment, fragment_size: usize) {
        debug_assert!(!fragment.is_null());
        let index = bin_index(fragment_size);
        unsafe {
            (*fragment).next_free = self.bins[index];
            (*fragment).prev_free = ptr::null_mut();
            if !self.bins[index].is_null() {
                (*self.bins[index]).prev_free = fragment;
            }
        }
        self.bins[index] = fragment;
        self.nonempty_bin_mask |= 1usize << index;
    }

    /// Detaches a free fragment from its bin, clearing the mask bit if the
    /// bin becomes empty.
    unsafe fn unbin(&mut self, fragment: *mut Fragment, fragment_size: usize) {
        debug_assert!(!fragment.is_null());
        let index = bin_index(fragment_size);
        unsafe {
            let next_free = (*fragment).next_free;
            let prev_free = (*fragment).prev_free;
            if !next_free.is_null() {
                (*next_free).prev_free = prev_free;
            }
            if !prev_free.is_null() {
                (*prev_free).next_free = next_free;
            }
            if self.bins[index] == fragment {
                debug_assert!(prev_free.is_null());
                self.bins[index] = next_free;
                if next_free.is_null() {
                    self.nonempty_bin_mask &= !(1usize << index);
                }
            }
        }
    }
}
