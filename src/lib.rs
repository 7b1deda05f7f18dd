//! Segregated-fit allocator for growable heaps
//!
//! This crate provides a general-purpose memory allocator in the classic
//! `malloc` mold: it manages one contiguous heap region that grows through
//! an [`sbrk`-style provider](sbrk::Sbrk) and serves the four usual
//! primitives — allocate, free, reallocate and zeroed allocate — with
//! 16-byte-aligned payloads and constant-time bookkeeping. The central type
//! is [`Allocator`], which implements [`core::alloc::GlobalAlloc`] so it
//! can back the [`alloc`-crate][alloc] on `#![no_std]` targets or stand in
//! for `malloc` in a C-like runtime.
//!
//! # Usage
//! Pick a break provider and hand it to the allocator. On a Unix process
//! that owns its program break:
//! ```no_run
//! use segalloc::{sbrk::ProgramBreak, Allocator};
//!
//! #[global_allocator]
//! // SAFETY: nothing else in this process moves the program break.
//! static ALLOCATOR: Allocator<ProgramBreak> = Allocator::new(unsafe { ProgramBreak::new() });
//! ```
//! For tests, or when the heap should live inside a buffer you already own,
//! use [`FixedBreak`](sbrk::FixedBreak) instead:
//! ```
//! use core::alloc::{GlobalAlloc, Layout};
//! use core::mem::MaybeUninit;
//! use segalloc::{sbrk::FixedBreak, Allocator};
//!
//! let mut arena = [MaybeUninit::<u8>::uninit(); 4096];
//! let allocator = Allocator::new(FixedBreak::new(&mut arena));
//!
//! let layout = Layout::from_size_align(100, 16).unwrap();
//! let p = unsafe { allocator.alloc(layout) };
//! assert!(!p.is_null());
//! assert_eq!(p as usize % 16, 0);
//! unsafe { allocator.dealloc(p, layout) };
//! ```
//! The heap is planted lazily on the first allocation (or eagerly via
//! [`Allocator::init`]) and never returns memory to the provider.
//!
//! # Implementation
//! The heap is an array of 4-byte words. Every block starts with a one-word
//! boundary tag holding the block size and two flags; the payload follows
//! immediately, which is why the initializer aligns the heap so that
//! headers sit at addresses ≡ 12 (mod 16):
//! ```text
//!  addr % 16:   12   0                        12   0
//!             +----+--------------- ~ ------+----+------- ~ ---+----+
//!             | hd | payload                | hd | payload     | ep |
//!             +----+--------------- ~ ------+----+------- ~ ---+----+
//!             block (multiple of 16 bytes)   block               ^
//!                                                one-word epilogue
//! ```
//! A *used* block is nothing but header and payload. A *free* block also
//! carries two list links in its first payload words and replicates its
//! header in a footer at its last word:
//! ```text
//!             +----+------+------+---- ~ ----+----+
//!             | hd | next | prev |           | ft |
//!             +----+------+------+---- ~ ----+----+
//! ```
//! The footer lets the *following* block step backwards over it when
//! coalescing; used blocks elide the footer and a PREVFREE bit in the
//! following block's header stands in for it. The links are signed word
//! offsets from the heap base (−1 for "none"), so they stay 32-bit wide
//! however high the heap is mapped.
//!
//! Free blocks are indexed in ten buckets by power-of-two size class
//! (16 bytes, up to 32, up to 64, …, everything above 4096). Allocation
//! searches the matching bucket first-fit and climbs to larger classes;
//! the chosen block is split when the remainder can stand as a block of
//! its own. Freeing coalesces with both neighbors eagerly, so two adjacent
//! free blocks never exist. On a miss the heap grows by the rounded
//! request — minus the size of the topmost block when that one is free,
//! since the fresh space merges with it.
//!
//! The allocator is single-threaded at heart (a contract inherited from
//! its sbrk-like backing); the `spin::Mutex` inside [`Allocator`] only
//! exists to satisfy the `&self` signatures of `GlobalAlloc` and
//! serializes entry instead of enabling real concurrency.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![cfg_attr(not(test), no_std)]
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

#[cfg(all(feature = "std", not(test)))]
extern crate std;

mod raw_heap;
pub mod sbrk;

pub use raw_heap::OutOfMemory;

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr::{self, NonNull};
use raw_heap::{RawHeap, ALIGNMENT};
use sbrk::Sbrk;

/// A segregated-fit allocator over a growable break.
///
/// The value wraps the single-threaded heap engine in a `spin::Mutex` so
/// that it can be shared and registered as the global allocator. The heap
/// itself is created lazily: constructing an `Allocator` touches no memory,
/// the first allocation (or an explicit [`init`](Self::init)) does.
///
/// Payloads are always aligned to 16 bytes; requests for stricter
/// alignment fail with a null pointer, as this allocator does not serve
/// them by contract.
pub struct Allocator<S> {
    heap: spin::Mutex<State<S>>,
}

// SAFETY: all access to the wrapped state goes through the `spin::Mutex`,
// which serializes entry; the allocator never exposes `&S` or the raw heap
// pointers to more than one thread at a time.
unsafe impl<S: Send> Sync for Allocator<S> {}

/// Lazy-initialization state of the wrapped heap.
enum State<S> {
    /// Nothing planted yet; holds the break source.
    Boot(S),
    /// The live heap.
    Live(RawHeap<S>),
    /// Planting the heap failed; every request reports exhaustion.
    Broken,
}

impl<S: Sbrk> Allocator<S> {
    /// Create an allocator over `source`.
    ///
    /// This is a `const fn`, so the allocator can be built directly in a
    /// `static` initializer.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new(source: S) -> Self {
        Self {
            heap: spin::Mutex::new(State::Boot(source)),
        }
    }

    /// Plant the heap eagerly instead of on the first allocation.
    ///
    /// Idempotent: once the heap is live this returns `Ok` without touching
    /// anything. Fails when the break source cannot supply the few setup
    /// bytes (alignment padding plus the epilogue word).
    pub fn init(&self) -> Result<(), OutOfMemory> {
        match Self::ensure_live(&mut self.heap.lock()) {
            Some(_) => Ok(()),
            None => Err(OutOfMemory),
        }
    }

    /// Allocate a zeroed region of `count` elements of `size` bytes each,
    /// in the manner of C's `calloc`.
    ///
    /// Returns null when `count * size` overflows or the heap is
    /// exhausted.
    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        self.with(|heap| heap.calloc(count, size))
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Verify every heap invariant, panicking on the first violation.
    ///
    /// Checks that block sizes are well-formed, footers mirror headers,
    /// PREVFREE bits track the predecessors, the block chain tiles the
    /// heap up to the epilogue, every free block sits in exactly the right
    /// bucket and the bucket lists are sound. A heap that was never
    /// touched passes trivially. With `verbose` set a block map is printed
    /// first (available with the `std` feature).
    pub fn check_heap(&self, verbose: bool) {
        if let State::Live(heap) = &*self.heap.lock() {
            heap.check(verbose);
        }
    }

    /// Run `f` on the live heap, planting it on first use.
    fn with<R>(&self, f: impl FnOnce(&mut RawHeap<S>) -> R) -> Option<R> {
        Self::ensure_live(&mut self.heap.lock()).map(f)
    }

    fn ensure_live<'a>(state: &'a mut State<S>) -> Option<&'a mut RawHeap<S>> {
        if let State::Boot(_) = state {
            let source = match mem::replace(state, State::Broken) {
                State::Boot(source) => source,
                // the pattern above just matched
                _ => return None,
            };
            if let Ok(heap) = RawHeap::new(source) {
                *state = State::Live(heap);
            }
        }
        match state {
            State::Live(heap) => Some(heap),
            _ => None,
        }
    }
}

// SAFETY: the implementation adheres to the `GlobalAlloc` contract: it
// never unwinds, reports failure through null pointers, and returned
// payloads stay valid and disjoint until passed back to `dealloc` or
// `realloc`. Layout sizes are honored in full; alignments above 16 are
// refused (with null) rather than mis-served.
unsafe impl<S: Sbrk> GlobalAlloc for Allocator<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.with(|heap| heap.alloc(layout.size()))
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _ = self.with(|heap| {
            // SAFETY: `ptr` came out of `alloc` on this allocator and is
            // unfreed, per the `GlobalAlloc` contract.
            unsafe { heap.free(ptr) }
        });
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.calloc(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.with(|heap| {
            // SAFETY: `ptr` is a live allocation of this allocator, per
            // the `GlobalAlloc` contract.
            unsafe { heap.realloc(ptr, new_size) }
        })
        .flatten()
        .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
