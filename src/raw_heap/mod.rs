//! This module provides the heap engine and its support types.
//!
//! The engine ties the three lower layers together: the [`region`] owns the
//! break and the epilogue, [`block`] encodes the boundary tags, and
//! [`buckets`] indexes the free blocks by size class. On top of those this
//! module implements the four classic entry points — allocate, free,
//! reallocate, zeroed allocate — plus placement (with splitting),
//! coalescing, and the extend-on-miss policy.

mod block;
mod buckets;
mod region;

use crate::sbrk::Sbrk;
use block::{Block, Header};
use buckets::{Buckets, N_BUCKETS};
use region::{Region, WORD};

pub use region::OutOfMemory;
pub(crate) use region::ALIGNMENT;

use core::ptr::{self, NonNull};

/// Smallest legal block: header plus one payload word for a used block, or
/// header, two links and footer for a free one — one quantum either way.
const MIN_WORDS: u32 = (ALIGNMENT / WORD) as u32;

/// A growable heap with segregated free lists.
///
/// One value owns the whole machine: the region, the bucket table and the
/// `last` marker. It is strictly single-threaded; the public [`Allocator`]
/// wrapper adds the lock that [`GlobalAlloc`] requires.
///
/// [`Allocator`]: crate::Allocator
/// [`GlobalAlloc`]: core::alloc::GlobalAlloc
pub(crate) struct RawHeap<S> {
    region: Region<S>,
    buckets: Buckets,
    /// The highest-addressed block, or `None` while the heap is empty.
    /// Extension merges with it when it is free instead of growing by the
    /// full request.
    last: Option<Block>,
}

impl<S: Sbrk> RawHeap<S> {
    /// Set up an empty heap on `source`. Fails when the source cannot even
    /// supply the alignment padding and the epilogue word.
    pub(crate) fn new(source: S) -> Result<Self, OutOfMemory> {
        Ok(Self {
            region: Region::new(source)?,
            buckets: Buckets::new(),
            last: None,
        })
    }

    /// Allocate `bytes` bytes of payload, 16-byte aligned.
    ///
    /// Zero-sized and unrepresentably large requests yield `None`, as does
    /// exhaustion of the break source. The heap is unchanged in every
    /// failure case.
    pub(crate) fn alloc(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        let words = words_for(bytes)?;
        if let Some(block) = self.buckets.find_fit(&self.region, words) {
            self.place(block, words);
            return Some(self.region.payload_ptr(block));
        }

        // miss: grow the heap. When the topmost block is free the new
        // space merges with it, so only the difference is requested.
        let mut needed = words as usize * WORD;
        if let Some(last) = self.last {
            let header = self.region.header(last);
            if !header.is_used() {
                needed -= header.words() as usize * WORD;
            }
        }
        let block = self.extend(needed).ok()?;
        self.place(block, words);
        Some(self.region.payload_ptr(block))
    }

    /// Release the allocation whose payload starts at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be null (a no-op) or a payload pointer previously
    /// returned by this heap and not freed or reallocated since.
    pub(crate) unsafe fn free(&mut self, ptr: *mut u8) {
        let payload = match NonNull::new(ptr) {
            Some(payload) => payload,
            None => return,
        };
        let block = self.region.block_of_payload(payload);
        let header = self.region.header(block);
        self.region.write_block(
            block,
            Header::Free {
                words: header.words(),
                prev_free: header.prev_free(),
            },
        );

        let next_free = self
            .region
            .next_adjacent(block)
            .map_or(false, |next| !self.region.header(next).is_used());
        if header.prev_free() || next_free {
            self.coalesce(block);
        } else {
            self.buckets.insert(&mut self.region, block);
        }
    }

    /// Resize an allocation by allocating anew, copying the payload, and
    /// freeing the old block.
    ///
    /// A null `ptr` degenerates to [`alloc`](Self::alloc); a zero `bytes`
    /// to [`free`](Self::free). When the new allocation fails the old
    /// block stays live and untouched.
    ///
    /// # Safety
    /// `ptr` must be null or a live payload pointer from this heap.
    pub(crate) unsafe fn realloc(&mut self, ptr: *mut u8, bytes: usize) -> Option<NonNull<u8>> {
        let old = match NonNull::new(ptr) {
            Some(old) => old,
            None => return self.alloc(bytes),
        };
        if bytes == 0 {
            // SAFETY: `ptr` is live per this function's contract.
            unsafe { self.free(ptr) };
            return None;
        }

        let old_block = self.region.block_of_payload(old);
        let old_payload = payload_bytes(self.region.header(old_block));
        let new = self.alloc(bytes)?;
        let new_block = self.region.block_of_payload(new);
        let count = old_payload.min(payload_bytes(self.region.header(new_block)));
        // SAFETY: both payloads are live and at least `count` bytes long,
        // and they belong to distinct blocks — the old one is still
        // allocated while `alloc` runs, so it cannot be handed out again.
        // The copy moves `MaybeUninit` bytes because the tail of the old
        // payload may never have been written.
        unsafe {
            ptr::copy_nonoverlapping(
                old.as_ptr().cast::<core::mem::MaybeUninit<u8>>(),
                new.as_ptr().cast::<core::mem::MaybeUninit<u8>>(),
                count,
            );
        }
        // SAFETY: `ptr` is live per this function's contract.
        unsafe { self.free(ptr) };
        Some(new)
    }

    /// Allocate a zeroed region of `count` elements of `size` bytes each.
    /// An overflowing `count * size` is refused rather than wrapped.
    pub(crate) fn calloc(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let payload = self.alloc(bytes)?;
        // SAFETY: the fresh payload is at least `bytes` long.
        unsafe { ptr::write_bytes(payload.as_ptr(), 0, bytes) };
        Some(payload)
    }

    /// Grow the heap by `bytes` and return the resulting top block, merged
    /// with a free old top if there was one.
    fn extend(&mut self, bytes: usize) -> Result<Block, OutOfMemory> {
        let prev_free = self
            .last
            .map_or(false, |last| !self.region.header(last).is_used());
        let block = self.region.extend(bytes, prev_free)?;
        self.last = Some(block);
        Ok(self.coalesce(block))
    }

    /// Carve an allocation of `words` words out of the free block `block`.
    ///
    /// The block must have been located via `find_fit`, so it is free,
    /// indexed, and at least `words` large. The trailing remainder becomes
    /// a block of its own when it can stand as one.
    fn place(&mut self, block: Block, words: u32) {
        let header = self.region.header(block);
        self.buckets.remove(&mut self.region, block);

        let surplus = header.words() - words;
        if surplus >= MIN_WORDS {
            let rest = Block(block.0 + words);
            self.region.write_block(
                rest,
                Header::Free {
                    words: surplus,
                    prev_free: false,
                },
            );
            self.buckets.insert(&mut self.region, rest);
            self.region.write_block(
                block,
                Header::Used {
                    words,
                    prev_free: header.prev_free(),
                },
            );
            if self.last == Some(block) {
                self.last = Some(rest);
            }
        } else {
            self.region.write_block(
                block,
                Header::Used {
                    words: header.words(),
                    prev_free: header.prev_free(),
                },
            );
        }
    }

    /// Merge `block` with any free neighbors and index the result.
    ///
    /// `block` must already carry a free header/footer and must not be in
    /// any bucket.
    fn coalesce(&mut self, block: Block) -> Block {
        let prev = self.region.prev_adjacent(block);
        let next = self.region.next_adjacent(block);
        let next_free = next.map_or(false, |next| !self.region.header(next).is_used());
        let grows_top = self.last == Some(block) || (next_free && next == self.last);

        let mut merged = block;
        let mut words = self.region.header(block).words();
        if let Some(next) = next {
            if !self.region.header(next).is_used() {
                words += self.region.header(next).words();
                self.buckets.remove(&mut self.region, next);
            }
        }
        if let Some(prev) = prev {
            // reachable at all means free, so it is indexed
            words += self.region.header(prev).words();
            self.buckets.remove(&mut self.region, prev);
            merged = prev;
        }

        // whatever was below the merged block is used now, or nothing
        self.region.write_block(
            merged,
            Header::Free {
                words,
                prev_free: false,
            },
        );
        self.buckets.insert(&mut self.region, merged);
        if grows_top {
            self.last = Some(merged);
        }
        merged
    }

    /// Walk the whole heap and every bucket, asserting the structural
    /// invariants.
    ///
    /// # Panics
    /// Panics on the first violated invariant — a violation means the heap
    /// metadata can no longer be trusted, so there is nothing to recover.
    /// With `verbose` set a block map is dumped first (needs `std`).
    pub(crate) fn check(&self, verbose: bool) {
        #[cfg(any(test, feature = "std"))]
        if verbose {
            self.dump();
        }
        #[cfg(not(any(test, feature = "std")))]
        let _ = verbose;

        // pass 1: the adjacent-block chain, from the first block to the
        // epilogue
        let mut cursor = Block(0);
        let mut previous: Option<Header> = None;
        let mut total_words = 0_u32;
        let mut free_blocks = 0_usize;
        let mut topmost = None;
        while cursor != self.region.epilogue() {
            let header = self.region.header(cursor);
            let words = header.words();
            assert!(
                words >= MIN_WORDS && words % MIN_WORDS == 0,
                "malformed size at offset {}",
                cursor.0,
            );
            assert!(
                cursor.0 + words <= self.region.epilogue().0,
                "block at offset {} overruns the heap",
                cursor.0,
            );
            assert_eq!(
                self.region.payload_ptr(cursor).as_ptr() as usize % ALIGNMENT,
                0,
                "misaligned payload at offset {}",
                cursor.0,
            );
            match previous {
                Some(previous) => assert_eq!(
                    header.prev_free(),
                    !previous.is_used(),
                    "PREVFREE out of sync at offset {}",
                    cursor.0,
                ),
                None => assert!(
                    !header.prev_free(),
                    "the first block claims a free predecessor",
                ),
            }
            if !header.is_used() {
                assert!(
                    previous.map_or(true, Header::is_used),
                    "uncoalesced neighbors at offset {}",
                    cursor.0,
                );
                let footer = Header::from_raw(self.region.word(Block(cursor.0 + words - 1)));
                assert_eq!(footer, header, "footer mismatch at offset {}", cursor.0);
                free_blocks += 1;
            }
            total_words += words;
            topmost = Some(cursor);
            previous = Some(header);
            cursor = Block(cursor.0 + words);
        }
        assert_eq!(
            total_words,
            self.region.epilogue().0,
            "block sizes do not tile the heap",
        );
        assert_eq!(
            self.region.break_addr(),
            self.region.base_addr() + (total_words as usize + 1) * WORD,
            "the break and the epilogue disagree",
        );
        assert_eq!(self.last, topmost, "`last` does not mark the topmost block");

        // pass 2: the bucket lists. Together with pass 1 this pins every
        // free block to exactly one list: all listed blocks are free and in
        // the right class, back links rule out sharing, and the step budget
        // rules out cycles, so equal counts close the bijection.
        let mut listed = 0_usize;
        for index in 0..N_BUCKETS {
            let mut back = None;
            let mut cursor = self.buckets.head(index);
            while let Some(block) = cursor {
                let header = self.region.header(block);
                assert!(!header.is_used(), "used block in bucket {}", index);
                assert_eq!(
                    Buckets::index_of(header.words()),
                    index,
                    "block of {} words filed in bucket {}",
                    header.words(),
                    index,
                );
                assert_eq!(
                    buckets::prev_of(&self.region, block),
                    back,
                    "broken back link in bucket {}",
                    index,
                );
                listed += 1;
                assert!(listed <= free_blocks, "cycle in bucket {}", index);
                back = Some(block);
                cursor = buckets::next_of(&self.region, block);
            }
        }
        assert_eq!(
            listed, free_blocks,
            "free blocks and bucket membership disagree",
        );
    }

    #[cfg(any(test, feature = "std"))]
    fn dump(&self) {
        std::println!(
            "heap: {} words up to the epilogue, break at {:#x}",
            self.region.epilogue().0,
            self.region.break_addr(),
        );
        let mut cursor = Block(0);
        while cursor != self.region.epilogue() {
            let header = self.region.header(cursor);
            std::println!(
                "  {:>8} +{:<8} {} {}",
                cursor.0,
                header.words(),
                if header.is_used() { "used" } else { "free" },
                if header.prev_free() { "prevfree" } else { "" },
            );
            cursor = Block(cursor.0 + header.words());
        }
        for index in 0..N_BUCKETS {
            if let Some(head) = self.buckets.head(index) {
                std::println!("  bucket {}: head at offset {}", index, head.0);
            }
        }
    }
}

/// Header plus request, rounded up to the quantum and converted to words.
/// Requests whose rounded size cannot be represented in a boundary tag are
/// refused.
fn words_for(bytes: usize) -> Option<u32> {
    let total = bytes.checked_add(WORD + (ALIGNMENT - 1))? & !(ALIGNMENT - 1);
    u32::try_from(total / WORD)
        .ok()
        .filter(|&words| words <= i32::MAX as u32)
}

/// Usable bytes of a block: everything but the header word.
fn payload_bytes(header: Header) -> usize {
    (header.words() as usize - 1) * WORD
}
