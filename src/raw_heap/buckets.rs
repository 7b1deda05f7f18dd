//! The segregated free-list index.
//!
//! Ten buckets keyed by a power-of-two size class: bucket 0 holds blocks of
//! exactly 16 bytes, bucket 1 those in (16, 32], …, bucket 9 everything
//! above 4096 bytes. Each bucket is a doubly linked list of free blocks
//! with LIFO insertion.
//!
//! The links live inside the free blocks themselves — the word after the
//! header is the forward link, the word after that the back link — encoded
//! as signed word offsets from the region base with −1 meaning "none".
//! Offsets instead of pointers keep the links at 32 bits even when the
//! heap is mapped above 4 GiB. The raw encoding never leaves this module.

use super::block::Block;
use super::region::{Region, WORD};

pub(crate) const N_BUCKETS: usize = 10;
/// Upper bound of the smallest size class, in bytes; doubles per bucket.
const BASE_CLASS: usize = 16;

const NONE: u32 = -1_i32 as u32;

pub(crate) struct Buckets {
    heads: [Option<Block>; N_BUCKETS],
}

impl Buckets {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; N_BUCKETS],
        }
    }

    /// The size class of a block of `words` words.
    pub(crate) fn index_of(words: u32) -> usize {
        let bytes = words as usize * WORD;
        let mut boundary = BASE_CLASS;
        let mut index = 0;
        while bytes > boundary && index < N_BUCKETS - 1 {
            boundary <<= 1;
            index += 1;
        }
        index
    }

    pub(crate) fn head(&self, index: usize) -> Option<Block> {
        self.heads[index]
    }

    /// Push a free block onto the head of its size class.
    pub(crate) fn insert<S>(&mut self, region: &mut Region<S>, block: Block) {
        let index = Self::index_of(region.header(block).words());
        let head = self.heads[index];
        set_prev(region, block, None);
        set_next(region, block, head);
        if let Some(head) = head {
            set_prev(region, head, Some(block));
        }
        self.heads[index] = Some(block);
    }

    /// Unlink a free block from its size class.
    pub(crate) fn remove<S>(&mut self, region: &mut Region<S>, block: Block) {
        let index = Self::index_of(region.header(block).words());
        let next = next_of(region, block);
        let prev = prev_of(region, block);
        match (self.heads[index] == Some(block), next, prev) {
            // the only element
            (true, None, _) => self.heads[index] = None,
            // head with a successor
            (true, Some(next), _) => {
                self.heads[index] = Some(next);
                set_prev(region, next, None);
            }
            // somewhere in the middle
            (false, Some(next), Some(prev)) => {
                set_next(region, prev, Some(next));
                set_prev(region, next, Some(prev));
            }
            // the tail
            (false, None, Some(prev)) => set_next(region, prev, None),
            // every indexed block is reachable, so a non-head has a
            // predecessor
            (false, _, None) => debug_assert!(false, "unlinked block passed to remove"),
        }
    }

    /// First-fit search, starting at the size class of `words` and moving
    /// to larger classes until something fits.
    pub(crate) fn find_fit<S>(&self, region: &Region<S>, words: u32) -> Option<Block> {
        for index in Self::index_of(words)..N_BUCKETS {
            let mut cursor = self.heads[index];
            while let Some(block) = cursor {
                if region.header(block).words() >= words {
                    return Some(block);
                }
                cursor = next_of(region, block);
            }
        }
        None
    }
}

pub(crate) fn next_of<S>(region: &Region<S>, block: Block) -> Option<Block> {
    decode(region.word(Block(block.0 + 1)))
}

pub(crate) fn prev_of<S>(region: &Region<S>, block: Block) -> Option<Block> {
    decode(region.word(Block(block.0 + 2)))
}

fn set_next<S>(region: &mut Region<S>, block: Block, link: Option<Block>) {
    region.set_word(Block(block.0 + 1), encode(link));
}

fn set_prev<S>(region: &mut Region<S>, block: Block, link: Option<Block>) {
    region.set_word(Block(block.0 + 2), encode(link));
}

fn encode(link: Option<Block>) -> u32 {
    match link {
        Some(block) => block.0,
        None => NONE,
    }
}

fn decode(raw: u32) -> Option<Block> {
    (raw as i32 >= 0).then(|| Block(raw))
}
