//! Boundary-tag encoding.
//!
//! Every block starts with one 4-byte word holding the block size and two
//! flags:
//!
//! ```text
//! 31                                    2   1          0
//! +--------------------------------------+----------+------+
//! |   total block size in words          | PREVFREE | USED |
//! +--------------------------------------+----------+------+
//! ```
//!
//! Sizes are multiples of four words (the 16-byte quantum), so the two low
//! bits of the word count are always zero and can carry the flags. Free
//! blocks replicate the header in a footer at their last word; used blocks
//! have no footer — the PREVFREE bit of the following block stands in for
//! it. The raw word is decoded into [`Header`] at exactly one boundary
//! ([`Header::from_raw`]/[`Header::to_raw`]); the rest of the crate never
//! sees the bit-twiddling.

const USED: u32 = 0b01;
const PREVFREE: u32 = 0b10;
const SIZE_MASK: u32 = !(USED | PREVFREE);

/// One block, addressed by the word offset of its header from the region
/// base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(pub(crate) u32);

/// Decoded form of the on-heap header (and, for free blocks, footer) word.
///
/// `words` is the total block size in words, header included. `prev_free`
/// mirrors the state of the adjacent block below; a block with no
/// predecessor reads as if the predecessor were used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Header {
    Free { words: u32, prev_free: bool },
    Used { words: u32, prev_free: bool },
}

impl Header {
    /// The sentinel terminating the adjacent-block chain: size zero, used.
    pub(crate) const fn epilogue() -> Self {
        Self::Used {
            words: 0,
            prev_free: false,
        }
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        let words = raw & SIZE_MASK;
        let prev_free = raw & PREVFREE != 0;
        if raw & USED != 0 {
            Self::Used { words, prev_free }
        } else {
            Self::Free { words, prev_free }
        }
    }

    pub(crate) fn to_raw(self) -> u32 {
        let (words, flags) = match self {
            Self::Free { words, prev_free } => (words, flag(prev_free)),
            Self::Used { words, prev_free } => (words, USED | flag(prev_free)),
        };
        debug_assert_eq!(words & !SIZE_MASK, 0, "size bleeds into the flag bits");
        words | flags
    }

    /// Total block size in words.
    pub(crate) fn words(self) -> u32 {
        match self {
            Self::Free { words, .. } | Self::Used { words, .. } => words,
        }
    }

    pub(crate) fn is_used(self) -> bool {
        matches!(self, Self::Used { .. })
    }

    pub(crate) fn prev_free(self) -> bool {
        match self {
            Self::Free { prev_free, .. } | Self::Used { prev_free, .. } => prev_free,
        }
    }

    /// The same header with the PREVFREE bit replaced.
    pub(crate) fn with_prev_free(self, prev_free: bool) -> Self {
        match self {
            Self::Free { words, .. } => Self::Free { words, prev_free },
            Self::Used { words, .. } => Self::Used { words, prev_free },
        }
    }
}

const fn flag(prev_free: bool) -> u32 {
    if prev_free {
        PREVFREE
    } else {
        0
    }
}
