//! Boundary tags and block handles.
//!
//! A block is laid out as
//!
//! ```text
//! +--------+---------------------------+--------+
//! | header | payload (+ padding)       | footer |
//! +--------+---------------------------+--------+
//! ^ block  ^ payload = block + WORD
//! ```
//!
//! The header and footer hold the same tag word. While a block is free, the
//! first eight bytes of its payload hold the offset of the next block in its
//! free list.

use core::{cmp, mem, num::NonZeroUsize};

use crate::base::BasePtr;

/// Width of a tag word.
pub(crate) const WORD: usize = mem::size_of::<u32>();

/// Bytes of every block taken by its header and footer.
pub(crate) const OVERHEAD: usize = 2 * WORD;

/// Alignment of every payload, and granularity of every block size.
pub const ALIGNMENT: usize = 8;

/// Width of the free-list link stored in a free payload.
pub(crate) const LINK_SIZE: usize = mem::size_of::<u64>();

/// The smallest block able to hold its tags and a free-list link.
pub(crate) const MIN_BLOCK_SIZE: usize = round_up(OVERHEAD + LINK_SIZE);

/// The largest block size that fits in a tag word.
pub(crate) const MAX_BLOCK_SIZE: usize = (u32::MAX as usize) & !(ALIGNMENT - 1);

const ALLOCATED_BIT: u32 = 0x1;
const SIZE_MASK: u32 = !(ALIGNMENT as u32 - 1);

#[inline]
pub(crate) const fn round_up(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Returns the block size needed to serve a request for `request` payload
/// bytes, or `None` if no block can be that large.
pub(crate) fn block_size_for(request: usize) -> Option<usize> {
    let padded = request.checked_add(OVERHEAD + ALIGNMENT - 1)? & !(ALIGNMENT - 1);

    (padded <= MAX_BLOCK_SIZE).then(|| cmp::max(padded, MIN_BLOCK_SIZE))
}

/// The decoded contents of a boundary tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    size: usize,
    allocated: bool,
}

impl Tag {
    /// The tag of the prologue and epilogue sentinels.
    pub(crate) const SENTINEL: Tag = Tag {
        size: 0,
        allocated: true,
    };

    #[inline]
    pub(crate) fn allocated(size: usize) -> Tag {
        Tag {
            size,
            allocated: true,
        }
    }

    #[inline]
    pub(crate) fn free(size: usize) -> Tag {
        Tag {
            size,
            allocated: false,
        }
    }

    /// Returns the block size recorded in the tag, including overhead.
    #[inline]
    pub fn size(self) -> usize {
        self.size
    }

    /// Returns `true` if the tag marks its block as allocated.
    #[inline]
    pub fn is_allocated(self) -> bool {
        self.allocated
    }

    #[inline]
    pub(crate) fn encode(self) -> u32 {
        debug_assert_eq!(self.size % ALIGNMENT, 0);
        debug_assert!(self.size <= MAX_BLOCK_SIZE);

        self.size as u32 | if self.allocated { ALLOCATED_BIT } else { 0 }
    }

    #[inline]
    pub(crate) fn decode(word: u32) -> Tag {
        Tag {
            size: (word & SIZE_MASK) as usize,
            allocated: word & ALLOCATED_BIT != 0,
        }
    }

    /// Returns `true` if `word` has bits set that no encoded tag sets, which
    /// means the size it was written with was not a multiple of the alignment.
    #[inline]
    pub(crate) fn has_stray_bits(word: u32) -> bool {
        word & !(SIZE_MASK | ALLOCATED_BIT) != 0
    }
}

/// A handle to a block: the offset of its header from the region base.
///
/// Offset zero always holds the prologue, so a block offset is never zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Block(NonZeroUsize);

impl Block {
    #[inline]
    pub fn at(ofs: usize) -> Option<Block> {
        NonZeroUsize::new(ofs).map(Block)
    }

    /// Returns the block whose payload starts at `ofs`.
    #[inline]
    pub fn from_payload(ofs: usize) -> Option<Block> {
        ofs.checked_sub(WORD).and_then(Block::at)
    }

    #[inline]
    pub fn offset(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub fn payload(self) -> usize {
        self.0.get() + WORD
    }

    #[inline]
    pub fn tag(self, base: BasePtr) -> Tag {
        Tag::decode(base.read_word(self.offset()))
    }

    /// Reads the footer, locating it with the size recorded in the header.
    #[inline]
    pub fn footer(self, base: BasePtr) -> Tag {
        let size = self.tag(base).size();
        Tag::decode(base.read_word(self.offset() + size - WORD))
    }

    /// Writes `tag` to both the header and the footer.
    #[inline]
    pub fn set_tags(self, base: BasePtr, tag: Tag) {
        debug_assert!(tag.size() >= MIN_BLOCK_SIZE);

        let word = tag.encode();
        base.write_word(self.offset(), word);
        base.write_word(self.offset() + tag.size() - WORD, word);
    }

    /// Reads the footer of the physically preceding block.
    #[inline]
    pub fn left_tag(self, base: BasePtr) -> Tag {
        Tag::decode(base.read_word(self.offset() - WORD))
    }

    /// Returns the preceding block, given its size from [`Block::left_tag`].
    #[inline]
    pub fn left(self, left_size: usize) -> Option<Block> {
        self.offset().checked_sub(left_size).and_then(Block::at)
    }

    /// Returns the following block, given this block's size.
    #[inline]
    pub fn right(self, size: usize) -> Block {
        Block(self.0.saturating_add(size))
    }

    #[inline]
    pub fn next_free(self, base: BasePtr) -> Option<Block> {
        Block::at(base.read_link(self.payload()))
    }

    #[inline]
    pub fn set_next_free(self, base: BasePtr, next: Option<Block>) {
        base.write_link(self.payload(), next.map_or(0, Block::offset));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_block_holds_tags_and_link() {
        assert_eq!(MIN_BLOCK_SIZE, 16);
        assert_eq!(OVERHEAD, 8);
    }

    #[test]
    fn block_size_adds_overhead_and_rounds_up() {
        assert_eq!(block_size_for(1), Some(16));
        assert_eq!(block_size_for(8), Some(16));
        assert_eq!(block_size_for(9), Some(24));
        assert_eq!(block_size_for(10), Some(24));
        assert_eq!(block_size_for(50), Some(64));
        assert_eq!(block_size_for(100), Some(112));
        assert_eq!(block_size_for(4096), Some(4104));
    }

    #[test]
    fn oversized_requests_have_no_block_size() {
        assert_eq!(block_size_for(usize::MAX), None);
        assert_eq!(block_size_for(MAX_BLOCK_SIZE), None);
        assert_eq!(block_size_for(MAX_BLOCK_SIZE - OVERHEAD), Some(MAX_BLOCK_SIZE));
    }

    #[test]
    fn tags_encode_size_and_allocated_bit() {
        assert_eq!(Tag::allocated(24).encode(), 25);
        assert_eq!(Tag::free(24).encode(), 24);
        assert_eq!(Tag::SENTINEL.encode(), 1);

        let tag = Tag::decode(4105);
        assert_eq!(tag.size(), 4104);
        assert!(tag.is_allocated());
        assert_eq!(Tag::decode(Tag::free(4096).encode()), Tag::free(4096));
    }

    #[test]
    fn stray_bits_flag_unaligned_sizes() {
        assert!(!Tag::has_stray_bits(Tag::allocated(32).encode()));
        assert!(!Tag::has_stray_bits(Tag::free(32).encode()));
        assert!(Tag::has_stray_bits(12));
        assert!(Tag::has_stray_bits(27));
    }

    #[test]
    fn payload_and_block_offsets_correspond() {
        let block = Block::at(4).unwrap();
        assert_eq!(block.payload(), 8);
        assert_eq!(Block::from_payload(8), Some(block));
        assert_eq!(Block::from_payload(4), None);
        assert_eq!(Block::at(0), None);
        assert_eq!(block.right(24).offset(), 28);
        assert_eq!(block.right(24).left(24), Some(block));
    }
}
