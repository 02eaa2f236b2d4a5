//! Per-class free lists.
//!
//! Each class heads a singly linked list threaded through the payloads of its
//! free blocks. Lists are kept in insertion order; insertion pushes at the
//! head. Without back links, removing a block that was not just found by a
//! search requires rescanning its list for the predecessor.

use crate::{
    base::BasePtr,
    block::{Block, LINK_SIZE},
    class::{SizeClass, NUM_CLASSES},
};

/// The bucket table.
#[derive(Clone, Debug)]
pub(crate) struct FreeLists {
    heads: [Option<Block>; NUM_CLASSES],
}

impl FreeLists {
    pub const fn new() -> FreeLists {
        FreeLists {
            heads: [None; NUM_CLASSES],
        }
    }

    #[inline]
    pub fn head(&self, class: SizeClass) -> Option<Block> {
        self.heads[class.index()]
    }

    /// Iterates over the blocks listed in `class`.
    ///
    /// Iteration stops early at an entry whose link field lies outside the
    /// region rather than following it.
    pub fn iter(&self, base: BasePtr, class: SizeClass) -> Iter {
        Iter {
            base,
            next: self.head(class),
        }
    }

    /// Finds a free block of at least `target` bytes.
    ///
    /// The class of `target` is searched first-fit, and the block is returned
    /// along with its predecessor in that list. Failing that, the head of the
    /// first non-empty larger class is returned with no predecessor; every
    /// block there exceeds the upper bound of `target`'s class.
    pub fn locate(&self, base: BasePtr, target: usize) -> Option<(Block, Option<Block>)> {
        let class = SizeClass::of(target);

        let mut pred = None;
        for block in self.iter(base, class) {
            if block.tag(base).size() >= target {
                return Some((block, pred));
            }

            pred = Some(block);
        }

        class
            .larger()
            .find_map(|larger| self.head(larger))
            .map(|block| (block, None))
    }

    /// Removes `block` from its list, given its predecessor in that list.
    ///
    /// The list is selected by the size in `block`'s header, so the header
    /// must not have been rewritten since the block was inserted.
    pub fn unlink(&mut self, base: BasePtr, block: Block, pred: Option<Block>) {
        let next = block.next_free(base);

        match pred {
            Some(p) => p.set_next_free(base, next),
            None => {
                let class = SizeClass::of(block.tag(base).size());
                debug_assert_eq!(self.heads[class.index()], Some(block));
                self.heads[class.index()] = next;
            }
        }
    }

    /// Pushes `block` onto the list for its current size.
    pub fn insert(&mut self, base: BasePtr, block: Block) {
        let class = SizeClass::of(block.tag(base).size());

        block.set_next_free(base, self.heads[class.index()]);
        self.heads[class.index()] = Some(block);
    }

    /// Rescans `block`'s list for its predecessor.
    ///
    /// Returns `None` if the block is not listed, or `Some(None)` if it is the
    /// head of its list.
    pub fn find_predecessor(&self, base: BasePtr, block: Block) -> Option<Option<Block>> {
        let class = SizeClass::of(block.tag(base).size());

        let mut pred = None;
        for cur in self.iter(base, class) {
            if cur == block {
                return Some(pred);
            }

            pred = Some(cur);
        }

        None
    }

    /// Removes `block` from its list without a known predecessor.
    ///
    /// Returns `false` if the block was not listed.
    pub fn remove(&mut self, base: BasePtr, block: Block) -> bool {
        match self.find_predecessor(base, block) {
            Some(pred) => {
                self.unlink(base, block, pred);
                true
            }
            None => false,
        }
    }
}

/// An iterator over the blocks of one free list.
pub(crate) struct Iter {
    base: BasePtr,
    next: Option<Block>,
}

impl Iterator for Iter {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.next.take()?;

        if self.base.contains(block.payload(), LINK_SIZE) {
            self.next = block.next_free(self.base);
        }

        Some(block)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::ptr::NonNull;
    use std::{vec, vec::Vec};

    use super::*;
    use crate::block::Tag;

    /// Lays out free blocks of the given sizes back to back from offset 8.
    fn blocks(words: &mut [u64], sizes: &[usize]) -> (BasePtr, Vec<Block>) {
        let ptr = NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap();
        let base = unsafe { BasePtr::new(ptr, words.len() * 8).unwrap() };

        let mut ofs = 8;
        let mut out = Vec::new();
        for &size in sizes {
            let block = Block::at(ofs).unwrap();
            block.set_tags(base, Tag::free(size));
            out.push(block);
            ofs += size;
        }

        (base, out)
    }

    fn listed(lists: &FreeLists, base: BasePtr, class: usize) -> Vec<Block> {
        lists
            .iter(base, SizeClass::from_index(class).unwrap())
            .collect()
    }

    #[test]
    fn insert_pushes_at_head_of_own_class() {
        let mut words = vec![0u64; 64];
        let (base, b) = blocks(&mut words, &[24, 32, 48, 200]);
        let mut lists = FreeLists::new();

        for &block in &b {
            lists.insert(base, block);
        }

        assert_eq!(listed(&lists, base, 0), [b[1], b[0]]);
        assert_eq!(listed(&lists, base, 1), [b[2]]);
        assert_eq!(listed(&lists, base, 3), [b[3]]);
        assert!(listed(&lists, base, 2).is_empty());
    }

    #[test]
    fn locate_is_first_fit_within_class() {
        let mut words = vec![0u64; 64];
        let (base, b) = blocks(&mut words, &[40, 64, 56]);
        let mut lists = FreeLists::new();

        // List order: 56, 64, 40.
        for &block in &b {
            lists.insert(base, block);
        }

        assert_eq!(lists.locate(base, 48), Some((b[2], None)));
        assert_eq!(lists.locate(base, 64), Some((b[1], Some(b[2]))));
    }

    #[test]
    fn locate_falls_back_to_first_nonempty_larger_class() {
        let mut words = vec![0u64; 256];
        let (base, b) = blocks(&mut words, &[40, 600, 304]);
        let mut lists = FreeLists::new();

        for &block in &b {
            lists.insert(base, block);
        }

        // Classes 2 and 3 are empty; class 4 holds 304 and wins over class 5.
        assert_eq!(lists.locate(base, 72), Some((b[2], None)));
        // Class 1 holds only 40, which is too small.
        assert_eq!(lists.locate(base, 48), Some((b[2], None)));
        assert_eq!(lists.locate(base, 4104), None);
    }

    #[test]
    fn unlink_patches_predecessor_or_head() {
        let mut words = vec![0u64; 64];
        let (base, b) = blocks(&mut words, &[24, 24, 24]);
        let mut lists = FreeLists::new();

        for &block in &b {
            lists.insert(base, block);
        }

        // List order: b2, b1, b0.
        lists.unlink(base, b[1], Some(b[2]));
        assert_eq!(listed(&lists, base, 0), [b[2], b[0]]);

        lists.unlink(base, b[2], None);
        assert_eq!(listed(&lists, base, 0), [b[0]]);
    }

    #[test]
    fn find_predecessor_rescans_the_list() {
        let mut words = vec![0u64; 64];
        let (base, b) = blocks(&mut words, &[24, 24, 24, 48]);
        let mut lists = FreeLists::new();

        for &block in &b[..3] {
            lists.insert(base, block);
        }

        assert_eq!(lists.find_predecessor(base, b[2]), Some(None));
        assert_eq!(lists.find_predecessor(base, b[0]), Some(Some(b[1])));
        assert_eq!(lists.find_predecessor(base, b[3]), None);

        assert!(lists.remove(base, b[0]));
        assert!(!lists.remove(base, b[3]));
        assert_eq!(listed(&lists, base, 0), [b[2], b[1]]);
    }
}
