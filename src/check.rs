//! Heap consistency checking and statistics.
//!
//! The checker walks the block chain from the prologue to the epilogue, then
//! walks every free list, and reports each inconsistency it finds. It reads
//! only within the current extent of the heap and bounds every list walk, so
//! a corrupted heap produces reports rather than panics or hangs. Nothing is
//! repaired.

use core::fmt;

use log::{debug, warn};

use crate::{
    block::{Block, Tag, ALIGNMENT, MIN_BLOCK_SIZE, WORD},
    class::{SizeClass, NUM_CLASSES},
    provider::HeapProvider,
    seg::SegAlloc,
};

#[cfg(any(feature = "alloc", test))]
use alloc::vec::Vec;

/// An inconsistency found by the heap checker.
///
/// Offsets are block header offsets from the start of the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// The prologue tag is not a zero-sized allocated tag.
    BadPrologue,
    /// The chain did not end in a zero-sized allocated tag at the heap top.
    BadEpilogue {
        /// Where the chain ended.
        offset: usize,
    },
    /// A block's size is not a multiple of the alignment or is below the
    /// minimum block size.
    BadSize {
        /// The offending block.
        offset: usize,
        /// The size recorded in its header.
        size: usize,
    },
    /// A block extends past the top of the heap.
    OutOfBounds {
        /// The offending block.
        offset: usize,
        /// The size recorded in its header.
        size: usize,
    },
    /// A block's header and footer disagree.
    TagMismatch {
        /// The offending block.
        offset: usize,
        /// The decoded header.
        header: Tag,
        /// The decoded footer.
        footer: Tag,
    },
    /// A block's payload is not aligned.
    Misaligned {
        /// The offending block.
        offset: usize,
    },
    /// A free block directly follows another free block.
    AdjacentFree {
        /// The second of the two blocks.
        offset: usize,
    },
    /// A free block is missing from the list for its size.
    NotListed {
        /// The offending block.
        offset: usize,
    },
    /// A free list holds an allocated block.
    ListedAllocated {
        /// The list holding the block.
        class: SizeClass,
        /// The offending block.
        offset: usize,
    },
    /// A free list holds a block whose size is outside the list's bounds.
    WrongClass {
        /// The list holding the block.
        class: SizeClass,
        /// The offending block.
        offset: usize,
        /// The size recorded in its header.
        size: usize,
    },
    /// A free list entry lies outside the heap.
    ListOutOfBounds {
        /// The list holding the entry.
        class: SizeClass,
        /// The offset of the entry.
        offset: usize,
    },
    /// A free list never terminates.
    ListCycle {
        /// The cyclic list.
        class: SizeClass,
    },
    /// The chain and the lists disagree on the number of free blocks.
    CountMismatch {
        /// Free blocks found walking the chain.
        chain: usize,
        /// Entries found walking the lists.
        listed: usize,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Violation::BadPrologue => f.write_str("invalid prologue tag"),
            Violation::BadEpilogue { offset } => {
                write!(f, "block chain ends at {offset:#x} without an epilogue at the heap top")
            }
            Violation::BadSize { offset, size } => {
                write!(f, "block {offset:#x} has invalid size {size}")
            }
            Violation::OutOfBounds { offset, size } => {
                write!(f, "block {offset:#x} of {size} bytes extends past the heap")
            }
            Violation::TagMismatch {
                offset,
                header,
                footer,
            } => write!(
                f,
                "block {offset:#x} header {header:?} does not match footer {footer:?}"
            ),
            Violation::Misaligned { offset } => {
                write!(f, "block {offset:#x} payload is not aligned")
            }
            Violation::AdjacentFree { offset } => {
                write!(f, "free block {offset:#x} follows another free block")
            }
            Violation::NotListed { offset } => {
                write!(f, "free block {offset:#x} is not in its free list")
            }
            Violation::ListedAllocated { class, offset } => {
                write!(f, "{class} lists allocated block {offset:#x}")
            }
            Violation::WrongClass {
                class,
                offset,
                size,
            } => write!(f, "{class} lists block {offset:#x} of {size} bytes"),
            Violation::ListOutOfBounds { class, offset } => {
                write!(f, "{class} links to {offset:#x}, outside the heap")
            }
            Violation::ListCycle { class } => write!(f, "{class} list does not terminate"),
            Violation::CountMismatch { chain, listed } => write!(
                f,
                "{chain} free blocks in the heap but {listed} in the free lists"
            ),
        }
    }
}

/// A summary of a heap's blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes obtained from the provider, sentinels included.
    pub heap_size: usize,
    /// Number of allocated blocks.
    pub allocated_blocks: usize,
    /// Total size of allocated blocks, overhead included.
    pub allocated_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Total size of free blocks, overhead included.
    pub free_bytes: usize,
    /// Number of free blocks whose size falls in each class.
    pub free_per_class: [usize; NUM_CLASSES],
}

impl<P: HeapProvider> SegAlloc<P> {
    /// An upper bound on the length of any acyclic free list.
    fn list_limit(&self) -> usize {
        self.base.extent() / MIN_BLOCK_SIZE + 1
    }

    /// Returns `true` if `block` is reachable in the list for `size`.
    fn is_listed(&self, block: Block, size: usize) -> bool {
        self.free
            .iter(self.base, SizeClass::of(size))
            .take(self.list_limit())
            .any(|listed| listed == block)
    }

    /// Checks the heap, passing each violation found to `report`.
    ///
    /// Every violation is also logged at `warn` level. If `verbose` is `true`,
    /// every block and list entry visited is logged at `debug` level.
    pub fn check_heap<F>(&self, verbose: bool, mut report: F)
    where
        F: FnMut(Violation),
    {
        let mut report = |v: Violation| {
            warn!("heap check: {v}");
            report(v);
        };

        let base = self.base;
        let extent = base.extent();
        let payload_aligned =
            |block: Block| (base.addr().get() + block.payload()) % ALIGNMENT == 0;

        if !base.contains(0, WORD) || Tag::decode(base.read_word(0)) != Tag::SENTINEL {
            report(Violation::BadPrologue);
        }

        let mut chain_free = 0;
        let mut chain_complete = false;
        let mut prev_free = false;
        let mut ofs = WORD;

        while base.contains(ofs, WORD) {
            let word = base.read_word(ofs);
            let tag = Tag::decode(word);

            if tag.size() == 0 && !Tag::has_stray_bits(word) {
                if tag.is_allocated() && ofs + WORD == extent {
                    chain_complete = true;
                } else {
                    report(Violation::BadEpilogue { offset: ofs });
                }
                break;
            }

            let Some(block) = Block::at(ofs) else { break };

            if verbose {
                debug!(
                    "block {ofs:#x}: {} bytes, {}",
                    tag.size(),
                    if tag.is_allocated() { "allocated" } else { "free" }
                );
            }

            if Tag::has_stray_bits(word) || tag.size() < MIN_BLOCK_SIZE {
                report(Violation::BadSize {
                    offset: ofs,
                    size: (word & !1) as usize,
                });
                break;
            }

            if !base.contains(ofs, tag.size()) {
                report(Violation::OutOfBounds {
                    offset: ofs,
                    size: tag.size(),
                });
                break;
            }

            let footer = block.footer(base);
            if footer != tag {
                report(Violation::TagMismatch {
                    offset: ofs,
                    header: tag,
                    footer,
                });
            }

            if !payload_aligned(block) {
                report(Violation::Misaligned { offset: ofs });
            }

            if !tag.is_allocated() {
                chain_free += 1;

                if prev_free {
                    report(Violation::AdjacentFree { offset: ofs });
                }

                if !self.is_listed(block, tag.size()) {
                    report(Violation::NotListed { offset: ofs });
                }
            }

            prev_free = !tag.is_allocated();
            ofs += tag.size();
        }

        if !chain_complete && !base.contains(ofs, WORD) {
            report(Violation::BadEpilogue { offset: ofs });
        }

        let limit = self.list_limit();
        let mut listed = 0;
        let mut lists_complete = true;

        for class in SizeClass::all() {
            for (steps, block) in self.free.iter(base, class).enumerate() {
                if steps == limit {
                    report(Violation::ListCycle { class });
                    lists_complete = false;
                    break;
                }

                let offset = block.offset();
                if !base.contains(offset, MIN_BLOCK_SIZE) {
                    report(Violation::ListOutOfBounds { class, offset });
                    lists_complete = false;
                    break;
                }

                let tag = block.tag(base);
                if verbose {
                    debug!("{class}: block {offset:#x}, {} bytes", tag.size());
                }

                listed += 1;

                if !payload_aligned(block) {
                    report(Violation::Misaligned { offset });
                }

                if tag.is_allocated() {
                    report(Violation::ListedAllocated { class, offset });
                } else if !class.admits(tag.size()) {
                    report(Violation::WrongClass {
                        class,
                        offset,
                        size: tag.size(),
                    });
                }
            }
        }

        if chain_complete && lists_complete && chain_free != listed {
            report(Violation::CountMismatch {
                chain: chain_free,
                listed,
            });
        }
    }

    /// Checks the heap, logging every violation found.
    ///
    /// Returns the number of violations. A consistent heap returns zero.
    pub fn consistency_check(&self, verbose: bool) -> usize {
        let mut count = 0;
        self.check_heap(verbose, |_| count += 1);

        if verbose {
            debug!("heap check finished with {count} violations");
        }

        count
    }

    /// Checks the heap, collecting every violation found.
    #[cfg(any(feature = "alloc", test))]
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn violations(&self) -> Vec<Violation> {
        let mut found = Vec::new();
        self.check_heap(false, |v| found.push(v));
        found
    }

    /// Summarizes the blocks in the heap.
    ///
    /// The walk stops early at the first malformed block; run the checker to
    /// find out why.
    pub fn stats(&self) -> HeapStats {
        let base = self.base;
        let mut stats = HeapStats {
            heap_size: base.extent(),
            ..HeapStats::default()
        };

        let mut ofs = WORD;
        while base.contains(ofs, WORD) {
            let tag = Tag::decode(base.read_word(ofs));
            if tag.size() < MIN_BLOCK_SIZE || !base.contains(ofs, tag.size()) {
                break;
            }

            if tag.is_allocated() {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += tag.size();
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += tag.size();
                stats.free_per_class[SizeClass::of(tag.size()).index()] += 1;
            }

            ofs += tag.size();
        }

        stats
    }
}
