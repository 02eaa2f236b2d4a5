//! The segregated free-list allocator.

use core::{cmp, fmt, ptr::NonNull};

use log::{debug, trace, warn};

use crate::{
    base::BasePtr,
    block::{block_size_for, Block, Tag, ALIGNMENT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, OVERHEAD, WORD},
    free_list::FreeLists,
    provider::{nonzero_addr, HeapProvider},
    AllocInitError,
};

/// Bytes granted at initialization: the prologue and epilogue tags.
const PREAMBLE: usize = 2 * WORD;

/// A free block is split only if the remainder would exceed this many bytes.
const SPLIT_THRESHOLD: usize = 16;

/// A segregated free-list allocator over a region supplied by `P`.
///
/// The heap is laid out as a prologue tag, a chain of blocks, and an epilogue
/// tag at the top. Both sentinels are permanently allocated and zero-sized,
/// so a neighbor lookup from any block stops at an allocated tag.
/// Each allocator is an independent value; several may coexist.
///
/// Payload pointers are aligned to [`ALIGNMENT`] bytes.
///
/// [`ALIGNMENT`]: crate::ALIGNMENT
pub struct SegAlloc<P: HeapProvider> {
    pub(crate) base: BasePtr,
    pub(crate) free: FreeLists,
    provider: P,
}

impl<P: HeapProvider> SegAlloc<P> {
    /// Constructs a new `SegAlloc`, writing the heap sentinels into `provider`.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the following are true:
    /// - The provider's region is not aligned to [`ALIGNMENT`] or has already
    ///   been grown.
    /// - The provider cannot grant the bytes for the sentinels.
    ///
    /// [`ALIGNMENT`]: crate::ALIGNMENT
    pub fn new(mut provider: P) -> Result<SegAlloc<P>, AllocInitError> {
        let lower = provider.lower_bound();
        let lower_addr = nonzero_addr(lower).get();

        if lower_addr % ALIGNMENT != 0 || provider.upper_bound() != lower_addr {
            return Err(AllocInitError::InvalidConfig);
        }

        let start = provider
            .grow(PREAMBLE)
            .map_err(|_| AllocInitError::BootstrapFailed)?;

        if start != lower {
            return Err(AllocInitError::InvalidConfig);
        }

        // SAFETY: the provider guarantees that granted bytes remain valid for
        // reads and writes until it is dropped, and the returned allocator
        // owns the provider.
        let base =
            unsafe { BasePtr::new(lower, PREAMBLE) }.ok_or(AllocInitError::InvalidLocation)?;

        base.write_word(0, Tag::SENTINEL.encode());
        base.write_word(WORD, Tag::SENTINEL.encode());

        debug!("heap initialized at {lower:p}");

        Ok(SegAlloc {
            base,
            free: FreeLists::new(),
            provider,
        })
    }

    /// Attempts to allocate a block with room for `size` bytes.
    ///
    /// The free lists are searched first; on a miss the heap is extended by
    /// exactly the block size needed.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// Returns `None` if `size` is zero or if the provider cannot supply
    /// enough memory.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let block = self.allocate_block(size)?;

        Some(self.base.with_offset(block.payload()))
    }

    fn allocate_block(&mut self, size: usize) -> Option<Block> {
        if size == 0 {
            return None;
        }

        let Some(needed) = block_size_for(size) else {
            debug!("allocate({size}): larger than any block");
            return None;
        };

        let block = match self.free.locate(self.base, needed) {
            Some((block, pred)) => self.place(block, pred, needed),
            None => self.extend(needed)?,
        };

        trace!(
            "allocate({size}) -> block {:#x} ({} bytes)",
            block.offset(),
            block.tag(self.base).size()
        );

        Some(block)
    }

    /// Commits the free block `block` to an allocation of `needed` bytes.
    ///
    /// The block is split if the remainder is large enough to stand alone.
    /// The remainder cannot have a free neighbor: its left neighbor is the
    /// allocation, and its right neighbor bordered a free block before the
    /// split, so it is allocated.
    fn place(&mut self, block: Block, pred: Option<Block>, needed: usize) -> Block {
        let base = self.base;
        let size = block.tag(base).size();

        self.free.unlink(base, block, pred);

        if size - needed > SPLIT_THRESHOLD {
            let rest = block.right(needed);

            block.set_tags(base, Tag::allocated(needed));
            rest.set_tags(base, Tag::free(size - needed));
            self.free.insert(base, rest);

            trace!(
                "split block {:#x}: {needed} + {} bytes",
                block.offset(),
                size - needed
            );
        } else {
            block.set_tags(base, Tag::allocated(size));
        }

        block
    }

    /// Grows the heap by `size` bytes, formatted as one allocated block.
    ///
    /// The new block starts at the old epilogue, and a new epilogue is written
    /// at the new top. A free block at the old top is not merged into it.
    fn extend(&mut self, size: usize) -> Option<Block> {
        let top = self.base.extent();

        if top.checked_add(size).map_or(true, |end| end > MAX_BLOCK_SIZE) {
            debug!("cannot extend heap by {size} bytes: heap size limit reached");
            return None;
        }

        let start = match self.provider.grow(size) {
            Ok(start) => start,
            Err(e) => {
                debug!("cannot extend heap by {size} bytes: {e}");
                return None;
            }
        };

        if nonzero_addr(start).get() != self.base.addr().get() + top {
            warn!("provider granted discontiguous memory at {start:p}");
            return None;
        }

        // SAFETY: the provider granted `size` bytes directly after the
        // current top of the heap.
        unsafe { self.base.grow(size) }?;

        let block = Block::at(top - WORD)?;
        block.set_tags(self.base, Tag::allocated(size));
        self.base
            .write_word(block.offset() + size, Tag::SENTINEL.encode());

        debug!("extended heap by {size} bytes to {} bytes", self.base.extent());

        Some(block)
    }

    /// Resolves a payload pointer to its block, if it denotes an allocated
    /// block in this heap.
    ///
    /// Both boundary tags must agree. Payload bytes that mimic a header and a
    /// matching footer at an interior pointer are not detected.
    fn allocated_block(&self, ptr: NonNull<u8>) -> Option<(Block, Tag)> {
        let ofs = self.base.offset_of(ptr)?;
        if ofs % ALIGNMENT != 0 {
            return None;
        }

        let block = Block::from_payload(ofs)?;
        let tag = block.tag(self.base);

        (tag.is_allocated()
            && tag.size() >= MIN_BLOCK_SIZE
            && self.base.contains(block.offset(), tag.size())
            && block.footer(self.base) == tag)
        .then_some((block, tag))
    }

    /// Releases the block whose payload is at `ptr`.
    ///
    /// The block is pushed onto its class list and then merged with any free
    /// physical neighbor. Releasing `None` does nothing. A pointer whose
    /// header and footer do not describe an allocated block of this heap is
    /// logged and ignored.
    ///
    /// # Safety
    ///
    /// If `ptr` is `Some`, it must denote a block of memory [*currently
    /// allocated*] via this allocator, and must not be used afterwards.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    pub unsafe fn release(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };

        let Some((block, tag)) = self.allocated_block(ptr) else {
            warn!("release({ptr:p}): not an allocated block of this heap");
            return;
        };

        let base = self.base;
        block.set_tags(base, Tag::free(tag.size()));
        self.free.insert(base, block);

        self.coalesce(block, tag.size());
    }

    /// Merges the just-released `block` with its free neighbors.
    ///
    /// `block` must be the head of its class list. The merged block takes the
    /// lowest address among the participants and is reinserted by its new
    /// size; the tags of the other participants become stale.
    fn coalesce(&mut self, block: Block, size: usize) {
        let base = self.base;
        let left_tag = block.left_tag(base);
        let right = block.right(size);
        let right_tag = right.tag(base);

        let (merged, merged_size) = match (left_tag.is_allocated(), right_tag.is_allocated()) {
            (true, true) => return,

            (false, true) => {
                let Some(left) = block.left(left_tag.size()) else {
                    return;
                };

                self.free.unlink(base, block, None);
                let removed = self.free.remove(base, left);
                debug_assert!(removed, "free left neighbor was not listed");

                (left, left_tag.size() + size)
            }

            (true, false) => {
                self.free.unlink(base, block, None);
                let removed = self.free.remove(base, right);
                debug_assert!(removed, "free right neighbor was not listed");

                (block, size + right_tag.size())
            }

            (false, false) => {
                let Some(left) = block.left(left_tag.size()) else {
                    return;
                };

                self.free.unlink(base, block, None);
                let removed = self.free.remove(base, right) & self.free.remove(base, left);
                debug_assert!(removed, "free neighbor was not listed");

                (left, left_tag.size() + size + right_tag.size())
            }
        };

        merged.set_tags(base, Tag::free(merged_size));
        self.free.insert(base, merged);

        trace!(
            "coalesced block {:#x} into {:#x} ({merged_size} bytes)",
            block.offset(),
            merged.offset()
        );
    }

    /// Moves an allocation into a block with room for `size` bytes.
    ///
    /// A fresh block is always allocated; the first `min(old usable size,
    /// size)` bytes are copied into it and the old block is released.
    /// `None` behaves as [`allocate`], and a `size` of zero behaves as
    /// [`release`] and returns `None`.
    ///
    /// If the new block cannot be allocated, `None` is returned and the old
    /// block is left allocated and unmodified. A pointer that is rejected by
    /// [`release`] is logged and `None` is returned without touching the heap.
    ///
    /// # Safety
    ///
    /// If `ptr` is `Some`, it must denote a block of memory [*currently
    /// allocated*] via this allocator. Unless `None` is returned for a
    /// nonzero `size`, `ptr` must not be used afterwards.
    ///
    /// [`allocate`]: SegAlloc::allocate
    /// [`release`]: SegAlloc::release
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(old) = ptr else {
            return self.allocate(size);
        };

        if size == 0 {
            unsafe { self.release(Some(old)) };
            return None;
        }

        let Some((old_block, old_tag)) = self.allocated_block(old) else {
            warn!("reallocate({old:p}): not an allocated block of this heap");
            return None;
        };

        let new_block = self.allocate_block(size)?;

        let len = cmp::min(old_tag.size() - OVERHEAD, size);
        self.base.copy(old_block.payload(), new_block.payload(), len);

        unsafe { self.release(Some(old)) };

        Some(self.base.with_offset(new_block.payload()))
    }

    /// Allocates a zero-filled block for `count` elements of `elem_size`
    /// bytes each.
    ///
    /// Returns `None` if the total size overflows `usize`, is zero, or cannot
    /// be allocated. Nothing is written on failure.
    pub fn allocate_zeroed(&mut self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        let Some(size) = count.checked_mul(elem_size) else {
            debug!("allocate_zeroed({count}, {elem_size}): size overflows usize");
            return None;
        };

        let block = self.allocate_block(size)?;
        self.base.fill(block.payload(), size, 0);

        Some(self.base.with_offset(block.payload()))
    }

    /// Returns the number of payload bytes in the allocated block at `ptr`.
    ///
    /// This may exceed the size originally requested. Returns `None` if the
    /// header and footer at `ptr` do not describe an allocated block of this
    /// heap.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.allocated_block(ptr)
            .map(|(_, tag)| tag.size() - OVERHEAD)
    }

    /// Returns `true` if `ptr` points into this allocator's heap.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.base.offset_of(ptr).is_some()
    }

    /// Returns the number of bytes obtained from the provider so far.
    #[inline]
    pub fn heap_size(&self) -> usize {
        self.base.extent()
    }

    /// Returns a reference to the backing provider.
    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Decomposes the allocator, returning its provider.
    ///
    /// All outstanding allocations remain in the provider's region, but can
    /// no longer be released through this allocator.
    pub fn into_provider(self) -> P {
        self.provider
    }
}

// SAFETY: the base pointer refers only to memory owned by the provider.
unsafe impl<P: HeapProvider + Send> Send for SegAlloc<P> {}

impl<P: HeapProvider> fmt::Debug for SegAlloc<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegAlloc")
            .field("base", &self.base.ptr())
            .field("heap_size", &self.heap_size())
            .field("free", &self.free)
            .finish()
    }
}
