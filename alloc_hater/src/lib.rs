//! A small library for ~~hating on~~ evaluating the correctness of allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through a sequence of arbitrary
//! [`AllocatorOp`]s. Every allocation is painted with the id of the operation
//! that produced it and verified before it is resized or released, so any
//! overlap between live allocations or any lost contents shows up as a
//! failed verification.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{cmp, mem::MaybeUninit, ptr::NonNull, slice};

/// Limit on arbitrary allocation sizes, expressed in bits.
const SIZE_LIMIT_BITS: u8 = 16;

/// An allocation size which implements `Arbitrary`.
///
/// Sizes are biased towards small values: a random bit width is chosen first,
/// then a size below that power of two.
#[derive(Clone, Copy, Debug)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let bits = u8::arbitrary(u)? % (SIZE_LIMIT_BITS + 1);
        let size = usize::arbitrary(u)? % (1_usize << bits);

        Ok(ArbSize(size))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    AllocZeroed,
    Realloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate `size` bytes.
    Alloc(usize),
    /// Allocate `count * elem_size` zeroed bytes.
    AllocZeroed { count: usize, elem_size: usize },
    /// Resize the live allocation at index `idx % n` to `size` bytes.
    Realloc { idx: usize, size: usize },
    /// Release the live allocation at index `idx % n`.
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::AllocZeroed => AllocatorOp::AllocZeroed {
                count: ArbSize::arbitrary(u)?.0,
                elem_size: usize::from(u8::arbitrary(u)? % 16),
            },
            AllocatorOpTag::Realloc => AllocatorOp::Realloc {
                idx: usize::arbitrary(u)?,
                // Resizing to zero is a release in disguise; keep it out of
                // the resize path.
                size: cmp::max(ArbSize::arbitrary(u)?.0, 1),
            },
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

/// An allocator under evaluation.
pub trait Subject {
    type AllocError;

    /// Allocates a block of at least `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::AllocError>;

    /// Allocates a zeroed block of at least `count * elem_size` bytes.
    fn allocate_zeroed(
        &mut self,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, Self::AllocError>;

    /// Moves the block at `ptr` into a block of at least `size` bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator. If this returns `Ok`, `ptr` must not be used afterwards.
    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, Self::AllocError>;

    /// Releases the block of memory pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator.
    unsafe fn release(&mut self, ptr: NonNull<u8>);

    /// Checks the allocator's internal invariants.
    fn is_consistent(&self) -> bool {
        true
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<u8>,
    // The number of bytes requested.
    len: usize,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` without painting it.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `len` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block` until
    ///   said `Block` is dropped.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Block {
        Block { ptr, len, id: 0 }
    }

    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The same invariants as [`Block::from_raw`] apply.
    pub unsafe fn init(ptr: NonNull<u8>, len: usize, id: u64) -> Block {
        let mut b = unsafe { Block::from_raw(ptr, len) };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice::from_raw_parts_mut(self.ptr.cast().as_ptr(), self.len) }
    }

    /// Returns the first `len` bytes of the block.
    ///
    /// Callers only read bytes that have been painted, zeroed, or copied.
    fn prefix(&self, len: usize) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), cmp::min(len, self.len)) }
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        unsafe { paint(self.as_uninit_slice_mut(), id) };
    }

    /// Returns `true` if every byte of `self` is zero.
    pub fn is_zeroed(&self) -> bool {
        self.prefix(self.len).iter().all(|&b| b == 0)
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        self.verify_prefix(self.len, self.id)
    }

    /// Verifies that the first `len` bytes of `self` hold the paint of `id`.
    pub fn verify_prefix(&self, len: usize, id: u64) -> bool {
        let id_bytes = id.to_le_bytes().into_iter().cycle();

        self.prefix(len)
            .iter()
            .zip(id_bytes)
            .all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: AllocatorOp,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    fn run_op(&mut self, blocks: &mut Blocks, op_id: u64, op: &AllocatorOp) -> bool {
        match *op {
            AllocatorOp::Alloc(size) => {
                if let Ok(ptr) = self.subject.allocate(size) {
                    blocks.push(unsafe { Block::init(ptr, size, op_id) });
                }
            }

            AllocatorOp::AllocZeroed { count, elem_size } => {
                let Some(len) = count.checked_mul(elem_size) else {
                    return self.subject.allocate_zeroed(count, elem_size).is_err();
                };

                if let Ok(ptr) = self.subject.allocate_zeroed(count, elem_size) {
                    let mut block = unsafe { Block::from_raw(ptr, len) };
                    if !block.is_zeroed() {
                        return false;
                    }

                    block.paint(op_id);
                    blocks.push(block);
                }
            }

            AllocatorOp::Realloc { idx, size } => {
                let Some(block) = blocks.remove_modulo(idx) else {
                    return true;
                };

                if !block.verify() {
                    return false;
                }

                match unsafe { self.subject.reallocate(block.ptr, size) } {
                    Ok(ptr) => {
                        let mut new = unsafe { Block::from_raw(ptr, size) };
                        if !new.verify_prefix(cmp::min(block.len, size), block.id) {
                            return false;
                        }

                        new.paint(op_id);
                        blocks.push(new);
                    }

                    Err(_) => {
                        if !block.verify() {
                            return false;
                        }

                        blocks.push(block);
                    }
                }
            }

            AllocatorOp::Dealloc(idx) => {
                let Some(mut block) = blocks.remove_modulo(idx) else {
                    return true;
                };

                if !block.verify() {
                    return false;
                }

                block.paint(op_id);
                unsafe { self.subject.release(block.ptr) };
            }
        }

        self.subject.is_consistent()
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();

            if !self.run_op(&mut blocks, op_id, &op) {
                return Err(Failed {
                    completed,
                    failed_op: op,
                });
            }

            completed.push(op);
        }

        for block in blocks {
            if !block.verify() {
                return Err(Failed {
                    completed,
                    failed_op: AllocatorOp::Dealloc(0),
                });
            }

            unsafe { self.subject.release(block.ptr) };
        }

        Ok(())
    }
}
