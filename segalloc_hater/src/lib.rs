#![deny(unsafe_op_in_unsafe_fn)]

use std::{fmt, ptr::NonNull};

use alloc_hater::Subject;
use segalloc::{AllocInitError, Global, MemLib, SegAlloc};

/// Returned when the heap cannot satisfy a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("heap request failed")
    }
}

/// A [`SegAlloc`] over a [`MemLib`] heap, driven as an evaluation subject.
pub struct SegSubject {
    heap: SegAlloc<MemLib<Global>>,
    check_each_op: bool,
}

impl SegSubject {
    /// Creates a subject over a fresh heap of `capacity` bytes.
    ///
    /// If `check_each_op` is set, the heap checker runs after every operation.
    pub fn new(capacity: usize, check_each_op: bool) -> Result<Self, AllocInitError> {
        let heap = SegAlloc::new(MemLib::try_new(capacity)?)?;

        Ok(SegSubject {
            heap,
            check_each_op,
        })
    }

    /// Returns the heap under evaluation.
    pub fn heap(&self) -> &SegAlloc<MemLib<Global>> {
        &self.heap
    }
}

impl Subject for SegSubject {
    type AllocError = OutOfMemory;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::AllocError> {
        self.heap.allocate(size).ok_or(OutOfMemory)
    }

    fn allocate_zeroed(
        &mut self,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, Self::AllocError> {
        self.heap
            .allocate_zeroed(count, elem_size)
            .ok_or(OutOfMemory)
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, Self::AllocError> {
        unsafe { self.heap.reallocate(Some(ptr), size) }.ok_or(OutOfMemory)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        unsafe { self.heap.release(Some(ptr)) };
    }

    fn is_consistent(&self) -> bool {
        !self.check_each_op || self.heap.consistency_check(false) == 0
    }
}
