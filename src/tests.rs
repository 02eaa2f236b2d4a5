#![cfg(test)]
extern crate std;

use core::{cmp, ptr::NonNull, slice};

use crate::{Global, MemLib, SegAlloc};

use alloc::vec::Vec;
use quickcheck::{Arbitrary, Gen, QuickCheck};

type Heap = SegAlloc<MemLib<Global>>;

// Heap parameters ============================================================

#[derive(Clone, Debug)]
struct HeapParams {
    capacity: usize,
}

impl Arbitrary for HeapParams {
    fn arbitrary(g: &mut Gen) -> Self {
        // Small capacities exercise exhaustion; the floor leaves room for the
        // sentinels and a few small blocks.
        HeapParams {
            capacity: 64 + usize::arbitrary(g) % (1 << 18),
        }
    }
}

// Operations =================================================================

enum AllocatorOpTag {
    Allocate,
    Zeroed,
    Realloc,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a buffer that can hold `len` `u32` values.
    Allocate { len: usize },
    /// Allocate a zeroed buffer of `len` `u32` values.
    Zeroed { len: usize },
    /// Resize an existing allocation to hold `len` `u32` values.
    ///
    /// Given `n` outstanding allocations, the allocation to resize is at
    /// index `index % n`.
    Realloc { index: usize, len: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[
                AllocatorOpTag::Allocate,
                AllocatorOpTag::Zeroed,
                AllocatorOpTag::Realloc,
                AllocatorOpTag::Free,
            ])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                len: limited_size(g),
            },
            AllocatorOpTag::Zeroed => AllocatorOp::Zeroed {
                len: limited_size(g),
            },
            AllocatorOpTag::Realloc => AllocatorOp::Realloc {
                index: usize::arbitrary(g),
                len: limited_size(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

// Checker ====================================================================

type OpId = u32;

const WORD_BYTES: usize = core::mem::size_of::<u32>();

/// A live allocation, painted with the id of the operation that produced it.
struct Allocation {
    id: OpId,
    ptr: NonNull<u32>,
    len: usize,
}

impl Allocation {
    fn words(&self) -> &[u32] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn paint(&mut self, id: OpId) {
        self.id = id;
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }.fill(id);
    }

    fn is_painted(&self) -> bool {
        self.words().iter().all(|&w| w == self.id)
    }
}

struct HeapChecker {
    heap: Heap,
    allocations: Vec<Allocation>,
    num_ops: u32,
    check_each_op: bool,
}

impl HeapChecker {
    fn new(params: HeapParams, capacity: usize, check_each_op: bool) -> Self {
        HeapChecker {
            heap: SegAlloc::new(MemLib::try_new(params.capacity).unwrap()).unwrap(),
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
            check_each_op,
        }
    }

    fn is_consistent(&self) -> bool {
        if !self.heap.violations().is_empty() {
            return false;
        }

        let stats = self.heap.stats();
        stats.allocated_blocks == self.allocations.len()
            && stats.allocated_bytes + stats.free_bytes + 8 == stats.heap_size
    }

    fn push(&mut self, id: OpId, ptr: NonNull<u8>, len: usize) -> bool {
        if ptr.as_ptr() as usize % crate::ALIGNMENT != 0 {
            return false;
        }

        if self
            .heap
            .usable_size(ptr)
            .map_or(true, |usable| usable < len * WORD_BYTES)
        {
            return false;
        }

        self.allocations.push(Allocation {
            id,
            ptr: ptr.cast(),
            len,
        });

        true
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { len } => {
                let Some(ptr) = self.heap.allocate(len * WORD_BYTES) else {
                    return true;
                };

                if !self.push(op_id, ptr, len) {
                    return false;
                }

                self.allocations.last_mut().unwrap().paint(op_id);
            }

            AllocatorOp::Zeroed { len } => {
                let Some(ptr) = self.heap.allocate_zeroed(len, WORD_BYTES) else {
                    return true;
                };

                if !self.push(op_id, ptr, len) {
                    return false;
                }

                let a = self.allocations.last_mut().unwrap();
                a.id = 0;
                if !a.is_painted() {
                    return false;
                }
                a.paint(op_id);
            }

            AllocatorOp::Realloc { index, len } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let old = self.allocations.swap_remove(index);
                if !old.is_painted() {
                    return false;
                }

                let res = unsafe {
                    self.heap
                        .reallocate(Some(old.ptr.cast()), len * WORD_BYTES)
                };

                match res {
                    Some(ptr) => {
                        if !self.push(op_id, ptr, len) {
                            return false;
                        }

                        let new = self.allocations.last_mut().unwrap();
                        let kept = cmp::min(old.len, len);
                        if !new.words()[..kept].iter().all(|&w| w == old.id) {
                            return false;
                        }
                        new.paint(op_id);
                    }

                    // Resizing to zero releases the block.
                    None if len == 0 => {
                        if self.heap.usable_size(old.ptr.cast()).is_some() {
                            return false;
                        }
                    }

                    // A failed resize must leave the original untouched.
                    None => {
                        if !old.is_painted() {
                            return false;
                        }
                        self.allocations.push(old);
                    }
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !a.is_painted() {
                    return false;
                }

                unsafe { self.heap.release(Some(a.ptr.cast())) };
            }
        }

        !self.check_each_op || self.is_consistent()
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        if !self.is_consistent() {
            return false;
        }

        // Free any outstanding allocations.
        for a in self.allocations.drain(..) {
            if !a.is_painted() {
                return false;
            }

            unsafe { self.heap.release(Some(a.ptr.cast())) };
        }

        let stats = self.heap.stats();
        stats.allocated_blocks == 0 && self.heap.consistency_check(false) == 0
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

fn check_each_op(params: HeapParams, ops: Vec<AllocatorOp>) -> bool {
    let mut checker = HeapChecker::new(params, ops.capacity(), true);
    checker.run(ops)
}

fn check_at_end(params: HeapParams, ops: Vec<AllocatorOp>) -> bool {
    let mut checker = HeapChecker::new(params, ops.capacity(), false);
    checker.run(ops)
}

#[test]
fn heap_is_consistent_after_every_operation() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check_each_op as fn(_, _) -> bool);
}

#[test]
fn allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check_at_end as fn(_, _) -> bool);
}

#[test]
fn released_neighbors_never_stay_adjacent() {
    fn prop(sizes: Vec<u16>, order: Vec<usize>) -> bool {
        let mut heap: Heap = SegAlloc::new(MemLib::try_new(1 << 22).unwrap()).unwrap();

        let mut live: Vec<_> = sizes
            .iter()
            .filter_map(|&size| heap.allocate(usize::from(size) + 1))
            .collect();

        for i in order {
            if live.is_empty() {
                break;
            }

            let ptr = live.swap_remove(i % live.len());
            unsafe { heap.release(Some(ptr)) };

            if heap.consistency_check(false) != 0 {
                return false;
            }
        }

        true
    }

    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(prop as fn(_, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
