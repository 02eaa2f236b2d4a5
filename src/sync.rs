//! A lock-protected allocator usable from several threads.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{block::ALIGNMENT, provider::HeapProvider, seg::SegAlloc};

/// A [`SegAlloc`] behind a mutex.
///
/// Every operation takes the lock for its full duration, so calls from
/// different threads are serialized. A lock poisoned by a panicking thread is
/// recovered; the allocator's own operations do not panic on a consistent
/// heap.
///
/// `SyncSegAlloc` implements [`GlobalAlloc`] for layouts aligned to at most
/// [`ALIGNMENT`] bytes. Requests for stricter alignment fail.
///
/// [`ALIGNMENT`]: crate::ALIGNMENT
#[derive(Debug)]
#[cfg_attr(docs_rs, doc(cfg(feature = "std")))]
pub struct SyncSegAlloc<P: HeapProvider> {
    inner: Mutex<SegAlloc<P>>,
}

impl<P: HeapProvider> SyncSegAlloc<P> {
    /// Wraps `alloc` in a mutex.
    pub fn new(alloc: SegAlloc<P>) -> SyncSegAlloc<P> {
        SyncSegAlloc {
            inner: Mutex::new(alloc),
        }
    }

    /// Acquires exclusive access to the allocator.
    pub fn lock(&self) -> MutexGuard<'_, SegAlloc<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the wrapped allocator.
    pub fn into_inner(self) -> SegAlloc<P> {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

unsafe impl<P: HeapProvider + Send> GlobalAlloc for SyncSegAlloc<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.lock()
            .allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.lock()
            .allocate_zeroed(1, layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        unsafe { self.lock().release(NonNull::new(ptr)) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        unsafe { self.lock().reallocate(NonNull::new(ptr), new_size) }
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, vec::Vec};

    use super::*;
    use crate::{Global, MemLib};

    fn shared() -> SyncSegAlloc<MemLib<Global>> {
        SyncSegAlloc::new(SegAlloc::new(MemLib::try_new(1 << 20).unwrap()).unwrap())
    }

    #[test]
    fn global_alloc_round_trip() {
        let heap = shared();
        let layout = Layout::from_size_align(64, 8).unwrap();

        unsafe {
            let a = heap.alloc_zeroed(layout);
            assert!(!a.is_null());
            assert!((0..64).all(|i| *a.add(i) == 0));

            a.write_bytes(0x11, 64);
            let b = heap.realloc(a, layout, 256);
            assert!(!b.is_null());
            assert!((0..64).all(|i| *b.add(i) == 0x11));

            heap.dealloc(b, Layout::from_size_align(256, 8).unwrap());
        }

        assert_eq!(heap.lock().consistency_check(false), 0);
        assert_eq!(heap.lock().stats().allocated_blocks, 0);
    }

    #[test]
    fn overaligned_layouts_are_refused() {
        let heap = shared();
        let layout = Layout::from_size_align(64, 16).unwrap();

        assert!(unsafe { heap.alloc(layout) }.is_null());
        assert!(unsafe { heap.alloc_zeroed(layout) }.is_null());
        assert_eq!(heap.lock().heap_size(), 8);
    }

    #[test]
    fn threads_share_one_heap() {
        let heap = Arc::new(shared());

        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let heap = Arc::clone(&heap);
                thread::spawn(move || {
                    for round in 0..100usize {
                        let size = 1 + (round * 37 + usize::from(t) * 11) % 300;
                        let ptr = heap.lock().allocate(size).unwrap();

                        unsafe {
                            ptr.as_ptr().write_bytes(t, size);
                            assert!((0..size).all(|i| *ptr.as_ptr().add(i) == t));
                            heap.lock().release(Some(ptr));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let heap = Arc::try_unwrap(heap).unwrap().into_inner();
        assert_eq!(heap.consistency_check(false), 0);
        assert_eq!(heap.stats().allocated_blocks, 0);
    }
}
