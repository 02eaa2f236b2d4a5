//! A segregated free-list allocator with boundary tags.
//!
//! [`SegAlloc`] manages a single heap region obtained from a [`HeapProvider`]
//! which only ever grows at its top, like a program break. Every block carries
//! a header and a footer tag recording its size and whether it is allocated,
//! which lets a released block find and merge with both of its physical
//! neighbors. Free blocks are kept in nine size-class lists threaded through
//! their own payloads.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                 |
//! |--------------------------|-----------|----------------------------|
//! | Allocate                 | O(1)      | O(n) in the searched class |
//! | Release                  | O(1)      | O(n) in the merged classes |
//! | Reallocate               | O(m)      | O(n + m), m bytes copied   |
//!
//! #### Fragmentation
//!
//! Search is first-fit within a class, and a block is split only when the
//! remainder exceeds 16 bytes, so internal fragmentation is at most 16 bytes
//! plus the 8 bytes of tag overhead. Physically adjacent free blocks are
//! always merged on release. Memory is never returned to the provider.
//!
//! ## Example
//!
//! ```
//! use segalloc::{MemLib, SegAlloc};
//!
//! let mut heap = SegAlloc::new(MemLib::try_new(1 << 16).unwrap()).unwrap();
//!
//! let a = heap.allocate(100).unwrap();
//! let b = unsafe { heap.reallocate(Some(a), 300) }.unwrap();
//! unsafe { heap.release(Some(b)) };
//!
//! assert_eq!(heap.consistency_check(false), 0);
//! ```

#![doc(html_root_url = "https://docs.rs/segalloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` to shadow methods that have since been
// stabilized.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod block;
mod check;
mod class;
mod free_list;
mod provider;
mod seg;

#[cfg(feature = "std")]
mod sync;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    block::{Tag, ALIGNMENT},
    check::{HeapStats, Violation},
    class::{SizeClass, NUM_CLASSES},
    provider::{GrowError, HeapProvider, MemLib, DEFAULT_CAPACITY},
    seg::SegAlloc,
};

#[cfg(feature = "std")]
pub use crate::sync::SyncSegAlloc;

/// The error type for allocator and provider constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a provider attempts to reserve its
    /// region from a backing allocator, but the backing allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when a region is misaligned, has an
    /// unrepresentable size, or has already been grown before the allocator
    /// takes ownership of it.
    InvalidConfig,

    /// The location of the region is invalid.
    ///
    /// This variant is returned when the full size of the region would extend
    /// beyond the end of the address space.
    InvalidLocation,

    /// The provider could not grant the bytes for the heap sentinels.
    BootstrapFailed,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate region of {} bytes (align {})",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid heap region configuration"),
            AllocInitError::InvalidLocation => f.write_str("heap region overflows address space"),
            AllocInitError::BootstrapFailed => {
                f.write_str("backing provider could not grant the bootstrap region")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocInitError {}

/// Types which provide the memory backing a [`MemLib`] region.
///
/// This trait is sealed, and is implemented by the following types:
/// - The `Raw` marker type indicates that the region was supplied as a raw
///   pointer. The region is not freed when the `MemLib` is dropped.
/// - The `Global` marker type indicates that the region was allocated from the
///   global allocator. The region is freed on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via this allocator, and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that a region is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
