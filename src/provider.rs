//! Backing heap providers.
//!
//! A provider owns one contiguous region that only ever grows at its top, in
//! the manner of a program break. [`MemLib`] simulates such a break inside a
//! fixed-capacity region reserved up front.

use core::{alloc::Layout, fmt, num::NonZeroUsize, ptr::NonNull};

// Inherent `addr` shadows this from Rust 1.84 on.
#[allow(unused_imports)]
use sptr::Strict;

use crate::{block::ALIGNMENT, AllocInitError, BackingAllocator, Raw};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The default capacity of a [`MemLib`] region: 20 MiB.
pub const DEFAULT_CAPACITY: usize = 20 * (1 << 20);

/// Indicates that a provider could not extend its region.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct GrowError;

impl fmt::Display for GrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("backing heap region exhausted")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for GrowError {}

/// A source of contiguous, monotonically growing memory.
///
/// # Safety
///
/// Implementors must uphold the following invariants:
/// - The region starts at [`lower_bound()`] and ends just before
///   [`upper_bound()`]; every byte in between is valid for reads and writes
///   until the provider is dropped.
/// - A successful [`grow(n)`] returns the previous upper bound and extends the
///   region by exactly `n` bytes. Previously granted bytes are never moved or
///   invalidated, including when the provider itself is moved.
/// - No other party reads or writes the region while the provider is in use.
///
/// [`lower_bound()`]: HeapProvider::lower_bound
/// [`upper_bound()`]: HeapProvider::upper_bound
/// [`grow(n)`]: HeapProvider::grow
pub unsafe trait HeapProvider {
    /// Extends the region by `nbytes`, returning a pointer to the first new
    /// byte.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the region cannot be extended.
    fn grow(&mut self, nbytes: usize) -> Result<NonNull<u8>, GrowError>;

    /// Returns a pointer to the first byte of the region.
    ///
    /// The returned pointer carries the provenance of the whole region,
    /// including bytes granted by later calls to `grow`.
    fn lower_bound(&self) -> NonNull<u8>;

    /// Returns the address one past the last granted byte.
    fn upper_bound(&self) -> usize;
}

/// A simulated program break over a fixed-capacity region.
pub struct MemLib<A: BackingAllocator> {
    base: NonNull<u8>,
    layout: Layout,
    brk: usize,
    backing_allocator: A,
}

impl MemLib<Raw> {
    /// Constructs a new `MemLib` over caller-provided memory.
    ///
    /// # Errors
    ///
    /// Returns an error if `region` is not aligned to [`ALIGNMENT`] or if the
    /// region would extend past the end of the address space.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `capacity` bytes for
    /// the lifetime of the returned value, and must not be accessed by any
    /// other means during that time.
    ///
    /// [`ALIGNMENT`]: crate::ALIGNMENT
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        capacity: usize,
    ) -> Result<MemLib<Raw>, AllocInitError> {
        let layout = Self::region_layout(capacity)?;

        let addr = region.as_ptr().addr();
        if addr % ALIGNMENT != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        addr.checked_add(capacity)
            .ok_or(AllocInitError::InvalidLocation)?;

        Ok(MemLib {
            base: region,
            layout,
            brk: 0,
            backing_allocator: Raw,
        })
    }
}

#[cfg(any(feature = "alloc", test))]
impl MemLib<Global> {
    /// Attempts to construct a new `MemLib` backed by the global allocator.
    ///
    /// The whole `capacity` is reserved immediately; the break starts at zero.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is zero or if sufficient memory could
    /// not be allocated from the global allocator.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(capacity: usize) -> Result<MemLib<Global>, AllocInitError> {
        if capacity == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let layout = Self::region_layout(capacity)?;

        // SAFETY: layout has a nonzero size.
        let raw = unsafe { alloc::alloc::alloc(layout) };
        let base = NonNull::new(raw).ok_or(AllocInitError::AllocFailed(layout))?;

        Ok(MemLib {
            base,
            layout,
            brk: 0,
            backing_allocator: Global,
        })
    }
}

impl<A: BackingAllocator> MemLib<A> {
    /// Returns the layout of a region of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the size cannot be represented as a [`Layout`].
    pub fn region_layout(capacity: usize) -> Result<Layout, AllocInitError> {
        Layout::from_size_align(capacity, ALIGNMENT).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns the total number of bytes the break may grow to.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the number of bytes granted so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.brk
    }

    /// Returns `true` if no bytes have been granted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.brk == 0
    }
}

unsafe impl<A: BackingAllocator> HeapProvider for MemLib<A> {
    fn grow(&mut self, nbytes: usize) -> Result<NonNull<u8>, GrowError> {
        let new_brk = self
            .brk
            .checked_add(nbytes)
            .filter(|&brk| brk <= self.capacity())
            .ok_or(GrowError)?;

        // SAFETY: `brk <= capacity`, so the offset stays within (or one past
        // the end of) the region.
        let old_brk = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) };
        self.brk = new_brk;

        Ok(old_brk)
    }

    fn lower_bound(&self) -> NonNull<u8> {
        self.base
    }

    fn upper_bound(&self) -> usize {
        self.base.as_ptr().addr() + self.brk
    }
}

// SAFETY: `MemLib` exclusively owns its region.
unsafe impl<A: BackingAllocator + Send> Send for MemLib<A> {}

impl<A: BackingAllocator> Drop for MemLib<A> {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            unsafe { self.backing_allocator.deallocate(self.base, self.layout) };
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for MemLib<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemLib")
            .field("base", &self.base)
            .field("capacity", &self.capacity())
            .field("brk", &self.brk)
            .finish()
    }
}

/// Returns the address of `ptr` as a `NonZeroUsize`.
#[inline]
pub(crate) fn nonzero_addr(ptr: NonNull<u8>) -> NonZeroUsize {
    // SAFETY: the pointer is non-null, so its address is nonzero.
    unsafe { NonZeroUsize::new_unchecked(ptr.as_ptr().addr()) }
}
