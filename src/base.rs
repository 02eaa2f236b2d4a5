//! The region base pointer.
//!
//! This is the only module that dereferences heap memory. Every access is
//! expressed as a byte offset from the start of the region and is checked
//! against the region's current extent before any memory is touched, so an
//! inconsistent offset panics instead of reading or writing out of bounds.

use core::{num::NonZeroUsize, ptr::NonNull};

// Inherent `addr` shadows this from Rust 1.84 on.
#[allow(unused_imports)]
use sptr::Strict;

/// A pointer to the base of the region of memory managed by an allocator.
#[derive(Copy, Clone, Debug)]
pub(crate) struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`, covering the first `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`. Returns `None` if
    /// the region limit would overflow `usize`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes for `extent` bytes for as long
    /// as the returned value or any copy of it is used.
    #[inline]
    pub unsafe fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.as_ptr().addr().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        // SAFETY: the pointer is non-null, so its address is nonzero.
        unsafe { NonZeroUsize::new_unchecked(self.ptr.as_ptr().addr()) }
    }

    /// Returns the number of bytes currently covered by the region.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    /// Extends the region to cover `additional` more bytes.
    ///
    /// # Safety
    ///
    /// The `additional` bytes immediately following the current extent must
    /// be valid for reads and writes under the same terms as [`BasePtr::new`].
    #[inline]
    pub unsafe fn grow(&mut self, additional: usize) -> Option<()> {
        let extent = self.extent.checked_add(additional)?;
        self.addr().get().checked_add(extent)?;
        self.extent = extent;

        Some(())
    }

    /// Returns `true` if `len` bytes starting at `ofs` lie within the region.
    #[inline]
    pub fn contains(self, ofs: usize, len: usize) -> bool {
        ofs.checked_add(len).map_or(false, |end| end <= self.extent)
    }

    /// Calculates the offset from `self` to `ptr`, if `ptr` points into the
    /// region.
    #[inline]
    pub fn offset_of(self, ptr: NonNull<u8>) -> Option<usize> {
        let ofs = ptr.as_ptr().addr().checked_sub(self.addr().get())?;
        (ofs < self.extent).then_some(ofs)
    }

    /// Creates a new pointer with the given offset.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, ofs: usize) -> NonNull<u8> {
        self.checked(ofs, 0)
    }

    #[inline]
    fn checked(self, ofs: usize, len: usize) -> NonNull<u8> {
        assert!(
            self.contains(ofs, len),
            "heap access out of bounds: {ofs:#x}+{len} exceeds extent {:#x}",
            self.extent
        );

        // SAFETY: `ofs + len <= extent`, so the result stays within (or one
        // past the end of) the region, which cannot wrap or be null.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(ofs)) }
    }

    /// Reads the tag word at `ofs`.
    #[inline]
    pub fn read_word(self, ofs: usize) -> u32 {
        let ptr = self.checked(ofs, 4).cast::<u32>();

        // SAFETY: the four bytes at `ofs` lie within the region.
        unsafe { ptr.as_ptr().read_unaligned() }
    }

    /// Writes the tag word at `ofs`.
    #[inline]
    pub fn write_word(self, ofs: usize, word: u32) {
        let ptr = self.checked(ofs, 4).cast::<u32>();

        // SAFETY: the four bytes at `ofs` lie within the region.
        unsafe { ptr.as_ptr().write_unaligned(word) };
    }

    /// Reads the free-list link stored at `ofs`.
    #[inline]
    pub fn read_link(self, ofs: usize) -> usize {
        let ptr = self.checked(ofs, 8).cast::<u64>();

        // SAFETY: the eight bytes at `ofs` lie within the region.
        let raw = unsafe { ptr.as_ptr().read_unaligned() };

        // Links are offsets below the extent, which always fits in a usize.
        usize::try_from(raw).unwrap_or(0)
    }

    /// Writes the free-list link stored at `ofs`.
    #[inline]
    pub fn write_link(self, ofs: usize, link: usize) {
        let ptr = self.checked(ofs, 8).cast::<u64>();

        // SAFETY: the eight bytes at `ofs` lie within the region.
        unsafe { ptr.as_ptr().write_unaligned(link as u64) };
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    #[inline]
    pub fn copy(self, src: usize, dst: usize, len: usize) {
        let src = self.checked(src, len);
        let dst = self.checked(dst, len);

        // SAFETY: both ranges lie within the region.
        unsafe { core::ptr::copy(src.as_ptr(), dst.as_ptr(), len) };
    }

    /// Sets `len` bytes starting at `ofs` to `byte`.
    #[inline]
    pub fn fill(self, ofs: usize, len: usize, byte: u8) {
        let ptr = self.checked(ofs, len);

        // SAFETY: the range lies within the region.
        unsafe { ptr.as_ptr().write_bytes(byte, len) };
    }
}
