//! Size classes.
//!
//! Free blocks are partitioned by their full size (overhead included) into
//! nine disjoint classes:
//!
//! | Class | Block sizes       |
//! |-------|-------------------|
//! | 0     | `..=32`           |
//! | 1     | `33..=64`         |
//! | 2     | `65..=128`        |
//! | 3     | `129..=256`       |
//! | 4     | `257..=512`       |
//! | 5     | `513..=1024`      |
//! | 6     | `1025..=2048`     |
//! | 7     | `2049..=4096`     |
//! | 8     | `4097..`          |

use core::fmt;

/// The number of size classes.
pub const NUM_CLASSES: usize = 9;

/// Inclusive upper bounds of every class but the last.
const LIMITS: [usize; NUM_CLASSES - 1] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

/// One of the fixed size classes that partition the free blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    /// Returns the class that holds blocks of `size` bytes.
    #[inline]
    pub fn of(size: usize) -> SizeClass {
        let index = LIMITS
            .iter()
            .position(|&limit| size <= limit)
            .unwrap_or(NUM_CLASSES - 1);

        SizeClass(index as u8)
    }

    /// Returns the class with the given index, if it exists.
    #[inline]
    pub fn from_index(index: usize) -> Option<SizeClass> {
        (index < NUM_CLASSES).then(|| SizeClass(index as u8))
    }

    /// Returns the index of this class, in `0..NUM_CLASSES`.
    #[inline]
    pub fn index(self) -> usize {
        self.0.into()
    }

    /// Iterates over every class, smallest first.
    pub fn all() -> impl Iterator<Item = SizeClass> {
        (0..NUM_CLASSES as u8).map(SizeClass)
    }

    /// Iterates over the classes holding strictly larger blocks than `self`.
    pub fn larger(self) -> impl Iterator<Item = SizeClass> {
        (self.0 + 1..NUM_CLASSES as u8).map(SizeClass)
    }

    /// Returns the exclusive lower bound on block sizes in this class.
    #[inline]
    pub fn lower_bound(self) -> usize {
        match self.index() {
            0 => 0,
            i => LIMITS[i - 1],
        }
    }

    /// Returns the inclusive upper bound on block sizes in this class, or
    /// `None` for the unbounded last class.
    #[inline]
    pub fn upper_bound(self) -> Option<usize> {
        LIMITS.get(self.index()).copied()
    }

    /// Returns `true` if a block of `size` bytes belongs in this class.
    #[inline]
    pub fn admits(self, size: usize) -> bool {
        size > self.lower_bound() && self.upper_bound().map_or(true, |upper| size <= upper)
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upper_bound() {
            Some(upper) => write!(f, "class {} (<= {upper})", self.0),
            None => write!(f, "class {} (> {})", self.0, self.lower_bound()),
        }
    }
}
