//! Core data types shared by the allocator, the backing file and the cache
//!
//! # Key Types
//!
//! - **`FileRange`**: a byte extent `[offset, offset + length)` in the backing file
//!
//! # Example
//!
//! ```rust
//! use boxcache::types::FileRange;
//!
//! let a = FileRange::new(0, 100);
//! let b = FileRange::new(100, 50);
//! assert!(a.is_adjacent_to(&b));
//! assert!(!a.overlaps(&b));
//! assert_eq!(a.end(), 100);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// A byte extent in the backing file
///
/// Ranges are half-open: `offset` is included, `offset + length` is not.
/// A range is owned either by exactly one unit or by the allocator's free
/// table, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRange {
    /// Start of the extent
    pub offset: u64,

    /// Number of bytes in the extent
    pub length: u64,
}

impl FileRange {
    /// Create a new range
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte of the range
    ///
    /// Saturates at `u64::MAX`; the allocator never hands out a range whose end
    /// would overflow.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Returns true if the range covers no bytes
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns true if the two ranges share at least one byte
    pub fn overlaps(&self, other: &FileRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.offset < other.end() && other.offset < self.end()
    }

    /// Returns true if one range ends exactly where the other begins
    pub fn is_adjacent_to(&self, other: &FileRange) -> bool {
        self.end() == other.offset || other.end() == self.offset
    }

    /// Returns true if `other` lies entirely within this range
    pub fn contains(&self, other: &FileRange) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}
