//! Free-space allocator for the backing file
//!
//! Hands out byte ranges in the single backing file and takes them back when
//! units shrink, move, or are deleted. This is a first-fit free-list allocator
//! with a bump pointer at the logical end of file:
//!
//! ```text
//!  0                                                     end_of_file
//!  |-- unit A --|-- free --|---- unit B ----|-- free --|
//!                    ^                           ^
//!              first-fit candidate         grows into new space
//! ```
//!
//! Released ranges are coalesced with their neighbours so fragmentation stays
//! bounded across long sessions. The end-of-file marker never moves backwards;
//! trailing space that gets released becomes a free range instead of a
//! truncation.
//!
//! # Example
//!
//! ```rust
//! use boxcache::storage::allocator::{FileSpaceAllocator, ShrinkPolicy};
//!
//! let alloc = FileSpaceAllocator::new(ShrinkPolicy::KeepInPlace);
//! let a = alloc.allocate(100).unwrap();
//! let b = alloc.allocate(50).unwrap();
//! assert_eq!((a, b), (0, 100));
//!
//! alloc.release(a, 100).unwrap();
//! // First fit reuses the hole at the front
//! assert_eq!(alloc.allocate(60).unwrap(), 0);
//! assert_eq!(alloc.free_bytes(), 40);
//! ```

use crate::error::CacheError;
use crate::types::FileRange;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// What to do when a unit's on-disk size shrinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShrinkPolicy {
    /// Keep the old range and accept the trailing waste (avoids a move)
    #[default]
    KeepInPlace,

    /// Release the old range and allocate one of the exact new size
    Relocate,
}

/// Free-range table plus end-of-file marker
///
/// Keys are offsets, values are lengths. Entries never overlap and are never
/// adjacent (adjacent entries are merged on insert).
#[derive(Debug, Clone, Default)]
struct FreeSpaceMap {
    free: BTreeMap<u64, u64>,
    end_of_file: u64,
}

impl FreeSpaceMap {
    fn allocate(&mut self, length: u64) -> Result<u64, CacheError> {
        if length == 0 {
            return Err(CacheError::InvalidLength { length });
        }

        // First fit in offset order
        let fit = self
            .free
            .iter()
            .find(|(_, &len)| len >= length)
            .map(|(&off, &len)| (off, len));

        if let Some((offset, len)) = fit {
            self.free.remove(&offset);
            if len > length {
                self.free.insert(offset + length, len - length);
            }
            return Ok(offset);
        }

        // Nothing fits: grow the file. A free range touching the end of file is
        // absorbed so the new allocation starts there.
        let start = match self.free.iter().next_back() {
            Some((&off, &len)) if off + len == self.end_of_file => off,
            _ => self.end_of_file,
        };
        let new_end = start
            .checked_add(length)
            .ok_or(CacheError::OutOfSpace {
                requested: length,
                end_of_file: self.end_of_file,
            })?;

        if start != self.end_of_file {
            self.free.remove(&start);
        }
        debug!(
            offset = start,
            length,
            old_end = self.end_of_file,
            new_end,
            "Extending backing file"
        );
        self.end_of_file = new_end;
        Ok(start)
    }

    /// Verify that `[offset, offset + length)` is inside the file and disjoint
    /// from every free range
    fn check_owned(&self, offset: u64, length: u64) -> Result<u64, CacheError> {
        if length == 0 {
            return Err(CacheError::InvalidLength { length });
        }
        let not_owned = CacheError::RangeNotOwned { offset, length };
        let end = match offset.checked_add(length) {
            Some(end) if end <= self.end_of_file => end,
            _ => return Err(not_owned),
        };

        // Free ranges are disjoint and sorted, so the last one starting before
        // `end` is the only candidate for an overlap.
        if let Some((&off, &len)) = self.free.range(..end).next_back() {
            if off + len > offset {
                return Err(not_owned);
            }
        }
        Ok(end)
    }

    fn release(&mut self, offset: u64, length: u64) -> Result<(), CacheError> {
        let end = self.check_owned(offset, length)?;
        self.insert_free(offset, end);
        Ok(())
    }

    /// Insert `[start, end)` as free, merging with both neighbours
    fn insert_free(&mut self, mut start: u64, mut end: u64) {
        if let Some((&prev_off, &prev_len)) = self.free.range(..start).next_back() {
            if prev_off + prev_len == start {
                self.free.remove(&prev_off);
                start = prev_off;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }
        self.free.insert(start, end - start);
    }

    /// Remove `[offset, offset + length)` from the free table
    ///
    /// The range must lie within a single free entry.
    fn carve(&mut self, offset: u64, length: u64) -> bool {
        let end = offset + length;
        let Some((&off, &len)) = self.free.range(..=offset).next_back() else {
            return false;
        };
        if off + len < end {
            return false;
        }
        self.free.remove(&off);
        if off < offset {
            self.free.insert(off, offset - off);
        }
        if off + len > end {
            self.free.insert(end, off + len - end);
        }
        true
    }

    fn reallocate(
        &mut self,
        old: FileRange,
        new_length: u64,
        policy: ShrinkPolicy,
    ) -> Result<FileRange, CacheError> {
        if new_length == 0 {
            return Err(CacheError::InvalidLength { length: new_length });
        }
        self.check_owned(old.offset, old.length)?;

        if new_length == old.length
            || (new_length < old.length && policy == ShrinkPolicy::KeepInPlace)
        {
            return Ok(old);
        }

        self.insert_free(old.offset, old.end());
        match self.allocate(new_length) {
            Ok(offset) => Ok(FileRange::new(offset, new_length)),
            Err(e) => {
                // Put the old range back so the failed call leaves no trace
                let restored = self.carve(old.offset, old.length);
                debug_assert!(restored, "released range must still be free");
                Err(e)
            },
        }
    }

    fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    fn validate(&self) -> Result<(), CacheError> {
        let mut prev_end: Option<u64> = None;
        for (&off, &len) in &self.free {
            if len == 0 {
                return Err(CacheError::Precondition(format!(
                    "zero-length free range at offset {}",
                    off
                )));
            }
            if let Some(pe) = prev_end {
                if off < pe {
                    return Err(CacheError::Precondition(format!(
                        "free ranges overlap at offset {}",
                        off
                    )));
                }
                if off == pe {
                    return Err(CacheError::Precondition(format!(
                        "adjacent free ranges not coalesced at offset {}",
                        off
                    )));
                }
            }
            let end = off.checked_add(len).ok_or_else(|| {
                CacheError::Precondition(format!("free range at {} overflows", off))
            })?;
            if end > self.end_of_file {
                return Err(CacheError::Precondition(format!(
                    "free range {} extends past end of file {}",
                    FileRange::new(off, len),
                    self.end_of_file
                )));
            }
            prev_end = Some(end);
        }
        Ok(())
    }
}

/// Thread-safe allocator of byte ranges in the backing file
///
/// All operations take a single allocator-wide lock. Allocation only happens
/// while saving an eviction victim, so this lock is cold compared to the
/// eviction buffer's bookkeeping lock and the two are kept separate.
#[derive(Debug)]
pub struct FileSpaceAllocator {
    map: Mutex<FreeSpaceMap>,
    policy: ShrinkPolicy,
}

impl FileSpaceAllocator {
    /// Create an allocator for an empty backing file
    pub fn new(policy: ShrinkPolicy) -> Self {
        Self {
            map: Mutex::new(FreeSpaceMap::default()),
            policy,
        }
    }

    /// Rebuild an allocator from a persisted free-space map
    ///
    /// Ranges may be given in any order; adjacent ranges are merged. Fails if
    /// any range is empty, overlaps another, or extends past `end_of_file`.
    pub fn restore(
        policy: ShrinkPolicy,
        end_of_file: u64,
        free_ranges: &[FileRange],
    ) -> Result<Self, CacheError> {
        let mut sorted = free_ranges.to_vec();
        sorted.sort();

        let mut map = FreeSpaceMap {
            free: BTreeMap::new(),
            end_of_file,
        };
        let mut prev_end = 0u64;
        for (i, range) in sorted.iter().enumerate() {
            if range.is_empty() {
                return Err(CacheError::InvalidLength { length: 0 });
            }
            let end = range
                .offset
                .checked_add(range.length)
                .filter(|&end| end <= end_of_file)
                .ok_or(CacheError::RangeNotOwned {
                    offset: range.offset,
                    length: range.length,
                })?;
            if i > 0 && range.offset < prev_end {
                return Err(CacheError::Precondition(format!(
                    "persisted free range {} overlaps its predecessor",
                    range
                )));
            }
            map.insert_free(range.offset, end);
            prev_end = end;
        }

        debug!(
            end_of_file,
            free_ranges = map.free.len(),
            free_bytes = map.free_bytes(),
            "Restored free-space map"
        );
        Ok(Self {
            map: Mutex::new(map),
            policy,
        })
    }

    /// The configured shrink policy
    pub fn policy(&self) -> ShrinkPolicy {
        self.policy
    }

    /// Allocate `length` bytes and return the starting offset
    ///
    /// # Errors
    ///
    /// - `InvalidLength` if `length` is 0
    /// - `OutOfSpace` if the end of file would overflow
    pub fn allocate(&self, length: u64) -> Result<u64, CacheError> {
        self.map.lock().allocate(length)
    }

    /// Return a range to the free table
    ///
    /// # Errors
    ///
    /// - `InvalidLength` if `length` is 0
    /// - `RangeNotOwned` if the range is already (partly) free or lies past the
    ///   end of file
    pub fn release(&self, offset: u64, length: u64) -> Result<(), CacheError> {
        let result = self.map.lock().release(offset, length);
        if let Err(ref e) = result {
            warn!(offset, length, error = %e, "Rejected release of unowned range");
        }
        result
    }

    /// Find a home for a unit whose on-disk size is changing
    ///
    /// Returns `old_offset` when the size is unchanged, or when it shrinks and
    /// the policy is [`ShrinkPolicy::KeepInPlace`]. Otherwise the old range is
    /// released and a new one of `new_length` bytes is allocated; the new range
    /// may start at `old_offset` again if coalescing made room there.
    pub fn reallocate_if_needed(
        &self,
        old_offset: u64,
        old_length: u64,
        new_length: u64,
    ) -> Result<u64, CacheError> {
        self.reallocate(FileRange::new(old_offset, old_length), new_length)
            .map(|range| range.offset)
    }

    /// Like [`reallocate_if_needed`](Self::reallocate_if_needed) but returns
    /// the range the caller owns afterwards
    ///
    /// When the old range is kept for a smaller payload the returned range is
    /// the old one, trailing waste included.
    pub fn reallocate(&self, old: FileRange, new_length: u64) -> Result<FileRange, CacheError> {
        self.map.lock().reallocate(old, new_length, self.policy)
    }

    /// Current logical end of file
    pub fn end_of_file(&self) -> u64 {
        self.map.lock().end_of_file
    }

    /// Adopt the length of an existing file
    ///
    /// Growing turns the new tail into free space. Shrinking is rejected since
    /// the end-of-file marker never moves backwards.
    pub fn set_end_of_file(&self, length: u64) -> Result<(), CacheError> {
        let mut map = self.map.lock();
        if length < map.end_of_file {
            return Err(CacheError::Precondition(format!(
                "cannot shrink end of file from {} to {}",
                map.end_of_file, length
            )));
        }
        if length > map.end_of_file {
            let old_end = map.end_of_file;
            map.end_of_file = length;
            map.insert_free(old_end, length);
        }
        Ok(())
    }

    /// Total bytes in free ranges
    pub fn free_bytes(&self) -> u64 {
        self.map.lock().free_bytes()
    }

    /// Bytes owned by units (including waste kept by in-place shrinks)
    pub fn used_bytes(&self) -> u64 {
        let map = self.map.lock();
        map.end_of_file - map.free_bytes()
    }

    /// Number of distinct free ranges
    pub fn free_range_count(&self) -> usize {
        self.map.lock().free.len()
    }

    /// Snapshot of the free table in offset order
    pub fn free_space_map(&self) -> Vec<FileRange> {
        self.map
            .lock()
            .free
            .iter()
            .map(|(&offset, &length)| FileRange::new(offset, length))
            .collect()
    }

    /// Validate the free table
    ///
    /// Free ranges must be non-empty, sorted, disjoint, non-adjacent and lie
    /// within `[0, end_of_file)`.
    pub fn check_invariants(&self) -> Result<(), CacheError> {
        self.map.lock().validate()
    }
}

impl Default for FileSpaceAllocator {
    fn default() -> Self {
        Self::new(ShrinkPolicy::default())
    }
}
