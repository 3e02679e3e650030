//! Scoped busy pin on a unit

use crate::cache::buffer::{BudgetStatus, EvictionBuffer};
use crate::cache::unit::{Cacheable, UnitRef};
use crate::error::CacheError;
use std::ops::Deref;

/// Keeps a unit busy, and therefore out of eviction, while it is in scope
///
/// Obtained from [`EvictionBuffer::pin`]. The unit has been touched and is
/// loaded when the guard is handed out; dropping the guard clears the busy
/// flag. The flag is not counted, so two guards on the same unit from
/// different threads unpin it when the first one drops.
#[must_use = "the unit is unpinned as soon as the guard is dropped"]
pub struct BusyGuard<'a> {
    buffer: &'a EvictionBuffer,
    unit: UnitRef,
    status: BudgetStatus,
}

impl<'a> BusyGuard<'a> {
    /// The pinned unit
    pub fn unit(&self) -> &UnitRef {
        &self.unit
    }

    /// Budget status reported by the touch that created this guard
    pub fn budget_status(&self) -> BudgetStatus {
        self.status
    }

    /// Record an in-place mutation and its effect on the footprint
    pub fn mark_changed(&self, size_delta: i64) {
        self.unit.set_data_changed();
        if size_delta != 0 {
            self.buffer.note_size_changed(&self.unit, size_delta);
        }
    }
}

impl Deref for BusyGuard<'_> {
    type Target = dyn Cacheable;

    fn deref(&self) -> &Self::Target {
        self.unit.as_ref()
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.unit.set_busy(false);
    }
}

impl std::fmt::Debug for BusyGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyGuard")
            .field("unit", &self.unit.state().snapshot())
            .field("status", &self.status)
            .finish()
    }
}

impl EvictionBuffer {
    /// Mark a unit busy and touch it
    ///
    /// Waits only if the unit is being written back by an eviction pass right
    /// now. If the touch fails the busy flag is cleared again.
    pub fn pin(&self, unit: &UnitRef) -> Result<BusyGuard<'_>, CacheError> {
        unit.set_busy(true);
        self.guard(unit)
    }

    /// Like [`pin`](Self::pin) but returns `None` instead of waiting when
    /// anyone else holds the unit
    pub fn try_pin(&self, unit: &UnitRef) -> Result<Option<BusyGuard<'_>>, CacheError> {
        if !unit.state().try_set_busy() {
            return Ok(None);
        }
        self.guard(unit).map(Some)
    }

    fn guard(&self, unit: &UnitRef) -> Result<BusyGuard<'_>, CacheError> {
        match self.touch(unit) {
            Ok(status) => Ok(BusyGuard {
                buffer: self,
                unit: UnitRef::clone(unit),
                status,
            }),
            Err(e) => {
                unit.set_busy(false);
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::storage::{BackingFile, FileSpaceAllocator};
    use crate::units::ByteBlock;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(budget: u64) -> (TempDir, EvictionBuffer) {
        let temp_dir = TempDir::new().unwrap();
        let file = Arc::new(BackingFile::create(temp_dir.path().join("cache.bin")).unwrap());
        let config = CacheConfig::new(budget).with_metrics(false);
        let buffer = EvictionBuffer::new(&config, file, Arc::new(FileSpaceAllocator::default()));
        (temp_dir, buffer)
    }

    #[test]
    fn test_pin_sets_and_clears_busy() {
        let (_dir, buffer) = setup(1_000);
        let unit: UnitRef = Arc::new(ByteBlock::new(vec![0; 10]));

        {
            let guard = buffer.pin(&unit).unwrap();
            assert!(guard.is_busy());
            assert!(guard.budget_status().is_within_budget());
            assert!(buffer.contains(&unit));
        }
        assert!(!unit.is_busy());
    }

    #[test]
    fn test_pinned_unit_survives_budget_pass() {
        let (_dir, buffer) = setup(150);
        let a: UnitRef = Arc::new(ByteBlock::new(vec![1; 100]));
        let b: UnitRef = Arc::new(ByteBlock::new(vec![2; 100]));

        let guard = buffer.pin(&a).unwrap();
        let status = buffer.touch(&b).unwrap();

        // a is LRU but pinned, and b is spared by its own touch
        assert!(!status.is_within_budget());
        assert!(buffer.contains(&a));
        assert!(a.is_loaded());
        assert!(buffer.contains(&b));
        drop(guard);

        let c: UnitRef = Arc::new(ByteBlock::new(vec![3; 100]));
        assert!(buffer.touch(&c).unwrap().is_within_budget());
        assert!(!buffer.contains(&a));
        assert!(!buffer.contains(&b));
        assert!(buffer.contains(&c));
    }

    #[test]
    fn test_try_pin_refuses_busy_unit() {
        let (_dir, buffer) = setup(1_000);
        let unit: UnitRef = Arc::new(ByteBlock::new(vec![0; 10]));

        let first = buffer.try_pin(&unit).unwrap();
        assert!(first.is_some());
        assert!(buffer.try_pin(&unit).unwrap().is_none());
        drop(first);
        assert!(buffer.try_pin(&unit).unwrap().is_some());
    }

    #[test]
    fn test_mark_changed_updates_footprint() {
        let (_dir, buffer) = setup(1_000);
        let unit: UnitRef = Arc::new(ByteBlock::new(vec![0; 10]));

        let guard = buffer.pin(&unit).unwrap();
        guard.mark_changed(5);
        assert_eq!(buffer.resident_bytes(), 15);
    }
}
