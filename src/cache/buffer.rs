//! Recency-ordered eviction buffer with a memory budget
//!
//! Every loaded unit is registered here. The buffer tracks the sum of their
//! in-memory footprints and, when that sum exceeds the configured ceiling,
//! writes back and clears the least-recently-used units that nobody is using.
//!
//! # Locking
//!
//! ```text
//! buffer lock ──▶ unit io lock ──▶ unit bookkeeping
//!                      │
//!                      └──▶ allocator lock
//! ```
//!
//! The buffer lock only covers list and counter updates. Write-back (the
//! allocator call plus the unit's save) runs with the victim pinned in its
//! eviction state and the buffer lock released, so workers keep touching
//! other units while a slow save is in flight.

use crate::cache::recency::{RecencyList, SlotHandle};
use crate::cache::stats::CacheStats;
use crate::cache::unit::{same_unit, Cacheable, UnitRef};
use crate::config::{CacheConfig, EvictionMode};
use crate::error::CacheError;
use crate::metrics;
use crate::storage::allocator::FileSpaceAllocator;
use crate::storage::backing_file::BackingFile;
use crate::types::FileRange;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result of a budget enforcement pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// Resident bytes are at or below the ceiling
    WithinBudget,

    /// No evictable unit remained (all busy, or only the unit being touched);
    /// resident bytes are still above the ceiling. Callers may back off and
    /// retry.
    CouldNotMeetBudget {
        /// Resident bytes when the scan gave up
        resident: u64,
        /// The ceiling
        budget: u64,
    },
}

impl BudgetStatus {
    /// Returns true if the ceiling was met
    pub fn is_within_budget(&self) -> bool {
        matches!(self, BudgetStatus::WithinBudget)
    }
}

struct Resident {
    unit: UnitRef,
    /// Footprint counted for this unit
    size: u64,
}

#[derive(Default)]
struct Inner {
    list: RecencyList<Resident>,
    resident_bytes: u64,
}

/// Outcome of a [`EvictionBuffer::flush_all`] pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushStatus {
    /// Units written back by this pass
    pub saved: usize,
    /// Dirty units left unsaved because a worker had them pinned
    pub skipped: usize,
}

impl FlushStatus {
    /// Returns true if no dirty unit was left behind
    pub fn is_complete(&self) -> bool {
        self.skipped == 0
    }
}

struct Sweeper {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Process-wide cache of loaded units
///
/// Construct one per backing file and share it behind an `Arc`.
pub struct EvictionBuffer {
    budget: AtomicU64,
    mode: EvictionMode,
    sweep_interval: Duration,
    publish_metrics: bool,
    inner: Mutex<Inner>,
    file: Arc<BackingFile>,
    allocator: Arc<FileSpaceAllocator>,
    stats: CacheStats,
    sweeper: Mutex<Option<Sweeper>>,
}

impl std::fmt::Debug for EvictionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionBuffer")
            .field("budget", &self.budget())
            .field("mode", &self.mode)
            .field("resident_bytes", &self.resident_bytes())
            .field("len", &self.len())
            .finish()
    }
}

impl EvictionBuffer {
    /// Create a buffer over `file`, allocating ranges from `allocator`
    pub fn new(
        config: &CacheConfig,
        file: Arc<BackingFile>,
        allocator: Arc<FileSpaceAllocator>,
    ) -> Self {
        info!(
            budget = config.memory_budget_bytes,
            mode = ?config.eviction_mode,
            "Created eviction buffer"
        );
        Self {
            budget: AtomicU64::new(config.memory_budget_bytes),
            mode: config.eviction_mode,
            sweep_interval: config.sweep_interval(),
            publish_metrics: config.enable_metrics,
            inner: Mutex::new(Inner::default()),
            file,
            allocator,
            stats: CacheStats::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Bring a unit to the most-recently-used position
    ///
    /// A resident unit is just moved. Otherwise the unit is loaded first if
    /// its data is only on disk, then registered with its current footprint.
    /// In [`EvictionMode::OnTouch`] the budget is enforced before returning.
    ///
    /// The touched unit is never a victim of the budget pass its own touch
    /// triggers, so it is loaded when `touch` returns. It is not marked busy;
    /// use [`pin`](Self::pin) to keep it out of later passes while working on
    /// it.
    ///
    /// # Errors
    ///
    /// Load failures are returned and leave the unit unregistered. Eviction
    /// failures from the budget pass are returned as well; the touched unit
    /// is registered in that case.
    pub fn touch(&self, unit: &UnitRef) -> Result<BudgetStatus, CacheError> {
        if self.promote(unit) {
            self.stats.record_touch(true);
            return self.after_touch(unit);
        }
        self.stats.record_touch(false);

        if !unit.is_loaded() {
            let started = Instant::now();
            if let Err(e) = unit.load(&self.file) {
                self.record_io_error(&e, "load");
                error!(range = ?unit.file_range(), error = %e, "Failed to load unit");
                return Err(e);
            }
            let bytes = unit.data_memory_size();
            self.stats.record_load(bytes);
            if self.publish_metrics {
                metrics::record_load();
            }
            debug!(
                bytes,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Loaded unit from backing file"
            );
        }

        let size = unit.data_memory_size();
        {
            let mut inner = self.inner.lock();
            let state = unit.state();
            let registered = state
                .slot()
                .is_some_and(|slot| inner.list.move_to_back(slot));
            if !registered {
                let slot = inner.list.push_back(Resident {
                    unit: Arc::clone(unit),
                    size,
                });
                state.set_slot(Some(slot));
                inner.resident_bytes += size;
                self.stats.observe_resident(inner.resident_bytes);
            }
        }
        self.publish_usage();
        self.after_touch(unit)
    }

    /// Move to MRU if registered
    fn promote(&self, unit: &UnitRef) -> bool {
        let mut inner = self.inner.lock();
        match unit.state().slot() {
            Some(slot) => inner.list.move_to_back(slot),
            None => false,
        }
    }

    fn after_touch(&self, touched: &UnitRef) -> Result<BudgetStatus, CacheError> {
        if self.mode == EvictionMode::OnTouch && self.resident_bytes() > self.budget() {
            self.enforce_budget(Some(touched))
        } else {
            Ok(BudgetStatus::WithinBudget)
        }
    }

    /// Adjust the footprint of a resident unit after an in-place change
    ///
    /// Returns false if the unit is not registered.
    pub fn note_size_changed(&self, unit: &UnitRef, delta: i64) -> bool {
        {
            let mut inner = self.inner.lock();
            let Some(slot) = unit.state().slot() else {
                return false;
            };
            let Some(resident) = inner.list.get_mut(slot) else {
                return false;
            };

            let old = resident.size;
            let new = old.saturating_add_signed(delta);
            resident.size = new;
            inner.resident_bytes = inner.resident_bytes - old + new;
            self.stats.observe_resident(inner.resident_bytes);
        }
        self.publish_usage();
        true
    }

    /// Evict least-recently-used units until resident bytes fit the ceiling
    ///
    /// Busy units are skipped, never waited on. Each victim that is dirty is
    /// written back first (allocating or reallocating its range), then its
    /// memory is released.
    ///
    /// # Errors
    ///
    /// An allocation or I/O failure stops the pass. The victim stays
    /// registered, loaded and dirty; a range allocated for its first save is
    /// released again.
    pub fn ensure_budget(&self) -> Result<BudgetStatus, CacheError> {
        self.enforce_budget(None)
    }

    /// Budget pass that never picks `spared` as a victim
    fn enforce_budget(&self, spared: Option<&UnitRef>) -> Result<BudgetStatus, CacheError> {
        loop {
            let budget = self.budget();
            let victim = {
                let inner = self.inner.lock();
                if inner.resident_bytes <= budget {
                    return Ok(BudgetStatus::WithinBudget);
                }
                let victim = inner
                    .list
                    .iter()
                    .filter(|(_, resident)| {
                        !spared.is_some_and(|unit| same_unit(unit, &resident.unit))
                    })
                    .find(|(_, resident)| resident.unit.state().try_begin_eviction())
                    .map(|(slot, resident)| (slot, Arc::clone(&resident.unit)));

                match victim {
                    Some(victim) => victim,
                    None => {
                        let resident = inner.resident_bytes;
                        drop(inner);
                        self.stats.record_budget_miss();
                        if self.publish_metrics {
                            metrics::record_budget_miss();
                        }
                        warn!(
                            resident,
                            budget,
                            units = self.len(),
                            "Could not meet memory budget, no evictable unit left"
                        );
                        return Ok(BudgetStatus::CouldNotMeetBudget { resident, budget });
                    },
                }
            };

            let (slot, unit) = victim;
            let result = self.evict(&unit, slot);
            unit.state().end_eviction();
            result?;
        }
    }

    /// Write back if needed, then clear and unregister. The unit is held in
    /// its eviction state by the caller.
    fn evict(&self, unit: &UnitRef, slot: SlotHandle) -> Result<(), CacheError> {
        let started = Instant::now();

        if unit.is_dirty() {
            self.write_back(unit.as_ref())?;
        }

        let freed = {
            let mut inner = self.inner.lock();
            unit.clear_data_from_memory()?;
            let freed = match inner.list.remove(slot) {
                Some(resident) => {
                    inner.resident_bytes -= resident.size;
                    resident.size
                },
                None => 0,
            };
            unit.state().set_slot(None);
            freed
        };
        unit.clear_data_changed();

        self.stats.record_eviction();
        if self.publish_metrics {
            metrics::record_eviction(started.elapsed().as_secs_f64());
        }
        self.publish_usage();
        debug!(
            freed,
            range = ?unit.file_range(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Evicted unit"
        );
        Ok(())
    }

    /// Give a dirty unit a range sized for its current data and save it
    ///
    /// Runs under the unit's I/O lock so a concurrent flush and eviction of
    /// the same unit cannot both move its range.
    fn write_back(&self, unit: &dyn Cacheable) -> Result<(), CacheError> {
        let state = unit.state();
        let _io = state.io_lock();

        if !state.is_dirty() {
            return Ok(());
        }

        let new_length = unit.total_data_size();
        let previous = state.file_range();
        let range = match previous {
            Some(old) => self.allocator.reallocate(old, new_length),
            None => self
                .allocator
                .allocate(new_length)
                .map(|offset| FileRange::new(offset, new_length)),
        }
        .inspect_err(|e| {
            error!(new_length, previous = ?previous, error = %e, "Failed to place unit in backing file");
        })?;
        state.assign_range(range);

        let changes = state.change_count();
        if let Err(e) = unit.write_to(&self.file, range) {
            if previous.is_none() {
                state.take_range();
                if let Err(release_err) = self.allocator.release(range.offset, range.length) {
                    warn!(%range, error = %release_err, "Failed to return range after failed save");
                }
            }
            self.record_io_error(&e, "save");
            error!(%range, error = %e, "Failed to save unit");
            return Err(e);
        }
        state.mark_saved(changes);

        self.stats.record_save(new_length);
        if self.publish_metrics {
            metrics::record_save();
        }
        if previous != Some(range) {
            debug!(%range, previous = ?previous, "Placed unit in backing file");
        }
        Ok(())
    }

    /// Save every dirty resident unit without evicting anything
    ///
    /// Units are visited from least- to most-recently used. Each unit is held
    /// the same way the eviction scan holds a victim while it is saved; units
    /// that are pinned by a worker or already being evicted are skipped, stay
    /// dirty, and are counted in [`FlushStatus::skipped`]. Every saved unit
    /// gets a [`Cacheable::flush_data`] call, and the backing file is synced
    /// once at the end of a pass that wrote anything.
    ///
    /// # Errors
    ///
    /// A failure does not stop the pass; the first error is returned after
    /// all units were tried.
    pub fn flush_all(&self) -> Result<FlushStatus, CacheError> {
        let units: Vec<UnitRef> = {
            let inner = self.inner.lock();
            inner
                .list
                .iter()
                .map(|(_, resident)| Arc::clone(&resident.unit))
                .collect()
        };

        let mut first_error = None;
        let mut status = FlushStatus::default();
        for unit in &units {
            if !unit.is_dirty() {
                continue;
            }
            if !unit.state().try_begin_eviction() {
                status.skipped += 1;
                continue;
            }
            let result = self
                .write_back(unit.as_ref())
                .and_then(|()| unit.flush_data(&self.file));
            unit.state().end_eviction();
            match result {
                Ok(()) => status.saved += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                },
            }
        }

        if status.saved > 0 {
            if let Err(e) = self.file.sync() {
                self.record_io_error(&e, "sync");
                first_error.get_or_insert(e);
            }
        }

        debug!(
            saved = status.saved,
            skipped = status.skipped,
            units = units.len(),
            failed = first_error.is_some(),
            "Flushed resident units"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(status),
        }
    }

    /// Drop a unit from the buffer without saving it
    ///
    /// Returns false if the unit was not registered. Its memory and file range
    /// are left alone.
    pub fn remove(&self, unit: &UnitRef) -> bool {
        let mut inner = self.inner.lock();
        let state = unit.state();
        let Some(slot) = state.slot() else {
            return false;
        };
        state.set_slot(None);
        match inner.list.remove(slot) {
            Some(resident) => {
                inner.resident_bytes -= resident.size;
                true
            },
            None => false,
        }
    }

    /// Forget a unit whose owner is being destroyed
    ///
    /// Unregisters it and returns its file range to the allocator.
    pub fn object_deleted(&self, unit: &UnitRef) -> Result<(), CacheError> {
        self.remove(unit);

        let state = unit.state();
        let _io = state.io_lock();
        if let Some(range) = state.take_range() {
            self.allocator.release(range.offset, range.length)?;
            debug!(%range, "Released range of deleted unit");
        }
        Ok(())
    }

    /// Sum of registered footprints
    pub fn resident_bytes(&self) -> u64 {
        self.inner.lock().resident_bytes
    }

    /// Resident-memory ceiling in bytes
    pub fn budget(&self) -> u64 {
        self.budget.load(Ordering::Relaxed)
    }

    /// Change the ceiling; takes effect at the next budget pass
    pub fn set_budget(&self, bytes: u64) {
        self.budget.store(bytes, Ordering::Relaxed);
        info!(budget = bytes, "Memory budget changed");
    }

    /// Budget enforcement mode
    pub fn mode(&self) -> EvictionMode {
        self.mode
    }

    /// Number of registered units
    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    /// Returns true if no unit is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the unit is registered
    pub fn contains(&self, unit: &UnitRef) -> bool {
        let inner = self.inner.lock();
        unit.state()
            .slot()
            .is_some_and(|slot| inner.list.contains(slot))
    }

    /// Number of registered units with unsaved changes
    pub fn dirty_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .list
            .iter()
            .filter(|(_, resident)| resident.unit.is_dirty())
            .count()
    }

    /// Statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The backing file
    pub fn file(&self) -> &Arc<BackingFile> {
        &self.file
    }

    /// The allocator handing out ranges of the backing file
    pub fn allocator(&self) -> &Arc<FileSpaceAllocator> {
        &self.allocator
    }

    /// Validate the buffer's bookkeeping
    ///
    /// Only meaningful while no other thread is mutating units: the counter
    /// must equal both the sum of stored footprints and the sum of the units'
    /// current memory sizes, and every registered unit must be loaded and
    /// point back at its own slot.
    pub fn check_invariants(&self) -> Result<(), CacheError> {
        let inner = self.inner.lock();
        let mut stored = 0u64;
        let mut measured = 0u64;

        for (slot, resident) in inner.list.iter() {
            let snap = resident.unit.state().snapshot();
            if !snap.loaded {
                return Err(CacheError::Precondition(
                    "registered unit is not loaded".to_string(),
                ));
            }
            if resident.unit.state().slot() != Some(slot) {
                return Err(CacheError::Precondition(
                    "registered unit does not point at its slot".to_string(),
                ));
            }
            stored += resident.size;
            measured += resident.unit.data_memory_size();
        }

        if stored != inner.resident_bytes || measured != inner.resident_bytes {
            return Err(CacheError::Precondition(format!(
                "resident counter {} disagrees with stored {} / measured {}",
                inner.resident_bytes, stored, measured
            )));
        }
        Ok(())
    }

    /// Start the periodic budget sweep
    ///
    /// Must be called from inside a tokio runtime. The sweep holds a weak
    /// reference, so dropping the last `Arc` ends it. Starting twice is a
    /// no-op.
    pub fn start_background_eviction(self: &Arc<Self>) -> Result<(), CacheError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CacheError::Precondition("background eviction needs a tokio runtime".to_string())
        })?;

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            warn!("Background eviction already running");
            return Ok(());
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let buffer: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval;

        info!(interval_ms = period.as_millis() as u64, "Starting background eviction");

        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Background eviction shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(buffer) = buffer.upgrade() else {
                            break;
                        };
                        match tokio::task::spawn_blocking(move || buffer.ensure_budget()).await {
                            Ok(Ok(BudgetStatus::WithinBudget)) => {},
                            Ok(Ok(BudgetStatus::CouldNotMeetBudget { resident, budget })) => {
                                debug!(resident, budget, "Sweep could not meet budget");
                            },
                            Ok(Err(e)) => {
                                warn!(error = %e, "Background eviction pass failed");
                            },
                            Err(e) => {
                                error!(error = %e, "Background eviction task panicked");
                                break;
                            },
                        }
                    }
                }
            }

            info!("Background eviction stopped");
        });

        *sweeper = Some(Sweeper {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the periodic sweep and wait for it to exit
    pub async fn stop_background_eviction(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown_tx.send(()).await;
            if let Err(e) = sweeper.handle.await {
                warn!(error = %e, "Background eviction task did not exit cleanly");
            }
        }
    }

    /// Returns true while a background sweep is attached
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|sweeper| !sweeper.handle.is_finished())
    }

    /// Flush all dirty units and sync the backing file
    ///
    /// Signals a running sweep to stop but does not wait for it.
    ///
    /// # Errors
    ///
    /// Save failures are returned as from [`flush_all`](Self::flush_all). If
    /// a worker still has a dirty unit pinned, its data is not on disk and
    /// `Precondition` is returned after everything else was flushed.
    pub fn shutdown(&self) -> Result<(), CacheError> {
        if let Some(sweeper) = self.sweeper.lock().take() {
            let _ = sweeper.shutdown_tx.try_send(());
        }
        let status = self.flush_all()?;
        self.file.sync()?;
        if !status.is_complete() {
            warn!(skipped = status.skipped, "Shutdown left pinned units unsaved");
            return Err(CacheError::Precondition(format!(
                "{} dirty units were still pinned at shutdown",
                status.skipped
            )));
        }
        info!(
            resident_bytes = self.resident_bytes(),
            end_of_file = self.allocator.end_of_file(),
            "Eviction buffer shut down"
        );
        Ok(())
    }

    fn publish_usage(&self) {
        if self.publish_metrics {
            metrics::update_usage(self.resident_bytes(), self.allocator.end_of_file());
        }
    }

    fn record_io_error(&self, e: &CacheError, operation: &str) {
        self.stats.record_io_error();
        if self.publish_metrics {
            metrics::record_io_error(e.kind(), operation);
        }
    }
}

impl Drop for EvictionBuffer {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            let _ = sweeper.shutdown_tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::ShrinkPolicy;
    use crate::units::ByteBlock;
    use tempfile::TempDir;

    fn setup(budget: u64) -> (TempDir, EvictionBuffer) {
        let temp_dir = TempDir::new().unwrap();
        let file = Arc::new(BackingFile::create(temp_dir.path().join("cache.bin")).unwrap());
        let allocator = Arc::new(FileSpaceAllocator::new(ShrinkPolicy::KeepInPlace));
        let config = CacheConfig::new(budget).with_metrics(false);
        (temp_dir, EvictionBuffer::new(&config, file, allocator))
    }

    fn block(len: usize, fill: u8) -> UnitRef {
        Arc::new(ByteBlock::new(vec![fill; len]))
    }

    #[test]
    fn test_touch_registers_and_counts() {
        let (_dir, buffer) = setup(1_000);
        let a = block(100, 1);

        assert_eq!(buffer.touch(&a).unwrap(), BudgetStatus::WithinBudget);
        assert!(buffer.contains(&a));
        assert_eq!(buffer.resident_bytes(), 100);

        // Second touch is a hit and does not double count
        buffer.touch(&a).unwrap();
        assert_eq!(buffer.resident_bytes(), 100);
        assert_eq!(buffer.stats().snapshot().hits, 1);
        buffer.check_invariants().unwrap();
    }

    #[test]
    fn test_eviction_saves_dirty_unit() {
        let (_dir, buffer) = setup(150);
        let a = block(100, 7);
        let b = block(100, 8);

        buffer.touch(&a).unwrap();
        buffer.touch(&b).unwrap();

        assert!(!buffer.contains(&a));
        assert!(a.was_saved());
        assert!(!a.is_loaded());
        assert!(!a.is_dirty());
        assert_eq!(buffer.resident_bytes(), 100);
        assert_eq!(buffer.stats().snapshot().evictions, 1);
        buffer.check_invariants().unwrap();

        // Reload brings the bytes back
        buffer.touch(&a).unwrap();
        assert!(a.is_loaded());
        assert!(!buffer.contains(&b));
    }

    #[test]
    fn test_note_size_changed() {
        let (_dir, buffer) = setup(1_000);
        let a = block(100, 0);
        buffer.touch(&a).unwrap();

        assert!(buffer.note_size_changed(&a, 20));
        assert_eq!(buffer.resident_bytes(), 120);
        assert!(buffer.note_size_changed(&a, -50));
        assert_eq!(buffer.resident_bytes(), 70);

        let stranger = block(10, 0);
        assert!(!buffer.note_size_changed(&stranger, 5));
    }

    #[test]
    fn test_remove_keeps_unit_data() {
        let (_dir, buffer) = setup(1_000);
        let a = block(64, 3);
        buffer.touch(&a).unwrap();

        assert!(buffer.remove(&a));
        assert!(!buffer.remove(&a));
        assert!(a.is_loaded());
        assert_eq!(buffer.resident_bytes(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_object_deleted_releases_range() {
        let (_dir, buffer) = setup(1_000);
        let a = block(64, 3);
        buffer.touch(&a).unwrap();
        buffer.flush_all().unwrap();

        let range = a.file_range().unwrap();
        assert_eq!(buffer.allocator().free_bytes(), 0);

        buffer.object_deleted(&a).unwrap();
        assert!(a.file_range().is_none());
        assert_eq!(buffer.allocator().free_space_map(), vec![range]);
    }

    #[test]
    fn test_flush_skips_pinned_unit() {
        let (_dir, buffer) = setup(1_000);
        let a = block(32, 1);
        let b = block(32, 2);
        buffer.touch(&b).unwrap();

        let guard = buffer.pin(&a).unwrap();
        let status = buffer.flush_all().unwrap();
        assert_eq!(status, FlushStatus { saved: 1, skipped: 1 });
        assert!(!status.is_complete());
        assert!(a.is_dirty());
        assert!(!b.is_dirty());
        assert_eq!(buffer.dirty_count(), 1);

        drop(guard);
        let status = buffer.flush_all().unwrap();
        assert_eq!(status, FlushStatus { saved: 1, skipped: 0 });
        assert!(status.is_complete());
        assert_eq!(buffer.dirty_count(), 0);
    }

    #[test]
    fn test_shutdown_fails_while_dirty_unit_pinned() {
        let (_dir, buffer) = setup(1_000);
        let a = block(32, 1);
        let b = block(32, 2);
        buffer.touch(&b).unwrap();

        let guard = buffer.pin(&a).unwrap();
        assert!(matches!(buffer.shutdown(), Err(CacheError::Precondition(_))));
        // Everything that was not pinned still made it to disk
        assert!(!b.is_dirty());
        assert!(a.is_dirty());

        drop(guard);
        buffer.shutdown().unwrap();
        assert!(!a.is_dirty());
    }

    #[test]
    fn test_touched_unit_survives_its_own_budget_pass() {
        let (_dir, buffer) = setup(150);
        let a = block(100, 1);
        let b = block(100, 2);

        let guard = buffer.pin(&a).unwrap();
        let status = buffer.touch(&b).unwrap();

        // a is pinned and b was just touched, so neither can go
        assert_eq!(
            status,
            BudgetStatus::CouldNotMeetBudget {
                resident: 200,
                budget: 150
            }
        );
        assert!(buffer.contains(&b));
        assert!(b.is_loaded());
        assert!(!b.is_busy());
        assert!(buffer.contains(&a));
        drop(guard);

        // Once a is released a later touch of b evicts it instead
        assert_eq!(buffer.touch(&b).unwrap(), BudgetStatus::WithinBudget);
        assert!(!buffer.contains(&a));
        assert!(b.is_loaded());
        buffer.check_invariants().unwrap();
    }

    #[test]
    fn test_single_oversized_unit_stays_loaded_after_touch() {
        let (_dir, buffer) = setup(40);
        let a = block(100, 5);

        let status = buffer.touch(&a).unwrap();
        assert!(!status.is_within_budget());
        assert!(a.is_loaded());

        // An explicit pass has no touched unit to spare
        assert_eq!(buffer.ensure_budget().unwrap(), BudgetStatus::WithinBudget);
        assert!(!a.is_loaded());
        assert!(a.was_saved());
    }

    #[test]
    fn test_set_budget_then_ensure() {
        let (_dir, buffer) = setup(1_000);
        let units: Vec<UnitRef> = (0..4).map(|i| block(100, i)).collect();
        for unit in &units {
            buffer.touch(unit).unwrap();
        }
        assert_eq!(buffer.resident_bytes(), 400);

        buffer.set_budget(200);
        assert_eq!(buffer.ensure_budget().unwrap(), BudgetStatus::WithinBudget);
        assert_eq!(buffer.resident_bytes(), 200);
        assert!(!buffer.contains(&units[0]));
        assert!(!buffer.contains(&units[1]));
        assert!(buffer.contains(&units[3]));
    }

    #[test]
    fn test_debug_output_summarizes_buffer() {
        let (_dir, buffer) = setup(1_000);
        buffer.touch(&block(10, 0)).unwrap();
        let text = format!("{:?}", buffer);
        assert!(text.contains("EvictionBuffer"));
        assert!(text.contains("resident_bytes: 10"));
    }

    #[test]
    fn test_background_start_outside_runtime_fails() {
        let (_dir, buffer) = setup(1_000);
        let buffer = Arc::new(buffer);
        assert!(matches!(
            buffer.start_background_eviction(),
            Err(CacheError::Precondition(_))
        ));
    }
}
