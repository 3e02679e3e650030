//! The cacheable unit contract
//!
//! A unit owns one chunk of data (a box of events, a block of bytes) that can
//! live in memory, in a range of the backing file, or both. Concrete payload
//! types implement the small set of required methods on [`Cacheable`]; the
//! provided methods layer the bookkeeping contract on top so every payload
//! shape gets the same lifecycle:
//!
//! ```text
//!   new ──▶ loaded+dirty ──save──▶ loaded+clean ──clear──▶ on disk
//!                ▲                     │  ▲                   │
//!                └──set_data_changed───┘  └───────load────────┘
//! ```
//!
//! Invariant: a dirty unit is always loaded.

use crate::cache::recency::SlotHandle;
use crate::error::CacheError;
use crate::storage::backing_file::BackingFile;
use crate::types::FileRange;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const IDLE: u8 = 0;
const BUSY: u8 = 1;
const EVICTING: u8 = 2;

/// Shared handle to a unit of any payload shape
pub type UnitRef = Arc<dyn Cacheable>;

#[derive(Debug)]
struct Bookkeeping {
    range: Option<FileRange>,
    was_saved: bool,
    loaded: bool,
    dirty: bool,
    /// Bumped on every in-memory change; lets a save detect that the unit was
    /// modified while it was being written
    changes: u64,
    slot: Option<SlotHandle>,
}

/// Point-in-time view of a unit's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitSnapshot {
    /// Range owned in the backing file, if any
    pub range: Option<FileRange>,
    /// Has ever been written to disk
    pub was_saved: bool,
    /// In-memory representation is valid
    pub loaded: bool,
    /// In-memory contents differ from the last on-disk image
    pub dirty: bool,
    /// Pinned by a worker
    pub busy: bool,
}

/// Bookkeeping every cacheable unit embeds
///
/// The busy flag is advisory: the eviction scan skips busy units but never
/// waits on them. Set and clear it from the thread that is using the unit.
#[derive(Debug)]
pub struct UnitState {
    pin: AtomicU8,
    io: Mutex<()>,
    book: Mutex<Bookkeeping>,
}

impl UnitState {
    /// State for a unit created in memory and never saved
    ///
    /// Such a unit is dirty by construction.
    pub fn new() -> Self {
        Self::with_book(Bookkeeping {
            range: None,
            was_saved: false,
            loaded: true,
            dirty: true,
            changes: 0,
            slot: None,
        })
    }

    /// State for a unit whose data currently lives only in `range`
    pub fn on_disk(range: FileRange) -> Self {
        Self::with_book(Bookkeeping {
            range: Some(range),
            was_saved: true,
            loaded: false,
            dirty: false,
            changes: 0,
            slot: None,
        })
    }

    fn with_book(book: Bookkeeping) -> Self {
        Self {
            pin: AtomicU8::new(IDLE),
            io: Mutex::new(()),
            book: Mutex::new(book),
        }
    }

    /// Returns true while a worker has the unit pinned
    pub fn is_busy(&self) -> bool {
        self.pin.load(Ordering::Acquire) == BUSY
    }

    /// Returns true while a worker or the eviction scan holds the unit
    pub fn is_pinned(&self) -> bool {
        self.pin.load(Ordering::Acquire) != IDLE
    }

    /// Mark the unit busy or not busy
    ///
    /// Marking busy waits while the eviction scan is writing this unit back;
    /// that wait is bounded by a single save.
    pub fn set_busy(&self, busy: bool) {
        if busy {
            loop {
                match self
                    .pin
                    .compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) | Err(BUSY) => return,
                    Err(_) => std::thread::yield_now(),
                }
            }
        } else {
            let _ = self
                .pin
                .compare_exchange(BUSY, IDLE, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Mark the unit busy only if nobody holds it
    pub fn try_set_busy(&self) -> bool {
        self.pin
            .compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn try_begin_eviction(&self) -> bool {
        self.pin
            .compare_exchange(IDLE, EVICTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_eviction(&self) {
        let _ = self
            .pin
            .compare_exchange(EVICTING, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }

    /// In-memory representation is valid
    pub fn is_loaded(&self) -> bool {
        self.book.lock().loaded
    }

    /// In-memory contents differ from the last on-disk image
    pub fn is_dirty(&self) -> bool {
        self.book.lock().dirty
    }

    /// Has ever been written to disk
    pub fn was_saved(&self) -> bool {
        self.book.lock().was_saved
    }

    /// Range owned in the backing file
    ///
    /// A range is assigned right before the first save, so a unit can own a
    /// range while `was_saved` is still false if that save failed.
    pub fn file_range(&self) -> Option<FileRange> {
        self.book.lock().range
    }

    /// Offset of the owned range
    pub fn file_offset(&self) -> Option<u64> {
        self.file_range().map(|r| r.offset)
    }

    /// Length of the owned range
    pub fn file_length(&self) -> Option<u64> {
        self.file_range().map(|r| r.length)
    }

    /// Record an in-place mutation of loaded data
    ///
    /// A never-saved unit is already dirty, so only the change counter moves.
    pub fn set_data_changed(&self) {
        let mut book = self.book.lock();
        if !book.loaded {
            return;
        }
        book.changes = book.changes.wrapping_add(1);
        if book.was_saved {
            book.dirty = true;
        }
    }

    /// Reset the dirty flag after the owning cache cleared the unit
    ///
    /// Has no effect on a unit that was never saved.
    pub fn clear_data_changed(&self) {
        let mut book = self.book.lock();
        if book.was_saved {
            book.dirty = false;
        }
    }

    /// Consistent view of all flags
    pub fn snapshot(&self) -> UnitSnapshot {
        let book = self.book.lock();
        UnitSnapshot {
            range: book.range,
            was_saved: book.was_saved,
            loaded: book.loaded,
            dirty: book.dirty,
            busy: self.is_busy(),
        }
    }

    pub(crate) fn io_lock(&self) -> MutexGuard<'_, ()> {
        self.io.lock()
    }

    pub(crate) fn assign_range(&self, range: FileRange) {
        self.book.lock().range = Some(range);
    }

    pub(crate) fn take_range(&self) -> Option<FileRange> {
        let mut book = self.book.lock();
        book.was_saved = false;
        book.range.take()
    }

    pub(crate) fn change_count(&self) -> u64 {
        self.book.lock().changes
    }

    /// Record a successful save of the image taken at `changes`
    pub(crate) fn mark_saved(&self, changes: u64) {
        let mut book = self.book.lock();
        book.was_saved = true;
        if book.changes == changes {
            book.dirty = false;
        } else {
            // Modified while the save was running; the disk image is stale
            book.dirty = true;
        }
    }

    pub(crate) fn mark_loaded(&self) {
        let mut book = self.book.lock();
        book.loaded = true;
        book.dirty = false;
    }

    /// Flip to not-loaded if clean; returns false if already not loaded
    fn begin_clear(&self) -> Result<bool, CacheError> {
        let mut book = self.book.lock();
        if !book.loaded {
            return Ok(false);
        }
        if book.dirty {
            return Err(CacheError::Precondition(
                "cannot clear a unit with unsaved changes".to_string(),
            ));
        }
        book.loaded = false;
        Ok(true)
    }

    pub(crate) fn slot(&self) -> Option<SlotHandle> {
        self.book.lock().slot
    }

    pub(crate) fn set_slot(&self, slot: Option<SlotHandle>) {
        self.book.lock().slot = slot;
    }
}

impl Default for UnitState {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability interface implemented by every payload shape
///
/// Implementors provide payload-level I/O and sizes; the provided methods
/// enforce the lifecycle contract. The eviction buffer and the allocator only
/// ever see `dyn Cacheable`.
pub trait Cacheable: Send + Sync {
    /// Embedded bookkeeping
    fn state(&self) -> &UnitState;

    /// Serialize the in-memory payload into `range`
    fn write_to(&self, file: &BackingFile, range: FileRange) -> Result<(), CacheError>;

    /// Deserialize the payload stored in `range` into memory
    fn read_from(&self, file: &BackingFile, range: FileRange) -> Result<(), CacheError>;

    /// Drop the in-memory payload
    fn release_memory(&self);

    /// Logical on-disk size of the payload regardless of residency
    fn total_data_size(&self) -> u64;

    /// Bytes currently held in memory (0 when not loaded)
    fn data_memory_size(&self) -> u64;

    /// Write the in-memory data into the assigned file range
    ///
    /// On success the unit is marked saved and, unless it was modified while
    /// the write was in flight, clean. On failure nothing changes.
    fn save(&self, file: &BackingFile) -> Result<(), CacheError> {
        let state = self.state();
        let _io = state.io_lock();

        let range = state.file_range().ok_or_else(|| {
            CacheError::Precondition("no file range assigned before save".to_string())
        })?;
        if !state.is_loaded() {
            return Err(CacheError::Precondition(
                "cannot save a unit whose data is not in memory".to_string(),
            ));
        }

        let changes = state.change_count();
        self.write_to(file, range)?;
        state.mark_saved(changes);
        Ok(())
    }

    /// Populate memory from the assigned file range
    ///
    /// Loading an already loaded unit is a no-op.
    fn load(&self, file: &BackingFile) -> Result<(), CacheError> {
        let state = self.state();
        let _io = state.io_lock();

        if state.is_loaded() {
            return Ok(());
        }
        let range = match state.file_range() {
            Some(range) if state.was_saved() => range,
            _ => {
                return Err(CacheError::Precondition(
                    "cannot load a unit that was never saved".to_string(),
                ))
            },
        };

        self.read_from(file, range)?;
        state.mark_loaded();
        Ok(())
    }

    /// Push state the unit buffers on its own down to the backing file
    ///
    /// Called by [`EvictionBuffer::flush_all`](crate::cache::EvictionBuffer::flush_all)
    /// after each save, before the buffer syncs the file once for the whole
    /// pass. Units that write straight through `write_to` have nothing to do.
    fn flush_data(&self, _file: &BackingFile) -> Result<(), CacheError> {
        Ok(())
    }

    /// Release the in-memory representation
    ///
    /// Fails if the unit is busy or has unsaved changes. Clearing a unit that
    /// is not loaded is a no-op.
    fn clear_data_from_memory(&self) -> Result<(), CacheError> {
        let state = self.state();
        let _io = state.io_lock();

        if state.is_busy() {
            return Err(CacheError::Precondition(
                "cannot clear a busy unit".to_string(),
            ));
        }
        if state.begin_clear()? {
            self.release_memory();
        }
        Ok(())
    }

    /// See [`UnitState::is_busy`]
    fn is_busy(&self) -> bool {
        self.state().is_busy()
    }

    /// See [`UnitState::set_busy`]
    fn set_busy(&self, busy: bool) {
        self.state().set_busy(busy)
    }

    /// See [`UnitState::is_loaded`]
    fn is_loaded(&self) -> bool {
        self.state().is_loaded()
    }

    /// See [`UnitState::is_dirty`]
    fn is_dirty(&self) -> bool {
        self.state().is_dirty()
    }

    /// See [`UnitState::was_saved`]
    fn was_saved(&self) -> bool {
        self.state().was_saved()
    }

    /// See [`UnitState::set_data_changed`]
    fn set_data_changed(&self) {
        self.state().set_data_changed()
    }

    /// See [`UnitState::clear_data_changed`]
    fn clear_data_changed(&self) {
        self.state().clear_data_changed()
    }

    /// See [`UnitState::file_range`]
    fn file_range(&self) -> Option<FileRange> {
        self.state().file_range()
    }
}

/// Compare two unit handles by identity
pub(crate) fn same_unit(a: &UnitRef, b: &UnitRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
