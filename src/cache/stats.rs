//! Counters kept by the eviction buffer

use std::sync::atomic::{AtomicU64, Ordering};

/// Eviction buffer statistics
///
/// All counters are relaxed atomics; a snapshot taken while workers are
/// running is approximate.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Calls to `touch` (including through `pin`)
    pub touches: AtomicU64,

    /// Touches that found the unit already resident
    pub hits: AtomicU64,

    /// Units read back from the backing file
    pub loads: AtomicU64,

    /// Units cleared from memory by `ensure_budget`
    pub evictions: AtomicU64,

    /// Successful write-backs
    pub saves: AtomicU64,

    /// Bytes written by write-backs
    pub bytes_written: AtomicU64,

    /// Resident bytes brought in by loads
    pub bytes_read: AtomicU64,

    /// `ensure_budget` calls that found every remaining unit busy
    pub budget_misses: AtomicU64,

    /// Failed saves and loads
    pub io_errors: AtomicU64,

    /// Highest resident byte count observed
    pub peak_resident_bytes: AtomicU64,
}

/// Plain-value copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// See [`CacheStats::touches`]
    pub touches: u64,
    /// See [`CacheStats::hits`]
    pub hits: u64,
    /// See [`CacheStats::loads`]
    pub loads: u64,
    /// See [`CacheStats::evictions`]
    pub evictions: u64,
    /// See [`CacheStats::saves`]
    pub saves: u64,
    /// See [`CacheStats::bytes_written`]
    pub bytes_written: u64,
    /// See [`CacheStats::bytes_read`]
    pub bytes_read: u64,
    /// See [`CacheStats::budget_misses`]
    pub budget_misses: u64,
    /// See [`CacheStats::io_errors`]
    pub io_errors: u64,
    /// See [`CacheStats::peak_resident_bytes`]
    pub peak_resident_bytes: u64,
}

impl CacheStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_touch(&self, hit: bool) {
        self.touches.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_load(&self, bytes: u64) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_save(&self, bytes: u64) {
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_budget_miss(&self) {
        self.budget_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_resident(&self, bytes: u64) {
        self.peak_resident_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    /// Fraction of touches that were hits (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let touches = self.touches.load(Ordering::Relaxed);
        if touches == 0 {
            0.0
        } else {
            self.hits.load(Ordering::Relaxed) as f64 / touches as f64
        }
    }

    /// Copy every counter
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            touches: self.touches.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            budget_misses: self.budget_misses.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            peak_resident_bytes: self.peak_resident_bytes.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.touches.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.loads.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.saves.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.budget_misses.store(0, Ordering::Relaxed);
        self.io_errors.store(0, Ordering::Relaxed);
        // Peak is a high-water mark, not a rate
    }
}
