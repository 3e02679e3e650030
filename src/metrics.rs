//! Metrics and telemetry for the cache
//!
//! Prometheus counters and gauges for eviction activity, backing-file I/O and
//! memory pressure. Every eviction buffer in the process reports into the same
//! default registry.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};

lazy_static! {
    // === Eviction ===

    /// Units cleared from memory to meet the budget
    pub static ref EVICTIONS_TOTAL: Counter = register_counter!(
        "boxcache_evictions_total",
        "Total units evicted from memory"
    ).unwrap();

    /// Budget enforcement passes that ran out of evictable units
    pub static ref BUDGET_MISSES_TOTAL: Counter = register_counter!(
        "boxcache_budget_misses_total",
        "Total ensure_budget calls that could not reach the ceiling"
    ).unwrap();

    /// Time spent writing back and clearing a single victim
    pub static ref EVICTION_DURATION: Histogram = register_histogram!(
        "boxcache_eviction_duration_seconds",
        "Latency of a single eviction in seconds",
        vec![0.0001, 0.001, 0.01, 0.1, 1.0]
    ).unwrap();

    // === Backing file I/O ===

    /// Successful unit saves
    pub static ref SAVES_TOTAL: Counter = register_counter!(
        "boxcache_saves_total",
        "Total unit write-backs"
    ).unwrap();

    /// Successful unit loads
    pub static ref LOADS_TOTAL: Counter = register_counter!(
        "boxcache_loads_total",
        "Total units loaded from the backing file"
    ).unwrap();

    /// Failures by error kind and operation
    pub static ref IO_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "boxcache_io_errors_total",
        "Total failed saves and loads by kind",
        &["kind", "operation"]
    ).unwrap();

    // === Resource gauges ===

    /// Bytes currently resident across all buffers
    pub static ref RESIDENT_BYTES: Gauge = register_gauge!(
        "boxcache_resident_bytes",
        "Resident payload bytes"
    ).unwrap();

    /// Logical end of the backing file
    pub static ref FILE_BYTES: Gauge = register_gauge!(
        "boxcache_file_bytes",
        "Logical length of the backing file"
    ).unwrap();
}

/// Initialize metrics system
pub fn init() {
    lazy_static::initialize(&EVICTIONS_TOTAL);
    lazy_static::initialize(&BUDGET_MISSES_TOTAL);
    lazy_static::initialize(&EVICTION_DURATION);
    lazy_static::initialize(&SAVES_TOTAL);
    lazy_static::initialize(&LOADS_TOTAL);
    lazy_static::initialize(&IO_ERRORS_TOTAL);
    lazy_static::initialize(&RESIDENT_BYTES);
    lazy_static::initialize(&FILE_BYTES);

    tracing::info!("Metrics system initialized");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record an eviction
#[inline]
pub fn record_eviction(duration_secs: f64) {
    EVICTIONS_TOTAL.inc();
    EVICTION_DURATION.observe(duration_secs);
}

/// Record a budget miss
#[inline]
pub fn record_budget_miss() {
    BUDGET_MISSES_TOTAL.inc();
}

/// Record a save
#[inline]
pub fn record_save() {
    SAVES_TOTAL.inc();
}

/// Record a load
#[inline]
pub fn record_load() {
    LOADS_TOTAL.inc();
}

/// Record a failed save or load
#[inline]
pub fn record_io_error(kind: &str, operation: &str) {
    IO_ERRORS_TOTAL.with_label_values(&[kind, operation]).inc();
}

/// Update the resident-bytes and file-length gauges
#[inline]
pub fn update_usage(resident_bytes: u64, file_bytes: u64) {
    RESIDENT_BYTES.set(resident_bytes as f64);
    FILE_BYTES.set(file_bytes as f64);
}
