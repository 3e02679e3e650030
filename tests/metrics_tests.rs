//! Prometheus gauges track the buffer outside of eviction too
//!
//! Kept in its own test binary: the gauges live in the process-wide registry,
//! so no other buffer may publish while these assertions run.

use boxcache::metrics::{self, FILE_BYTES, RESIDENT_BYTES};
use boxcache::storage::BackingFile;
use boxcache::units::ByteBlock;
use boxcache::{CacheConfig, EvictionBuffer, FileSpaceAllocator, UnitRef};
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_resident_gauge_follows_touch_and_resize() {
    metrics::init();
    let temp_dir = TempDir::new().unwrap();
    let file = Arc::new(BackingFile::create(temp_dir.path().join("metrics.bin")).unwrap());
    let config = CacheConfig::new(10_000).with_metrics(true);
    let buffer = EvictionBuffer::new(&config, file, Arc::new(FileSpaceAllocator::default()));

    // Under budget: no eviction ever runs
    let a: UnitRef = Arc::new(ByteBlock::new(vec![1; 300]));
    let b: UnitRef = Arc::new(ByteBlock::new(vec![2; 200]));
    buffer.touch(&a).unwrap();
    assert_eq!(RESIDENT_BYTES.get(), 300.0);
    buffer.touch(&b).unwrap();
    assert_eq!(RESIDENT_BYTES.get(), 500.0);

    assert!(buffer.note_size_changed(&a, -100));
    assert_eq!(RESIDENT_BYTES.get(), 400.0);
    assert_eq!(FILE_BYTES.get(), 0.0);

    // Eviction still publishes, including the grown file
    buffer.set_budget(250);
    buffer.ensure_budget().unwrap();
    assert_eq!(RESIDENT_BYTES.get(), buffer.resident_bytes() as f64);
    assert_eq!(FILE_BYTES.get(), buffer.allocator().end_of_file() as f64);
    assert!(FILE_BYTES.get() > 0.0);
}
