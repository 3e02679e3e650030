//! A box of neutron detector events
//!
//! Event lists are the workload the cache was built for: many boxes, each
//! appended to by worker threads during binning, far more of them than fit in
//! memory at once.
//!
//! # Encoding
//!
//! Events are stored back to back, 24 bytes each, little endian:
//!
//! ```text
//! Offset | Size | Field
//! -------|------|------------------
//!   0    |  8   | tof (f64)
//!   8    |  8   | pulse_time (i64, ns)
//!  16    |  4   | weight (f32)
//!  20    |  4   | error_squared (f32)
//! ```

use crate::cache::unit::{Cacheable, UnitState};
use crate::error::CacheError;
use crate::storage::backing_file::BackingFile;
use crate::storage::record::{read_record, record_len, write_record, RecordKind};
use crate::types::FileRange;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Encoded size of one event
pub const EVENT_SIZE: usize = 24;

/// A single weighted detector event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorEvent {
    /// Time of flight in microseconds
    pub tof: f64,
    /// Pulse time in nanoseconds since the epoch
    pub pulse_time: i64,
    /// Event weight
    pub weight: f32,
    /// Squared error of the weight
    pub error_squared: f32,
}

impl DetectorEvent {
    /// Unweighted event
    pub fn new(tof: f64, pulse_time: i64) -> Self {
        Self {
            tof,
            pulse_time,
            weight: 1.0,
            error_squared: 1.0,
        }
    }

    /// Weighted event
    pub fn weighted(tof: f64, pulse_time: i64, weight: f32, error_squared: f32) -> Self {
        Self {
            tof,
            pulse_time,
            weight,
            error_squared,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tof.to_le_bytes());
        out.extend_from_slice(&self.pulse_time.to_le_bytes());
        out.extend_from_slice(&self.weight.to_le_bytes());
        out.extend_from_slice(&self.error_squared.to_le_bytes());
    }

    fn decode(chunk: &[u8]) -> Self {
        let mut w8 = [0u8; 8];
        let mut w4 = [0u8; 4];

        w8.copy_from_slice(&chunk[0..8]);
        let tof = f64::from_le_bytes(w8);
        w8.copy_from_slice(&chunk[8..16]);
        let pulse_time = i64::from_le_bytes(w8);
        w4.copy_from_slice(&chunk[16..20]);
        let weight = f32::from_le_bytes(w4);
        w4.copy_from_slice(&chunk[20..24]);
        let error_squared = f32::from_le_bytes(w4);

        Self {
            tof,
            pulse_time,
            weight,
            error_squared,
        }
    }
}

/// Encode events into a record payload
pub fn encode_events(events: &[DetectorEvent]) -> Vec<u8> {
    let mut out = Vec::with_capacity(events.len() * EVENT_SIZE);
    for event in events {
        event.encode_into(&mut out);
    }
    out
}

/// Decode a record payload
pub fn decode_events(payload: &[u8]) -> Result<Vec<DetectorEvent>, CacheError> {
    if payload.len() % EVENT_SIZE != 0 {
        return Err(CacheError::CorruptedData(format!(
            "event payload of {} bytes is not a multiple of {}",
            payload.len(),
            EVENT_SIZE
        )));
    }
    Ok(payload.chunks_exact(EVENT_SIZE).map(DetectorEvent::decode).collect())
}

/// Event list unit
#[derive(Debug)]
pub struct EventBox {
    state: UnitState,
    events: RwLock<Option<Vec<DetectorEvent>>>,
    /// Event count, kept while the events are paged out
    count: AtomicU64,
}

impl EventBox {
    /// Empty in-memory box
    pub fn new() -> Self {
        Self::with_events(Vec::new())
    }

    /// In-memory box holding `events`; dirty until first saved
    pub fn with_events(events: Vec<DetectorEvent>) -> Self {
        Self {
            state: UnitState::new(),
            count: AtomicU64::new(events.len() as u64),
            events: RwLock::new(Some(events)),
        }
    }

    /// Box whose `count` events are stored in `range`
    pub fn on_disk(range: FileRange, count: u64) -> Self {
        Self {
            state: UnitState::on_disk(range),
            events: RwLock::new(None),
            count: AtomicU64::new(count),
        }
    }

    /// Number of events, resident or not
    pub fn len(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true if the box holds no events
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append events; returns the change in memory footprint
    pub fn extend(&self, new_events: &[DetectorEvent]) -> Result<i64, CacheError> {
        self.modify(|events| events.extend_from_slice(new_events))
            .map(|((), delta)| delta)
    }

    /// Append one event; returns the change in memory footprint
    pub fn push(&self, event: DetectorEvent) -> Result<i64, CacheError> {
        self.extend(std::slice::from_ref(&event))
    }

    /// Sort the loaded events by time of flight
    pub fn sort_by_tof(&self) -> Result<(), CacheError> {
        self.modify(|events| events.sort_by(|a, b| a.tof.total_cmp(&b.tof)))
            .map(|_| ())
    }

    /// Drop every event; returns the change in memory footprint
    pub fn clear_events(&self) -> Result<i64, CacheError> {
        self.modify(Vec::clear).map(|((), delta)| delta)
    }

    /// Run `f` over the loaded events
    pub fn with_events_ref<R>(&self, f: impl FnOnce(&[DetectorEvent]) -> R) -> Result<R, CacheError> {
        let events = self.events.read();
        let events = events.as_deref().ok_or_else(not_loaded)?;
        Ok(f(events))
    }

    /// Copy of the loaded events
    pub fn events(&self) -> Result<Vec<DetectorEvent>, CacheError> {
        self.with_events_ref(<[DetectorEvent]>::to_vec)
    }

    /// Sum of weights of the loaded events
    pub fn total_weight(&self) -> Result<f64, CacheError> {
        self.with_events_ref(|events| events.iter().map(|e| e.weight as f64).sum())
    }

    fn modify<R>(&self, f: impl FnOnce(&mut Vec<DetectorEvent>) -> R) -> Result<(R, i64), CacheError> {
        let mut guard = self.events.write();
        let events = guard.as_mut().ok_or_else(not_loaded)?;

        let before = events.len();
        let result = f(&mut *events);
        let after = events.len();

        self.count.store(after as u64, Ordering::Release);
        self.state.set_data_changed();
        Ok((result, (after as i64 - before as i64) * EVENT_SIZE as i64))
    }
}

impl Default for EventBox {
    fn default() -> Self {
        Self::new()
    }
}

fn not_loaded() -> CacheError {
    CacheError::Precondition("event box is not loaded".to_string())
}

impl Cacheable for EventBox {
    fn state(&self) -> &UnitState {
        &self.state
    }

    fn write_to(&self, file: &BackingFile, range: FileRange) -> Result<(), CacheError> {
        let payload = {
            let events = self.events.read();
            encode_events(events.as_deref().ok_or_else(not_loaded)?)
        };
        write_record(file, range, RecordKind::Events, &payload)
    }

    fn read_from(&self, file: &BackingFile, range: FileRange) -> Result<(), CacheError> {
        let payload = read_record(file, range, RecordKind::Events)?;
        let events = decode_events(&payload)?;
        self.count.store(events.len() as u64, Ordering::Release);
        *self.events.write() = Some(events);
        Ok(())
    }

    fn release_memory(&self) {
        *self.events.write() = None;
    }

    fn total_data_size(&self) -> u64 {
        record_len(self.len() * EVENT_SIZE as u64)
    }

    fn data_memory_size(&self) -> u64 {
        self.events
            .read()
            .as_ref()
            .map_or(0, |events| (events.len() * EVENT_SIZE) as u64)
    }
}
