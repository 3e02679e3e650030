//! boxcache - out-of-core caching and write-back for large in-memory datasets
//!
//! A dataset is split into many independently cacheable units (boxes of
//! detector events, blocks of bytes). Units page between memory and a single
//! backing file so the total resident size stays under a configured ceiling:
//! - a first-fit allocator hands out ranges of the backing file
//! - an LRU eviction buffer writes back and clears idle units when over budget
//! - an advisory busy flag keeps units that are in use out of eviction
//!
//! # Example
//!
//! ```rust
//! use boxcache::units::{DetectorEvent, EventBox};
//! use boxcache::{CacheConfig, CacheSession, UnitRef};
//! use std::sync::Arc;
//!
//! # fn main() -> boxcache::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let session = CacheSession::create(dir.path().join("cache.bin"), CacheConfig::new(4096))?;
//!
//! let events = Arc::new(EventBox::new());
//! let unit: UnitRef = events.clone();
//! {
//!     let guard = session.buffer().pin(&unit)?;
//!     let delta = events.push(DetectorEvent::new(1250.0, 0))?;
//!     session.buffer().note_size_changed(guard.unit(), delta);
//! }
//! session.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod error;
pub mod storage;
pub mod types;
pub mod units;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Backing file, allocator and buffer wired together
pub mod session;

// Re-export main types
pub use cache::{
    BudgetStatus, BusyGuard, Cacheable, EvictionBuffer, FlushStatus, UnitRef, UnitState,
};
pub use config::{CacheConfig, EvictionMode};
pub use error::{CacheError, Error, Result};
pub use session::{CacheSession, SpaceManifest};
pub use storage::{BackingFile, FileSpaceAllocator, ShrinkPolicy};
pub use types::FileRange;
