//! In-memory side of the cache: units, recency tracking and eviction
//!
//! # Architecture
//!
//! ```text
//!  worker threads                     EvictionBuffer
//!  ──────────────                ┌──────────────────────────┐
//!  pin(unit) ──touch──────────▶  │ RecencyList (LRU ▶ MRU)  │
//!  mutate, mark_changed          │ resident byte counter    │
//!  drop guard (busy = false)     └────────────┬─────────────┘
//!                                             │ ensure_budget
//!                                             ▼
//!                          write back dirty LRU victims, clear memory
//! ```
//!
//! - [`Cacheable`]: the contract every payload shape implements
//! - [`EvictionBuffer`]: budget enforcement over all loaded units
//! - [`BusyGuard`]: scoped pin that keeps a unit out of eviction

mod buffer;
mod guard;
pub mod recency;
mod stats;
pub mod unit;

pub use buffer::{BudgetStatus, EvictionBuffer, FlushStatus};
pub use guard::BusyGuard;
pub use recency::{RecencyList, SlotHandle};
pub use stats::{CacheStats, CacheStatsSnapshot};
pub use unit::{Cacheable, UnitRef, UnitSnapshot, UnitState};
