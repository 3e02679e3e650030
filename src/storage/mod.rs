//! Storage layer: the backing file, its space allocator, and record framing
//!
//! # Architecture
//!
//! ```text
//! EvictionBuffer ──save/load──▶ Cacheable unit ──records──▶ BackingFile
//!       │                                                       ▲
//!       └──────allocate / release / reallocate──▶ FileSpaceAllocator
//! ```
//!
//! - **BackingFile**: positional reads and writes on one file
//! - **FileSpaceAllocator**: first-fit free list plus end-of-file bump pointer
//! - **Record**: header + payload framing used by the bundled unit types

/// First-fit free-space allocator
pub mod allocator;
/// Positional I/O on the single backing file
pub mod backing_file;
/// Self-describing record slots
pub mod record;

pub use allocator::{FileSpaceAllocator, ShrinkPolicy};
pub use backing_file::BackingFile;
pub use record::{RecordHeader, RecordKind, RECORD_HEADER_SIZE};
