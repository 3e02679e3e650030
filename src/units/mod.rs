//! Concrete cacheable payloads
//!
//! - [`ByteBlock`]: opaque bytes
//! - [`EventBox`]: a list of detector events

mod byte_block;
pub mod event_box;

pub use byte_block::ByteBlock;
pub use event_box::{DetectorEvent, EventBox, EVENT_SIZE};
