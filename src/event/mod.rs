//! Activity events and their session ordering.

pub mod sequence;
pub mod types;

pub use sequence::SequenceAssigner;
pub use types::{CaptureEvent, EventType, RawEvent};
