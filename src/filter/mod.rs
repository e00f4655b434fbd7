//! Two-layer privacy filter.
//!
//! - [`context`]: layer 1, blocks events from sensitive contexts entirely
//! - [`scrubber`]: layer 2, redacts PII from whatever is allowed through

pub mod browsers;
pub mod context;
pub mod scrubber;

pub use context::{BlockReason, ContextFilter, FilterDecision};
pub use scrubber::{
    ContentScrubber, ScrubberError, BINARY_FIELDS, MAX_TEXT_CHARS, REDACTION_MARKER,
};
