//! Transparency module.
//!
//! Exposes what the agent has collected and withheld, supporting user
//! trust and the read-only recent-events view.

pub mod log;

pub use log::{SharedTransparencyLog, TransparencyLog, TransparencyStats, DEFAULT_RECENT_CAPACITY};
