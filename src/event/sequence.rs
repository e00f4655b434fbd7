//! Session-scoped sequence numbering.

use crate::event::types::{CaptureEvent, RawEvent};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Stamps events with session-ordered sequence numbers.
///
/// Not synchronized on its own: the pipeline owns it behind the same lock
/// that enqueues the stamped event, so numbering order is delivery order.
#[derive(Debug)]
pub struct SequenceAssigner {
    session_id: Uuid,
    session_start: DateTime<Utc>,
    last: u64,
}

impl SequenceAssigner {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            session_start: Utc::now(),
            last: 0,
        }
    }

    /// Start a new session; numbering restarts at 1.
    pub fn begin_session(&mut self) {
        self.session_id = Uuid::new_v4();
        self.session_start = Utc::now();
        self.last = 0;
    }

    /// Assign the next sequence number and a fresh idempotency key.
    pub fn assign(&mut self, raw: RawEvent) -> CaptureEvent {
        self.last += 1;
        CaptureEvent::from_raw(raw, self.last)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    /// Number of events assigned in the current session.
    pub fn assigned(&self) -> u64 {
        self.last
    }
}

impl Default for SequenceAssigner {
    fn default() -> Self {
        Self::new()
    }
}
