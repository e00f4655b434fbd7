//! Capture lifecycle.
//!
//! [`StateMachine`] is the only place that decides whether sources run.
//! Every transition is persisted so a restarted agent resumes where it was,
//! subject to consent.

pub mod machine;

pub use machine::{load_state, CaptureState, StateError, StateMachine, Subscriber};
