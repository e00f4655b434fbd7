//! Idle detection.
//!
//! Two states, Active and Idle. The detector itself is pure; [`IdleMonitor`]
//! shares it between the input worker (activity) and the check thread
//! (timeouts).

use crate::collector::focus::CurrentForeground;
use crate::collector::{CollectorError, EventSink, EventSource};
use crate::event::{EventType, RawEvent};
use chrono::{DateTime, DurationRound, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default inactivity before the user counts as idle.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(300);

/// Width of the bins idle durations are reported in.
pub const IDLE_BIN_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Active,
    /// `reported` is the bin-aligned start that went out with IdleStart.
    Idle {
        since: DateTime<Utc>,
        reported: DateTime<Utc>,
    },
}

fn bin_width() -> chrono::Duration {
    chrono::Duration::minutes(IDLE_BIN_MINUTES)
}

/// Round `at` down to the start of its idle bin.
fn floor_to_bin(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(bin_width()).unwrap_or(at)
}

/// A state change worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleTransition {
    IdleStart {
        at: DateTime<Utc>,
    },
    IdleEnd {
        at: DateTime<Utc>,
        /// Idle duration rounded down to whole bins.
        idle_minutes_binned: i64,
    },
}

impl IdleTransition {
    pub fn into_event(self) -> RawEvent {
        match self {
            IdleTransition::IdleStart { at } => {
                let mut event = RawEvent::new(EventType::IdleStart);
                event.timestamp = at;
                event
            }
            IdleTransition::IdleEnd {
                at,
                idle_minutes_binned,
            } => {
                let mut event = RawEvent::new(EventType::IdleEnd)
                    .with_field("idle_minutes_binned", idle_minutes_binned);
                event.timestamp = at;
                event
            }
        }
    }
}

#[derive(Debug)]
pub struct IdleDetector {
    threshold: chrono::Duration,
    last_activity: DateTime<Utc>,
    state: Activity,
}

impl IdleDetector {
    pub fn new(threshold: Duration, now: DateTime<Utc>) -> Self {
        Self {
            threshold: chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            last_activity: now,
            state: Activity::Active,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, Activity::Idle { .. })
    }

    /// Returns `IdleStart` on the first check past the threshold, and nothing
    /// on later checks until activity resumes. The reported start is rounded
    /// down to a bin boundary.
    pub fn check_idle(&mut self, now: DateTime<Utc>) -> Option<IdleTransition> {
        if self.is_idle() || now - self.last_activity < self.threshold {
            return None;
        }
        let since = self.last_activity + self.threshold;
        let reported = floor_to_bin(since);
        self.state = Activity::Idle { since, reported };
        Some(IdleTransition::IdleStart { at: reported })
    }

    /// Returns `IdleEnd` on the first activity after an idle period. Its
    /// timestamp is the reported start plus the binned duration, so the two
    /// timestamps never reveal the exact break length.
    pub fn record_activity(&mut self, now: DateTime<Utc>) -> Option<IdleTransition> {
        self.last_activity = now;
        match self.state {
            Activity::Active => None,
            Activity::Idle { since, reported } => {
                self.state = Activity::Active;
                let minutes = (now - since).num_minutes().max(0);
                let binned = minutes / IDLE_BIN_MINUTES * IDLE_BIN_MINUTES;
                Some(IdleTransition::IdleEnd {
                    at: reported + chrono::Duration::minutes(binned),
                    idle_minutes_binned: binned,
                })
            }
        }
    }

    /// Start over as Active from `now`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
        self.state = Activity::Active;
    }
}

/// Shared detector.
#[derive(Debug)]
pub struct IdleMonitor {
    detector: Mutex<IdleDetector>,
}

impl IdleMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            detector: Mutex::new(IdleDetector::new(threshold, Utc::now())),
        }
    }

    pub fn record_activity(&self) -> Option<RawEvent> {
        self.detector
            .lock()
            .record_activity(Utc::now())
            .map(IdleTransition::into_event)
    }

    pub fn check_idle(&self) -> Option<RawEvent> {
        self.detector
            .lock()
            .check_idle(Utc::now())
            .map(IdleTransition::into_event)
    }

    pub fn reset(&self) {
        self.detector.lock().reset(Utc::now());
    }

    pub fn is_idle(&self) -> bool {
        self.detector.lock().is_idle()
    }
}

/// Periodically checks the shared monitor and emits `idle_start`.
pub struct IdleSource {
    monitor: Arc<IdleMonitor>,
    foreground: CurrentForeground,
    check_interval: Duration,
    worker: Option<(Sender<()>, JoinHandle<()>)>,
}

impl IdleSource {
    pub fn new(monitor: Arc<IdleMonitor>, foreground: CurrentForeground, check_interval: Duration) -> Self {
        Self {
            monitor,
            foreground,
            check_interval,
            worker: None,
        }
    }
}

impl EventSource for IdleSource {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn start(&mut self, sink: Arc<dyn EventSink>) -> Result<(), CollectorError> {
        if self.worker.is_some() {
            return Err(CollectorError::AlreadyRunning);
        }
        self.monitor.reset();

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let monitor = self.monitor.clone();
        let foreground = self.foreground.clone();
        let interval = self.check_interval;

        let handle = thread::Builder::new()
            .name("kmflow-idle".into())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some(event) = monitor.check_idle() {
                            tracing::debug!("user went idle");
                            sink.emit(foreground.attribute(event));
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        self.worker = Some((shutdown_tx, handle));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some((shutdown, handle)) = self.worker.take() {
            let _ = shutdown.send(());
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for IdleSource {
    fn drop(&mut self) {
        self.stop();
    }
}
