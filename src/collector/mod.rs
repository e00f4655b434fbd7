//! Event sources.
//!
//! Each source turns one kind of OS notification into [`RawEvent`]s and hands
//! them to an [`EventSink`]. OS access sits behind one capability trait per
//! source ([`FocusProvider`], [`InputHook`], [`ScreenGrabber`]) so the rest of
//! the agent never touches platform APIs directly.

pub mod focus;
pub mod idle;
pub mod input;
pub mod screen;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub mod noop;

use crate::event::RawEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

pub use focus::{
    CurrentForeground, FocusProvider, FocusSource, FocusTracker, ForegroundQuery,
    ForegroundSnapshot, ForegroundWindow, PollingFocusProvider,
};
pub use idle::{IdleDetector, IdleMonitor, IdleSource, IdleTransition};
pub use input::{InputAggregator, InputCounts, InputHook, InputSignal, InputSource};
pub use screen::{CaptureLimiter, LimitReason, ScreenGrabber, VisualCapture};

#[cfg(target_os = "macos")]
pub use macos::{check_permission, platform_focus_provider, MacOSInputHook as PlatformInputHook};

#[cfg(target_os = "windows")]
pub use windows::{
    check_permission, platform_focus_provider, WindowsInputHook as PlatformInputHook,
};

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub use noop::{check_permission, platform_focus_provider, NoopInputHook as PlatformInputHook};

/// Errors that can occur while starting or running a source.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("source is already running")]
    AlreadyRunning,
    #[error("OS permission for {0} not granted")]
    PermissionDenied(&'static str),
    #[error("failed to install OS hook: {0}")]
    HookInstallationFailed(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("failed to spawn worker thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Receives raw events from sources. Called from OS callback threads, so
/// implementations must not block on I/O.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RawEvent);
}

/// A monitor that can be switched on and off by the capture state machine.
pub trait EventSource: Send {
    fn name(&self) -> &'static str;

    /// Begin producing events. Returns only once the source is active.
    fn start(&mut self, sink: Arc<dyn EventSink>) -> Result<(), CollectorError>;

    /// Stop producing events. Returns only once no further events can be emitted.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// All registered sources, started and stopped as a unit.
#[derive(Default)]
pub struct SourceSet {
    sources: Mutex<Vec<Box<dyn EventSource>>>,
}

impl SourceSet {
    pub fn new(sources: Vec<Box<dyn EventSource>>) -> Self {
        Self {
            sources: Mutex::new(sources),
        }
    }

    /// Start every source. If any fails, the ones already started are
    /// stopped again and the error is returned.
    pub fn start_all(&self, sink: Arc<dyn EventSink>) -> Result<(), CollectorError> {
        let mut sources = self.sources.lock();
        for idx in 0..sources.len() {
            if sources[idx].is_running() {
                continue;
            }
            if let Err(e) = sources[idx].start(sink.clone()) {
                tracing::error!(source = sources[idx].name(), "failed to start source: {e}");
                for started in sources[..idx].iter_mut() {
                    started.stop();
                }
                return Err(e);
            }
            tracing::debug!(source = sources[idx].name(), "source started");
        }
        Ok(())
    }

    /// Stop every source; returns once all are stopped.
    pub fn stop_all(&self) {
        let mut sources = self.sources.lock();
        for source in sources.iter_mut() {
            if source.is_running() {
                source.stop();
                tracing::debug!(source = source.name(), "source stopped");
            }
        }
    }

    pub fn all_running(&self) -> bool {
        let sources = self.sources.lock();
        sources.iter().all(|s| s.is_running())
    }

    pub fn any_running(&self) -> bool {
        let sources = self.sources.lock();
        sources.iter().any(|s| s.is_running())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sources.lock().iter().map(|s| s.name()).collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test doubles shared by collector and agent tests.

    use super::*;

    /// Sink that records everything it receives.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<RawEvent>>,
    }

    impl RecordingSink {
        pub fn take(&self) -> Vec<RawEvent> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: RawEvent) {
            self.events.lock().push(event);
        }
    }

    /// Source with a switchable start failure.
    pub struct FlagSource {
        pub name: &'static str,
        pub running: Arc<std::sync::atomic::AtomicBool>,
        pub fail: bool,
    }

    impl EventSource for FlagSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn start(&mut self, _sink: Arc<dyn EventSink>) -> Result<(), CollectorError> {
            if self.fail {
                return Err(CollectorError::PermissionDenied("test"));
            }
            self.running
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {
            self.running
                .store(false, std::sync::atomic::Ordering::SeqCst);
        }

        fn is_running(&self) -> bool {
            self.running.load(std::sync::atomic::Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn flag(name: &'static str, fail: bool) -> (Box<dyn EventSource>, Arc<AtomicBool>) {
        let running = Arc::new(AtomicBool::new(false));
        (
            Box::new(FlagSource {
                name,
                running: running.clone(),
                fail,
            }),
            running,
        )
    }

    #[test]
    fn test_start_and_stop_all() {
        let (a, a_running) = flag("a", false);
        let (b, b_running) = flag("b", false);
        let set = SourceSet::new(vec![a, b]);
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());

        set.start_all(sink).unwrap();
        assert!(set.all_running());

        set.stop_all();
        assert!(!a_running.load(Ordering::SeqCst));
        assert!(!b_running.load(Ordering::SeqCst));
        assert!(!set.any_running());
    }

    #[test]
    fn test_failed_start_rolls_back() {
        let (a, a_running) = flag("a", false);
        let (b, _) = flag("b", true);
        let set = SourceSet::new(vec![a, b]);
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());

        assert!(set.start_all(sink).is_err());
        assert!(!a_running.load(Ordering::SeqCst));
        assert_eq!(set.names(), vec!["a", "b"]);
    }
}
