//! Application and window focus tracking.

use crate::collector::screen::VisualCapture;
use crate::collector::{CollectorError, EventSink, EventSource};
use crate::event::{EventType, RawEvent};
use crate::filter::ContextFilter;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What the OS reports when the foreground window changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForegroundWindow {
    /// macOS bundle identifier, when available.
    pub bundle_id: Option<String>,
    /// Full path of the owning executable.
    pub executable: Option<String>,
    pub window_title: Option<String>,
    /// OS-level secure input (e.g. a password field has focus).
    pub secure_input: bool,
}

impl ForegroundWindow {
    /// Stable, lower-cased process identifier: bundle id when present,
    /// otherwise the executable's file name.
    pub fn process_id(&self) -> Option<String> {
        if let Some(bundle) = self.bundle_id.as_deref().filter(|b| !b.is_empty()) {
            return Some(bundle.to_ascii_lowercase());
        }
        let exe = self.executable.as_deref()?;
        // Windows paths must split on '\' even when the agent runs elsewhere.
        let name = exe.rsplit(['\\', '/']).next().unwrap_or(exe);
        let name = Path::new(name).file_name()?.to_str()?;
        if name.is_empty() {
            None
        } else {
            Some(name.to_ascii_lowercase())
        }
    }
}

/// Callback invoked by a [`FocusProvider`] on every foreground change.
pub type FocusCallback = Box<dyn Fn(ForegroundWindow) + Send + Sync>;

/// OS capability: foreground-window change notifications.
pub trait FocusProvider: Send + Sync {
    /// Begin delivering notifications to `on_change`.
    fn subscribe(&self, on_change: FocusCallback) -> Result<(), CollectorError>;

    /// Stop delivering notifications. No callback may run after this returns.
    fn unsubscribe(&self);
}

/// Query for the current foreground window.
pub type ForegroundQuery = Arc<dyn Fn() -> Option<ForegroundWindow> + Send + Sync>;

/// Focus provider that polls a [`ForegroundQuery`] and reports changes.
pub struct PollingFocusProvider {
    query: ForegroundQuery,
    interval: Duration,
    worker: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl PollingFocusProvider {
    pub fn new(query: ForegroundQuery, interval: Duration) -> Self {
        Self {
            query,
            interval,
            worker: Mutex::new(None),
        }
    }
}

impl FocusProvider for PollingFocusProvider {
    fn subscribe(&self, on_change: FocusCallback) -> Result<(), CollectorError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(CollectorError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let query = self.query.clone();
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("kmflow-focus".into())
            .spawn(move || {
                let mut last: Option<ForegroundWindow> = None;
                loop {
                    if let Some(window) = query() {
                        if last.as_ref() != Some(&window) {
                            last = Some(window.clone());
                            on_change(window);
                        }
                    }
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        *worker = Some((shutdown_tx, handle));
        Ok(())
    }

    fn unsubscribe(&self) {
        let worker = self.worker.lock().take();
        if let Some((shutdown, handle)) = worker {
            let _ = shutdown.send(());
            let _ = handle.join();
        }
    }
}

/// Process and title currently in the foreground, shared with sources that
/// attribute their events to the focused app.
#[derive(Debug, Clone, Default)]
pub struct CurrentForeground {
    inner: Arc<RwLock<Option<ForegroundSnapshot>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundSnapshot {
    pub process_id: Option<String>,
    pub window_title: Option<String>,
    pub secure_input: bool,
}

impl CurrentForeground {
    pub fn set(&self, snapshot: ForegroundSnapshot) {
        *self.inner.write() = Some(snapshot);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    pub fn get(&self) -> Option<ForegroundSnapshot> {
        self.inner.read().clone()
    }

    /// Attribute an event to the current foreground app.
    pub fn attribute(&self, mut event: RawEvent) -> RawEvent {
        if let Some(fg) = self.get() {
            event.process_id = fg.process_id;
            event.window_title = fg.window_title;
            event.password_field_focused = fg.secure_input;
        }
        event
    }
}

struct Focused {
    process_id: Option<String>,
    window_title: Option<String>,
    since: DateTime<Utc>,
    blocked: bool,
}

/// Pure focus-change logic: dwell time and event construction.
pub struct FocusTracker {
    filter: ContextFilter,
    current: Option<Focused>,
}

impl FocusTracker {
    pub fn new(filter: ContextFilter) -> Self {
        Self {
            filter,
            current: None,
        }
    }

    /// Forget the previous foreground app, e.g. after a pause.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Handle a foreground change observed at `now`.
    ///
    /// Dwell is measured from the previous switch. Time spent in a blocked
    /// app is never reported or carried over: leaving it starts a fresh
    /// interval with no `from_app` or dwell attached.
    pub fn on_foreground_change(
        &mut self,
        window: &ForegroundWindow,
        now: DateTime<Utc>,
    ) -> Vec<RawEvent> {
        let process_id = window.process_id();
        let blocked = self
            .filter
            .check_process(process_id.as_deref())
            .is_blocked();

        let previous = self.current.take();
        let same_app = previous
            .as_ref()
            .is_some_and(|p| p.process_id == process_id);
        let same_window = same_app
            && previous
                .as_ref()
                .is_some_and(|p| p.window_title == window.window_title);

        let mut events = Vec::new();

        if !same_app {
            let mut switch = RawEvent::new(EventType::AppSwitch);
            switch.timestamp = now;
            switch.process_id = process_id.clone();
            switch.window_title = window.window_title.clone();

            if let Some(prev) = previous.as_ref().filter(|p| !p.blocked) {
                let dwell_ms = (now - prev.since).num_milliseconds().max(0);
                switch = switch.with_field("dwell_ms", dwell_ms);
                if let Some(ref from) = prev.process_id {
                    switch = switch.with_field("from_app", from.clone());
                }
            }
            events.push(switch);
        }

        if !same_window {
            let mut focus = RawEvent::new(EventType::WindowFocus);
            focus.timestamp = now;
            focus.process_id = process_id.clone();
            focus.window_title = window.window_title.clone();
            events.push(focus);
        }

        let since = match previous {
            Some(prev) if same_app => prev.since,
            _ => now,
        };
        self.current = Some(Focused {
            process_id,
            window_title: window.window_title.clone(),
            since,
            blocked,
        });

        events
    }
}

/// Focus source: wires a [`FocusProvider`] to the tracker and sink.
pub struct FocusSource {
    provider: Arc<dyn FocusProvider>,
    tracker: Arc<Mutex<FocusTracker>>,
    foreground: CurrentForeground,
    visual: Option<Arc<VisualCapture>>,
    running: Arc<AtomicBool>,
}

impl FocusSource {
    pub fn new(
        provider: Arc<dyn FocusProvider>,
        filter: ContextFilter,
        foreground: CurrentForeground,
    ) -> Self {
        Self {
            provider,
            tracker: Arc::new(Mutex::new(FocusTracker::new(filter))),
            foreground,
            visual: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trigger visual-context capture on app switches.
    pub fn with_visual_capture(mut self, visual: Arc<VisualCapture>) -> Self {
        self.visual = Some(visual);
        self
    }
}

impl EventSource for FocusSource {
    fn name(&self) -> &'static str {
        "focus"
    }

    fn start(&mut self, sink: Arc<dyn EventSink>) -> Result<(), CollectorError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }

        self.tracker.lock().reset();
        if let Some(ref visual) = self.visual {
            visual.activate(sink.clone());
        }

        let tracker = self.tracker.clone();
        let foreground = self.foreground.clone();
        let visual = self.visual.clone();
        let running = self.running.clone();

        self.running.store(true, Ordering::SeqCst);
        let subscribed = self.provider.subscribe(Box::new(move |window| {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            foreground.set(ForegroundSnapshot {
                process_id: window.process_id(),
                window_title: window.window_title.clone(),
                secure_input: window.secure_input,
            });

            let events = tracker.lock().on_foreground_change(&window, Utc::now());
            let switched = events.iter().any(|e| e.event_type == EventType::AppSwitch);
            for event in events {
                sink.emit(event);
            }

            if switched {
                if let Some(ref visual) = visual {
                    visual.trigger(window.process_id().as_deref());
                }
            }
        }));

        if let Err(e) = subscribed {
            self.running.store(false, Ordering::SeqCst);
            if let Some(ref visual) = self.visual {
                visual.deactivate();
            }
            return Err(e);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.provider.unsubscribe();
        if let Some(ref visual) = self.visual {
            visual.deactivate();
        }
        self.foreground.clear();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Focus provider driven by hand from tests.
    #[derive(Default)]
    pub struct ManualFocusProvider {
        callback: Mutex<Option<FocusCallback>>,
    }

    impl ManualFocusProvider {
        pub fn switch_to(&self, window: ForegroundWindow) {
            if let Some(ref cb) = *self.callback.lock() {
                cb(window);
            }
        }

        pub fn is_subscribed(&self) -> bool {
            self.callback.lock().is_some()
        }
    }

    impl FocusProvider for ManualFocusProvider {
        fn subscribe(&self, on_change: FocusCallback) -> Result<(), CollectorError> {
            *self.callback.lock() = Some(on_change);
            Ok(())
        }

        fn unsubscribe(&self) {
            *self.callback.lock() = None;
        }
    }

    pub fn app(bundle: &str, title: &str) -> ForegroundWindow {
        ForegroundWindow {
            bundle_id: Some(bundle.to_string()),
            executable: None,
            window_title: Some(title.to_string()),
            secure_input: false,
        }
    }
}
