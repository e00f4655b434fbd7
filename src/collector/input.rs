//! Keyboard and mouse activity aggregation.
//!
//! Privacy guarantee: only counts and the start of a typing session are
//! kept. Which key was pressed never leaves the OS hook.

use crate::collector::focus::CurrentForeground;
use crate::collector::idle::IdleMonitor;
use crate::collector::{CollectorError, EventSink, EventSource};
use crate::event::{EventType, RawEvent};
use chrono::{DateTime, Utc};
use crossbeam_channel::{after, bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Class of a single input action. Carries no key identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSignal {
    Character,
    Backspace,
    SpecialKey,
    Click,
    Drag,
    Scroll,
}

/// Aggregated counts since the last flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputCounts {
    pub chars: u64,
    pub backspaces: u64,
    pub special_keys: u64,
    pub clicks: u64,
    pub drags: u64,
    pub scrolls: u64,
    pub typing_session_start: Option<DateTime<Utc>>,
}

impl InputCounts {
    pub fn is_empty(&self) -> bool {
        self.key_total() == 0 && self.clicks == 0 && self.drags == 0 && self.scrolls == 0
    }

    pub fn key_total(&self) -> u64 {
        self.chars + self.backspaces + self.special_keys
    }

    /// Events describing these counts, one per non-empty activity class.
    pub fn to_events(&self, now: DateTime<Utc>) -> Vec<RawEvent> {
        let mut events = Vec::new();
        let mut push = |event: RawEvent| {
            let mut event = event;
            event.timestamp = now;
            events.push(event);
        };

        if self.key_total() > 0 {
            let mut keyboard = RawEvent::new(EventType::KeyboardAction)
                .with_field("chars", self.chars)
                .with_field("backspaces", self.backspaces)
                .with_field("special_keys", self.special_keys);
            if let Some(start) = self.typing_session_start {
                keyboard = keyboard.with_field("typing_session_start", start.to_rfc3339());
            }
            push(keyboard);
        }
        if self.clicks > 0 {
            push(RawEvent::new(EventType::MouseClick).with_field("count", self.clicks));
        }
        if self.drags > 0 {
            push(RawEvent::new(EventType::MouseDrag).with_field("count", self.drags));
        }
        if self.scrolls > 0 {
            push(RawEvent::new(EventType::MouseScroll).with_field("count", self.scrolls));
        }
        events
    }
}

/// Thread-safe counter set.
#[derive(Debug, Default)]
pub struct InputAggregator {
    counts: Mutex<InputCounts>,
}

impl InputAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, signal: InputSignal) {
        self.record_at(signal, Utc::now());
    }

    pub fn record_at(&self, signal: InputSignal, now: DateTime<Utc>) {
        let mut counts = self.counts.lock();
        match signal {
            InputSignal::Character => {
                counts.chars += 1;
                counts.typing_session_start.get_or_insert(now);
            }
            InputSignal::Backspace => counts.backspaces += 1,
            InputSignal::SpecialKey => counts.special_keys += 1,
            InputSignal::Click => counts.clicks += 1,
            InputSignal::Drag => counts.drags += 1,
            InputSignal::Scroll => counts.scrolls += 1,
        }
    }

    /// Snapshot the counts and reset them in one step.
    pub fn flush(&self) -> InputCounts {
        std::mem::take(&mut *self.counts.lock())
    }
}

/// OS capability: low-level input hook delivering classified signals.
pub trait InputHook: Send {
    fn start(&mut self, signals: Sender<InputSignal>) -> Result<(), CollectorError>;
    fn stop(&mut self);
}

/// Input source: hook → aggregator → periodic flush into the sink.
pub struct InputSource {
    hook: Box<dyn InputHook>,
    aggregator: Arc<InputAggregator>,
    foreground: CurrentForeground,
    idle: Option<Arc<IdleMonitor>>,
    flush_interval: Duration,
    running: Arc<AtomicBool>,
    worker: Option<(Sender<()>, JoinHandle<()>)>,
}

impl InputSource {
    pub fn new(
        hook: Box<dyn InputHook>,
        foreground: CurrentForeground,
        flush_interval: Duration,
    ) -> Self {
        Self {
            hook,
            aggregator: Arc::new(InputAggregator::new()),
            foreground,
            idle: None,
            flush_interval,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Report every input signal as user activity to the idle monitor.
    pub fn with_idle_monitor(mut self, idle: Arc<IdleMonitor>) -> Self {
        self.idle = Some(idle);
        self
    }

    pub fn aggregator(&self) -> Arc<InputAggregator> {
        self.aggregator.clone()
    }
}

impl EventSource for InputSource {
    fn name(&self) -> &'static str {
        "input"
    }

    fn start(&mut self, sink: Arc<dyn EventSink>) -> Result<(), CollectorError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }

        // Bounded to keep a stalled worker from growing memory; the hook drops
        // signals when full rather than blocking the OS thread.
        let (signal_tx, signal_rx) = bounded(10_000);
        let (shutdown_tx, shutdown_rx) = bounded(1);

        self.aggregator.flush();
        self.hook.start(signal_tx)?;

        let worker = InputWorker {
            signals: signal_rx,
            shutdown: shutdown_rx,
            aggregator: self.aggregator.clone(),
            foreground: self.foreground.clone(),
            idle: self.idle.clone(),
            sink,
            flush_interval: self.flush_interval,
        };
        let handle = match thread::Builder::new()
            .name("kmflow-input".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.hook.stop();
                return Err(e.into());
            }
        };

        self.worker = Some((shutdown_tx, handle));
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.hook.stop();
        if let Some((shutdown, handle)) = self.worker.take() {
            let _ = shutdown.send(());
            let _ = handle.join();
        }
        // Partial counts from the stopped period are discarded.
        self.aggregator.flush();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for InputSource {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

struct InputWorker {
    signals: Receiver<InputSignal>,
    shutdown: Receiver<()>,
    aggregator: Arc<InputAggregator>,
    foreground: CurrentForeground,
    idle: Option<Arc<IdleMonitor>>,
    sink: Arc<dyn EventSink>,
    flush_interval: Duration,
}

impl InputWorker {
    fn run(self) {
        let mut next_flush = Instant::now() + self.flush_interval;
        let mut hook_open = true;
        let closed: Receiver<InputSignal> = crossbeam_channel::never();

        loop {
            let timeout = next_flush.saturating_duration_since(Instant::now());
            // A dropped hook sender leaves only shutdown and the flush timer.
            let signals = if hook_open { &self.signals } else { &closed };

            crossbeam_channel::select! {
                recv(self.shutdown) -> _ => return,
                recv(signals) -> msg => match msg {
                    Ok(signal) => self.record(signal),
                    Err(_) => hook_open = false,
                },
                recv(after(timeout)) -> _ => {}
            }

            if Instant::now() >= next_flush {
                let counts = self.aggregator.flush();
                for event in counts.to_events(Utc::now()) {
                    self.sink.emit(self.foreground.attribute(event));
                }
                next_flush = Instant::now() + self.flush_interval;
            }
        }
    }

    fn record(&self, signal: InputSignal) {
        self.aggregator.record(signal);
        if let Some(ref idle) = self.idle {
            if let Some(event) = idle.record_activity() {
                self.sink.emit(self.foreground.attribute(event));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Input hook that exposes its sender so tests can inject signals.
    #[derive(Default, Clone)]
    pub struct ManualInputHook {
        pub sender: Arc<Mutex<Option<Sender<InputSignal>>>>,
    }

    impl ManualInputHook {
        pub fn send(&self, signal: InputSignal) {
            if let Some(ref tx) = *self.sender.lock() {
                let _ = tx.try_send(signal);
            }
        }
    }

    impl InputHook for ManualInputHook {
        fn start(&mut self, signals: Sender<InputSignal>) -> Result<(), CollectorError> {
            *self.sender.lock() = Some(signals);
            Ok(())
        }

        fn stop(&mut self) {
            *self.sender.lock() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ManualInputHook;
    use super::*;
    use crate::collector::focus::ForegroundSnapshot;
    use crate::collector::testing::RecordingSink;

    #[test]
    fn test_flush_snapshots_and_resets() {
        let agg = InputAggregator::new();
        agg.record(InputSignal::Character);
        agg.record(InputSignal::Character);
        agg.record(InputSignal::Backspace);
        agg.record(InputSignal::Click);

        let counts = agg.flush();
        assert_eq!(counts.chars, 2);
        assert_eq!(counts.backspaces, 1);
        assert_eq!(counts.clicks, 1);
        assert!(counts.typing_session_start.is_some());

        assert!(agg.flush().is_empty());
    }

    #[test]
    fn test_flush_under_concurrent_recording_loses_nothing() {
        let agg = Arc::new(InputAggregator::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let agg = agg.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        agg.record(InputSignal::Character);
                    }
                })
            })
            .collect();

        let mut total = 0;
        for _ in 0..50 {
            total += agg.flush().chars;
        }
        for w in writers {
            w.join().unwrap();
        }
        total += agg.flush().chars;

        assert_eq!(total, 4_000);
    }

    #[test]
    fn test_counts_to_events() {
        let counts = InputCounts {
            chars: 3,
            scrolls: 2,
            ..Default::default()
        };
        let events = counts.to_events(Utc::now());
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![EventType::KeyboardAction, EventType::MouseScroll]);
        assert_eq!(events[0].payload["chars"], 3);
    }

    #[test]
    fn test_source_flushes_attributed_events() {
        let hook = ManualInputHook::default();
        let foreground = CurrentForeground::default();
        foreground.set(ForegroundSnapshot {
            process_id: Some("excel".into()),
            window_title: Some("Book1".into()),
            secure_input: false,
        });

        let mut source = InputSource::new(
            Box::new(hook.clone()),
            foreground,
            Duration::from_millis(50),
        );
        let sink = Arc::new(RecordingSink::default());
        source.start(sink.clone()).unwrap();

        hook.send(InputSignal::Click);
        hook.send(InputSignal::Click);
        thread::sleep(Duration::from_millis(200));
        source.stop();

        let events = sink.take();
        let clicks: u64 = events
            .iter()
            .filter(|e| e.event_type == EventType::MouseClick)
            .map(|e| e.payload["count"].as_u64().unwrap())
            .sum();
        assert_eq!(clicks, 2);
        assert!(events
            .iter()
            .all(|e| e.process_id.as_deref() == Some("excel")));
        assert!(!source.is_running());
    }

    /// Hook that keeps its sender alive until it is dropped.
    struct StickyHook {
        _sender: Option<Sender<InputSignal>>,
    }

    impl InputHook for StickyHook {
        fn start(&mut self, signals: Sender<InputSignal>) -> Result<(), CollectorError> {
            self._sender = Some(signals);
            Ok(())
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn test_stop_does_not_wait_for_flush_interval() {
        let mut source = InputSource::new(
            Box::new(StickyHook { _sender: None }),
            CurrentForeground::default(),
            Duration::from_secs(3),
        );
        source.start(Arc::new(RecordingSink::default())).unwrap();
        thread::sleep(Duration::from_millis(50));

        let began = Instant::now();
        source.stop();
        assert!(
            began.elapsed() < Duration::from_millis(500),
            "stop took {:?}",
            began.elapsed()
        );
        assert!(!source.is_running());
    }
}
