//! The privacy pipeline between sources and the transport.
//!
//! `RawEvent → ContextFilter → SequenceAssigner → ContentScrubber → queue`
//!
//! Sequence assignment and enqueue share one critical section, so the order
//! of sequence numbers is the order events reach the transport.

use crate::collector::EventSink;
use crate::event::{CaptureEvent, RawEvent, SequenceAssigner};
use crate::filter::{BlockReason, ContentScrubber, ContextFilter, FilterDecision};
use crate::transparency::SharedTransparencyLog;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Open only while the agent is Capturing. Shared with the transport, which
/// discards anything still queued once the gate closes.
#[derive(Debug, Clone, Default)]
pub struct CaptureGate {
    open: Arc<AtomicBool>,
}

impl CaptureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// What happened to one raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Queued { sequence_number: u64 },
    Blocked(BlockReason),
    /// Capture is not active.
    GateClosed,
    /// The transport queue is full or gone.
    QueueFull,
}

struct OrderedStage {
    sequencer: SequenceAssigner,
    queue: mpsc::Sender<CaptureEvent>,
}

pub struct Pipeline {
    filter: ContextFilter,
    scrubber: ContentScrubber,
    gate: CaptureGate,
    ordered: Mutex<OrderedStage>,
    transparency: SharedTransparencyLog,
}

impl Pipeline {
    pub fn new(
        filter: ContextFilter,
        scrubber: ContentScrubber,
        gate: CaptureGate,
        queue: mpsc::Sender<CaptureEvent>,
        transparency: SharedTransparencyLog,
    ) -> Self {
        Self {
            filter,
            scrubber,
            gate,
            ordered: Mutex::new(OrderedStage {
                sequencer: SequenceAssigner::new(),
                queue,
            }),
            transparency,
        }
    }

    /// Start a new sequence session; the next event is number 1.
    pub fn begin_session(&self) -> Uuid {
        let mut stage = self.ordered.lock();
        stage.sequencer.begin_session();
        let session = stage.sequencer.session_id();
        tracing::info!(%session, "capture session started");
        session
    }

    pub fn session_id(&self) -> Uuid {
        self.ordered.lock().sequencer.session_id()
    }

    pub fn gate(&self) -> &CaptureGate {
        &self.gate
    }

    pub fn process(&self, raw: RawEvent) -> EmitOutcome {
        if !self.gate.is_open() {
            self.transparency.record_dropped();
            return EmitOutcome::GateClosed;
        }

        if let FilterDecision::Block(reason) = self.filter.check(&raw) {
            tracing::debug!(event_type = %raw.event_type, ?reason, "event blocked");
            self.transparency.record_blocked(reason);
            return EmitOutcome::Blocked(reason);
        }

        let mut guard = self.ordered.lock();
        let stage = &mut *guard;
        // Reserve first so a full queue never consumes a sequence number.
        let permit = match stage.queue.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                tracing::warn!("transport queue full, dropping event");
                self.transparency.record_dropped();
                return EmitOutcome::QueueFull;
            }
            Err(TrySendError::Closed(())) => {
                self.transparency.record_dropped();
                return EmitOutcome::QueueFull;
            }
        };

        let mut event = stage.sequencer.assign(raw);
        let redactions = self.scrubber.scrub_event(&mut event);
        let sequence_number = event.sequence_number;
        self.transparency.record_emitted(&event, redactions);
        permit.send(event);

        EmitOutcome::Queued { sequence_number }
    }
}

impl EventSink for Pipeline {
    fn emit(&self, event: RawEvent) {
        self.process(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::policy::{CapturePolicy, PolicyHandle};
    use crate::transparency::TransparencyLog;

    fn pipeline(capacity: usize) -> (Pipeline, mpsc::Receiver<CaptureEvent>, SharedTransparencyLog) {
        let (tx, rx) = mpsc::channel(capacity);
        let log = Arc::new(TransparencyLog::new());
        let p = Pipeline::new(
            ContextFilter::new(PolicyHandle::new(CapturePolicy::default())),
            ContentScrubber::new().unwrap(),
            CaptureGate::new(),
            tx,
            log.clone(),
        );
        (p, rx, log)
    }

    fn click(app: &str) -> RawEvent {
        RawEvent::new(EventType::MouseClick).with_process(app)
    }

    #[test]
    fn test_closed_gate_drops() {
        let (p, mut rx, log) = pipeline(8);
        assert_eq!(p.process(click("excel")), EmitOutcome::GateClosed);
        assert!(rx.try_recv().is_err());
        assert_eq!(log.stats().events_dropped, 1);
    }

    #[test]
    fn test_sequence_starts_at_one_per_session() {
        let (p, mut rx, _) = pipeline(8);
        p.gate().open();
        p.begin_session();

        for _ in 0..3 {
            p.process(click("excel"));
        }
        let seqs: Vec<u64> = (0..3).map(|_| rx.try_recv().unwrap().sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        p.begin_session();
        assert_eq!(
            p.process(click("excel")),
            EmitOutcome::Queued { sequence_number: 1 }
        );
    }

    #[test]
    fn test_blocked_event_takes_no_sequence_number() {
        let (p, mut rx, log) = pipeline(8);
        p.gate().open();

        let unknown = RawEvent::new(EventType::AppSwitch);
        assert_eq!(
            p.process(unknown),
            EmitOutcome::Blocked(BlockReason::UnknownProcess)
        );
        p.process(click("excel"));

        assert_eq!(rx.try_recv().unwrap().sequence_number, 1);
        assert_eq!(log.stats().events_blocked, 1);
    }

    #[test]
    fn test_scrubbed_before_enqueue() {
        let (p, mut rx, log) = pipeline(8);
        p.gate().open();
        p.process(
            RawEvent::new(EventType::WindowFocus)
                .with_process("outlook")
                .with_window_title("Mail from a@b.com"),
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.window_title.as_deref(), Some("Mail from [REDACTED]"));
        assert_eq!(log.stats().redactions_applied, 1);
        assert_eq!(log.recent_events(1)[0].window_title, event.window_title);
    }

    #[test]
    fn test_recent_events_never_hold_image_bytes() {
        let (p, mut rx, log) = pipeline(8);
        p.gate().open();
        p.process(
            RawEvent::new(EventType::ScreenCapture)
                .with_process("excel")
                .with_field("mime_type", "image/png")
                .with_field("image_base64", "SECRETPIXELS"),
        );

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.event_data["image_base64"], "SECRETPIXELS");

        let recent = log.recent_events(1);
        assert_eq!(recent[0].event_type, EventType::ScreenCapture);
        assert!(!recent[0].event_data.contains_key("image_base64"));
        assert_eq!(recent[0].event_data["image_omitted"], true);
        assert_eq!(recent[0].event_data["mime_type"], "image/png");
        let shown = serde_json::to_string(&recent[0]).unwrap();
        assert!(!shown.contains("SECRETPIXELS"));
    }

    #[test]
    fn test_full_queue_leaves_no_gap() {
        let (p, mut rx, _) = pipeline(1);
        p.gate().open();

        p.process(click("excel"));
        assert_eq!(p.process(click("excel")), EmitOutcome::QueueFull);
        assert_eq!(rx.try_recv().unwrap().sequence_number, 1);

        assert_eq!(
            p.process(click("excel")),
            EmitOutcome::Queued { sequence_number: 2 }
        );
    }

    #[test]
    fn test_concurrent_emitters_deliver_in_sequence_order() {
        let (tx, mut rx) = mpsc::channel(10_000);
        let p = Arc::new(Pipeline::new(
            ContextFilter::new(PolicyHandle::new(CapturePolicy::default())),
            ContentScrubber::new().unwrap(),
            CaptureGate::new(),
            tx,
            Arc::new(TransparencyLog::new()),
        ));
        p.gate().open();

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        p.emit(click("excel"));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let mut expected = 1;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.sequence_number, expected);
            expected += 1;
        }
        assert_eq!(expected, 1_001);
    }
}
