//! Visual-context capture.
//!
//! A capture produces one in-memory image that is base64-encoded straight
//! into a single `screen_capture` event. Image bytes are never written to
//! disk and never logged.

use crate::collector::{CollectorError, EventSink};
use crate::event::{EventType, RawEvent};
use crate::policy::{PolicyHandle, VisualCaptureLimits};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// OS capability: grab the current screen as encoded image bytes.
pub trait ScreenGrabber: Send + Sync {
    fn grab(&self) -> Result<Vec<u8>, CollectorError>;

    /// MIME type of the bytes returned by [`ScreenGrabber::grab`].
    fn mime_type(&self) -> &'static str {
        "image/png"
    }
}

/// Why a capture was not taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReason {
    Disabled,
    Inactive,
    HourlyCap,
    DailyCap,
    AppCooldown,
    GlobalCooldown,
}

impl fmt::Display for LimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LimitReason::Disabled => "visual capture disabled by policy",
            LimitReason::Inactive => "capture not active",
            LimitReason::HourlyCap => "hourly cap reached",
            LimitReason::DailyCap => "daily cap reached",
            LimitReason::AppCooldown => "per-app cooldown",
            LimitReason::GlobalCooldown => "global cooldown",
        };
        f.write_str(s)
    }
}

/// Rate limiting state for visual captures.
#[derive(Debug, Default)]
pub struct CaptureLimiter {
    taken: VecDeque<DateTime<Utc>>,
    last_per_app: HashMap<String, DateTime<Utc>>,
}

impl CaptureLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every limit for a capture of `app` at `now`.
    pub fn check(
        &mut self,
        app: &str,
        now: DateTime<Utc>,
        limits: &VisualCaptureLimits,
    ) -> Result<(), LimitReason> {
        let day_ago = now - Duration::days(1);
        while self.taken.front().is_some_and(|t| *t <= day_ago) {
            self.taken.pop_front();
        }
        self.last_per_app.retain(|_, t| *t > day_ago);

        if let Some(last) = self.taken.back() {
            if now - *last < Duration::seconds(limits.global_cooldown_secs as i64) {
                return Err(LimitReason::GlobalCooldown);
            }
        }
        if let Some(last) = self.last_per_app.get(app) {
            if now - *last < Duration::seconds(limits.per_app_cooldown_secs as i64) {
                return Err(LimitReason::AppCooldown);
            }
        }

        let hour_ago = now - Duration::hours(1);
        let last_hour = self.taken.iter().filter(|t| **t > hour_ago).count();
        if last_hour >= limits.hourly_cap as usize {
            return Err(LimitReason::HourlyCap);
        }
        if self.taken.len() >= limits.daily_cap as usize {
            return Err(LimitReason::DailyCap);
        }
        Ok(())
    }

    pub fn record(&mut self, app: &str, now: DateTime<Utc>) {
        self.taken.push_back(now);
        self.last_per_app.insert(app.to_string(), now);
    }

    pub fn taken_in_last_day(&self) -> usize {
        self.taken.len()
    }
}

/// Policy- and rate-gated visual capture, owned by the focus source.
pub struct VisualCapture {
    grabber: Arc<dyn ScreenGrabber>,
    policy: PolicyHandle,
    limiter: Mutex<CaptureLimiter>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
}

impl VisualCapture {
    pub fn new(grabber: Arc<dyn ScreenGrabber>, policy: PolicyHandle) -> Self {
        Self {
            grabber,
            policy,
            limiter: Mutex::new(CaptureLimiter::new()),
            sink: Mutex::new(None),
        }
    }

    pub fn activate(&self, sink: Arc<dyn EventSink>) {
        *self.sink.lock() = Some(sink);
    }

    pub fn deactivate(&self) {
        *self.sink.lock() = None;
    }

    /// Attempt one capture for `process_id`. Returns whether an event was
    /// emitted; a limit or grab failure is "not triggered", never an error.
    pub fn trigger(&self, process_id: Option<&str>) -> bool {
        match self.try_capture(process_id, Utc::now()) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!("visual capture skipped: {reason}");
                false
            }
        }
    }

    fn try_capture(&self, process_id: Option<&str>, now: DateTime<Utc>) -> Result<(), LimitReason> {
        let sink = self.sink.lock().clone().ok_or(LimitReason::Inactive)?;
        // Unattributed captures would be dropped by the context filter anyway.
        let app = process_id.ok_or(LimitReason::Inactive)?;

        let policy = self.policy.current();
        if !policy.visual_capture_enabled {
            return Err(LimitReason::Disabled);
        }

        let mut limiter = self.limiter.lock();
        limiter.check(app, now, &policy.visual_capture_limits)?;

        let bytes = match self.grabber.grab() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("screen grab failed: {e}");
                return Err(LimitReason::Inactive);
            }
        };
        limiter.record(app, now);
        drop(limiter);

        let mut event = RawEvent::new(EventType::ScreenCapture)
            .with_process(app)
            .with_field("mime_type", self.grabber.mime_type())
            .with_field("image_base64", STANDARD.encode(&bytes));
        event.timestamp = now;
        sink.emit(event);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Grabber returning a fixed byte string.
    pub struct StaticGrabber(pub Vec<u8>);

    impl ScreenGrabber for StaticGrabber {
        fn grab(&self) -> Result<Vec<u8>, CollectorError> {
            Ok(self.0.clone())
        }
    }
}
