//! Transparency log.
//!
//! Tracks what the agent has emitted and withheld, and keeps a short ring of
//! recently emitted events (already redacted) for the transparency viewer.

use crate::event::CaptureEvent;
use crate::filter::{BlockReason, BINARY_FIELDS};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default number of recent events retained in memory.
pub const DEFAULT_RECENT_CAPACITY: usize = 200;

/// Counters for the current agent run.
#[derive(Debug)]
pub struct TransparencyLog {
    events_emitted: AtomicU64,
    events_blocked: AtomicU64,
    blocked_sensitive_field: AtomicU64,
    redactions_applied: AtomicU64,
    events_dropped: AtomicU64,
    session_start: DateTime<Utc>,
    recent: Mutex<VecDeque<CaptureEvent>>,
    recent_capacity: usize,
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RECENT_CAPACITY)
    }

    pub fn with_capacity(recent_capacity: usize) -> Self {
        Self {
            events_emitted: AtomicU64::new(0),
            events_blocked: AtomicU64::new(0),
            blocked_sensitive_field: AtomicU64::new(0),
            redactions_applied: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            session_start: Utc::now(),
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity)),
            recent_capacity,
            persist_path: None,
        }
    }

    /// Create a log whose counters are loaded from and saved to `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!("could not load previous transparency stats: {e}");
        }

        log
    }

    /// Record an event handed to the transport, after redaction. Image bytes
    /// are never retained; the ring keeps a marker in their place.
    pub fn record_emitted(&self, event: &CaptureEvent, redactions: usize) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        self.redactions_applied
            .fetch_add(redactions as u64, Ordering::Relaxed);

        let mut recent = self.recent.lock();
        if recent.len() == self.recent_capacity {
            recent.pop_front();
        }
        recent.push_back(without_binary(event));
    }

    /// Record an event withheld by the context filter.
    pub fn record_blocked(&self, reason: BlockReason) {
        self.events_blocked.fetch_add(1, Ordering::Relaxed);
        if matches!(
            reason,
            BlockReason::PasswordField | BlockReason::PrivateBrowsing
        ) {
            self.blocked_sensitive_field.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an event discarded because capture was not active.
    pub fn record_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// The most recent `limit` emitted events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<CaptureEvent> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> TransparencyStats {
        TransparencyStats {
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_blocked: self.events_blocked.load(Ordering::Relaxed),
            blocked_sensitive_field: self.blocked_sensitive_field.load(Ordering::Relaxed),
            redactions_applied: self.redactions_applied.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Capture Statistics:\n\
             - Events sent to companion: {}\n\
             - Events blocked by context filter: {} ({} sensitive fields)\n\
             - Redactions applied: {}\n\
             - Events discarded while not capturing: {}\n\
             - Session duration: {} seconds",
            stats.events_emitted,
            stats.events_blocked,
            stats.blocked_sensitive_field,
            stats.redactions_applied,
            stats.events_dropped,
            stats.session_duration_secs
        )
    }

    /// Save counters to disk. Recent events are never persisted.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                events_emitted: stats.events_emitted,
                events_blocked: stats.events_blocked,
                blocked_sensitive_field: stats.blocked_sensitive_field,
                redactions_applied: stats.redactions_applied,
                events_dropped: stats.events_dropped,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.events_emitted
                    .store(persisted.events_emitted, Ordering::Relaxed);
                self.events_blocked
                    .store(persisted.events_blocked, Ordering::Relaxed);
                self.blocked_sensitive_field
                    .store(persisted.blocked_sensitive_field, Ordering::Relaxed);
                self.redactions_applied
                    .store(persisted.redactions_applied, Ordering::Relaxed);
                self.events_dropped
                    .store(persisted.events_dropped, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transparency counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub events_emitted: u64,
    pub events_blocked: u64,
    pub blocked_sensitive_field: u64,
    pub redactions_applied: u64,
    pub events_dropped: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    events_emitted: u64,
    events_blocked: u64,
    blocked_sensitive_field: u64,
    redactions_applied: u64,
    events_dropped: u64,
    last_updated: DateTime<Utc>,
}

fn without_binary(event: &CaptureEvent) -> CaptureEvent {
    let event_data = event
        .event_data
        .iter()
        .map(|(key, value)| {
            if BINARY_FIELDS.contains(&key.as_str()) {
                ("image_omitted".to_string(), Value::Bool(true))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect();
    CaptureEvent {
        event_type: event.event_type,
        timestamp: event.timestamp,
        process_id: event.process_id.clone(),
        window_title: event.window_title.clone(),
        sequence_number: event.sequence_number,
        idempotency_key: event.idempotency_key,
        event_data,
    }
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;
