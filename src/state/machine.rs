//! Consent-gated capture state machine.

use crate::consent::ConsentGate;
use crate::fsutil::atomic_write;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Agent capture state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    ConsentRequired,
    Capturing,
    Paused,
    Error(String),
    EngagementExpired,
}

impl CaptureState {
    pub fn is_capturing(&self) -> bool {
        matches!(self, CaptureState::Capturing)
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureState::Idle => write!(f, "idle"),
            CaptureState::ConsentRequired => write!(f, "consent_required"),
            CaptureState::Capturing => write!(f, "capturing"),
            CaptureState::Paused => write!(f, "paused"),
            CaptureState::Error(msg) => write!(f, "error: {msg}"),
            CaptureState::EngagementExpired => write!(f, "engagement_expired"),
        }
    }
}

/// Called synchronously with `(old, new)` on every transition. An `Err`
/// while entering Capturing aborts the entry and moves the machine to
/// `Error`.
pub type Subscriber = Box<dyn Fn(&CaptureState, &CaptureState) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to access state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file is malformed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    state: CaptureState,
    updated_at: DateTime<Utc>,
}

pub struct StateMachine {
    state: RwLock<CaptureState>,
    // Held for the whole transition, subscriber calls included, so
    // transitions never interleave.
    subscribers: Mutex<Vec<Subscriber>>,
    consent: Arc<dyn ConsentGate>,
    persist_path: Option<PathBuf>,
}

impl StateMachine {
    pub fn new(consent: Arc<dyn ConsentGate>) -> Self {
        Self {
            state: RwLock::new(CaptureState::Idle),
            subscribers: Mutex::new(Vec::new()),
            consent,
            persist_path: None,
        }
    }

    /// Persist every transition to `path`.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persist_path = Some(path);
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state.read().clone()
    }

    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.lock().push(subscriber);
    }

    /// Enter Capturing from Idle, Paused or ConsentRequired. Does nothing
    /// unless consent is currently granted.
    ///
    /// Like every operation here, returns whether the transition took place.
    pub fn start_capture(&self) -> bool {
        let consent = self.consent.clone();
        self.transition(CaptureState::Capturing, |old| {
            matches!(
                old,
                CaptureState::Idle | CaptureState::Paused | CaptureState::ConsentRequired
            ) && consent.is_consented()
        })
    }

    pub fn pause_capture(&self) -> bool {
        self.transition(CaptureState::Paused, |old| old.is_capturing())
    }

    pub fn resume_capture(&self) -> bool {
        let consent = self.consent.clone();
        self.transition(CaptureState::Capturing, |old| {
            *old == CaptureState::Paused && consent.is_consented()
        })
    }

    pub fn stop_capture(&self) -> bool {
        self.transition(CaptureState::Idle, |_| true)
    }

    pub fn require_consent(&self) -> bool {
        self.transition(CaptureState::ConsentRequired, |_| true)
    }

    pub fn expire_engagement(&self) -> bool {
        self.transition(CaptureState::EngagementExpired, |_| true)
    }

    pub fn set_error(&self, message: impl Into<String>) -> bool {
        self.transition(CaptureState::Error(message.into()), |_| true)
    }

    /// Restore the persisted state.
    ///
    /// Capturing is re-entered through the consent-gated path so sources are
    /// started again. Any capture-related state without valid consent
    /// becomes ConsentRequired.
    pub fn restore(&self) -> CaptureState {
        let persisted = match self.persist_path.as_deref().map(load_state) {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                tracing::warn!("could not restore capture state: {e}");
                None
            }
            None => None,
        };
        let persisted = persisted.unwrap_or(CaptureState::Idle);
        tracing::info!(state = %persisted, "restoring capture state");

        let consented = self.consent.is_consented();
        match persisted {
            CaptureState::Error(msg) => {
                self.set_error(msg);
            }
            CaptureState::EngagementExpired => {
                self.expire_engagement();
            }
            _ if !consented => {
                self.require_consent();
            }
            CaptureState::Capturing => {
                self.start_capture();
            }
            CaptureState::Paused => {
                self.transition(CaptureState::Paused, |old| *old == CaptureState::Idle);
            }
            CaptureState::Idle | CaptureState::ConsentRequired => {
                self.stop_capture();
            }
        }
        self.state()
    }

    fn transition(&self, next: CaptureState, guard: impl FnOnce(&CaptureState) -> bool) -> bool {
        let subscribers = self.subscribers.lock();

        let old = self.state();
        if old == next {
            return false;
        }
        if !guard(&old) {
            tracing::debug!(from = %old, to = %next, "transition not allowed");
            return false;
        }

        *self.state.write() = next.clone();
        tracing::info!(from = %old, to = %next, "capture state changed");

        let mut failure = None;
        for subscriber in subscribers.iter() {
            if let Err(e) = subscriber(&old, &next) {
                failure.get_or_insert(e);
            }
        }

        let settled = match failure {
            Some(message) if next.is_capturing() => {
                tracing::error!("failed to enter capturing: {message}");
                let error = CaptureState::Error(message);
                *self.state.write() = error.clone();
                for subscriber in subscribers.iter() {
                    let _ = subscriber(&next, &error);
                }
                error
            }
            Some(message) => {
                tracing::warn!(to = %next, "subscriber failed: {message}");
                next.clone()
            }
            None => next.clone(),
        };

        self.persist(&settled);
        settled == next
    }

    fn persist(&self, state: &CaptureState) {
        let Some(ref path) = self.persist_path else {
            return;
        };
        let record = PersistedState {
            state: state.clone(),
            updated_at: Utc::now(),
        };
        let result = serde_json::to_vec_pretty(&record)
            .map_err(StateError::from)
            .and_then(|json| atomic_write(path, &json).map_err(StateError::from));
        if let Err(e) = result {
            tracing::warn!("failed to persist capture state: {e}");
        }
    }
}

/// Read a persisted state file; `None` when there is none yet.
pub fn load_state(path: &Path) -> Result<Option<CaptureState>, StateError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let record: PersistedState = serde_json::from_str(&content)?;
    Ok(Some(record.state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlagConsent(AtomicBool);

    impl ConsentGate for FlagConsent {
        fn is_consented(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn machine(consented: bool) -> (StateMachine, Arc<FlagConsent>) {
        let consent = Arc::new(FlagConsent(AtomicBool::new(consented)));
        (StateMachine::new(consent.clone()), consent)
    }

    fn counting(sm: &StateMachine) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sm.subscribe(Box::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        count
    }

    #[test]
    fn test_no_capture_without_consent() {
        let (sm, consent) = machine(false);
        let notified = counting(&sm);

        assert!(!sm.start_capture());
        assert_eq!(sm.state(), CaptureState::Idle);
        assert_eq!(notified.load(Ordering::SeqCst), 0);

        consent.0.store(true, Ordering::SeqCst);
        assert!(sm.start_capture());
        assert_eq!(sm.state(), CaptureState::Capturing);
    }

    #[test]
    fn test_pause_twice_notifies_once() {
        let (sm, _) = machine(true);
        sm.start_capture();
        let notified = counting(&sm);

        assert!(sm.pause_capture());
        assert!(!sm.pause_capture());
        assert_eq!(sm.state(), CaptureState::Paused);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resume_rechecks_consent() {
        let (sm, consent) = machine(true);
        sm.start_capture();
        sm.pause_capture();

        consent.0.store(false, Ordering::SeqCst);
        assert!(!sm.resume_capture());
        assert_eq!(sm.state(), CaptureState::Paused);
    }

    #[test]
    fn test_guard_failures_are_silent() {
        let (sm, _) = machine(true);
        let notified = counting(&sm);

        assert!(!sm.pause_capture());
        assert!(!sm.resume_capture());
        assert_eq!(sm.state(), CaptureState::Idle);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscribers_see_old_and_new() {
        let (sm, _) = machine(true);
        let seen: Arc<Mutex<Vec<(CaptureState, CaptureState)>>> = Arc::default();
        let s = seen.clone();
        sm.subscribe(Box::new(move |old, new| {
            s.lock().push((old.clone(), new.clone()));
            Ok(())
        }));

        sm.start_capture();
        sm.stop_capture();

        assert_eq!(
            *seen.lock(),
            vec![
                (CaptureState::Idle, CaptureState::Capturing),
                (CaptureState::Capturing, CaptureState::Idle),
            ]
        );
    }

    #[test]
    fn test_failed_entry_becomes_error() {
        let (sm, _) = machine(true);
        let left_capturing = Arc::new(AtomicBool::new(false));
        let l = left_capturing.clone();
        sm.subscribe(Box::new(move |old, new| {
            if new.is_capturing() {
                return Err("input hook unavailable".into());
            }
            if old.is_capturing() {
                l.store(true, Ordering::SeqCst);
            }
            Ok(())
        }));

        assert!(!sm.start_capture());
        assert_eq!(
            sm.state(),
            CaptureState::Error("input hook unavailable".into())
        );
        assert!(left_capturing.load(Ordering::SeqCst));
    }

    #[test]
    fn test_persist_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let (sm, _) = machine(true);
        let sm = sm.with_persistence(path.clone());
        sm.start_capture();
        assert_eq!(load_state(&path).unwrap(), Some(CaptureState::Capturing));

        let consent = Arc::new(FlagConsent(AtomicBool::new(true)));
        let restored = StateMachine::new(consent).with_persistence(path.clone());
        let entered = counting(&restored);
        assert_eq!(restored.restore(), CaptureState::Capturing);
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restore_without_consent_requires_consent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let (sm, _) = machine(true);
        let sm = sm.with_persistence(path.clone());
        sm.start_capture();

        let revoked = Arc::new(FlagConsent(AtomicBool::new(false)));
        let restored = StateMachine::new(revoked).with_persistence(path);
        assert_eq!(restored.restore(), CaptureState::ConsentRequired);
    }

    #[test]
    fn test_error_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let (sm, _) = machine(true);
        let sm = sm.with_persistence(path.clone());
        sm.set_error("companion crashed repeatedly");

        assert_eq!(
            load_state(&path).unwrap(),
            Some(CaptureState::Error("companion crashed repeatedly".into()))
        );
    }
}
