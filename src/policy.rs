//! Capture policy supplied by the control plane.
//!
//! A policy value is immutable once built. Updates replace the whole value,
//! so a reader always sees either the old policy or the new one.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How much keyboard information may be captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeystrokeMode {
    /// Counts and timing only.
    #[default]
    ActionLevel,
    /// Typed text may be captured; scrubbing still applies.
    ContentLevel,
}

/// Rate caps for visual-context capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualCaptureLimits {
    pub hourly_cap: u32,
    pub daily_cap: u32,
    pub per_app_cooldown_secs: u64,
    pub global_cooldown_secs: u64,
}

impl Default for VisualCaptureLimits {
    fn default() -> Self {
        Self {
            hourly_cap: 12,
            daily_cap: 60,
            per_app_cooldown_secs: 300,
            global_cooldown_secs: 60,
        }
    }
}

/// Operator policy for one engagement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapturePolicy {
    /// When set, only these processes may produce events.
    #[serde(default)]
    pub allowlist: Option<Vec<String>>,
    /// Processes that must never produce events, in addition to the built-in list.
    #[serde(default)]
    pub blocklist: Vec<String>,
    #[serde(default)]
    pub keystroke_mode: KeystrokeMode,
    #[serde(default)]
    pub visual_capture_enabled: bool,
    #[serde(default)]
    pub visual_capture_limits: VisualCaptureLimits,
}

impl CapturePolicy {
    /// Case-insensitive allowlist membership. `None` when no allowlist is configured.
    pub fn allows(&self, process_id: &str) -> Option<bool> {
        self.allowlist
            .as_ref()
            .map(|list| list.iter().any(|p| p.eq_ignore_ascii_case(process_id)))
    }

    /// Case-insensitive operator blocklist membership.
    pub fn blocks(&self, process_id: &str) -> bool {
        self.blocklist
            .iter()
            .any(|p| p.eq_ignore_ascii_case(process_id))
    }
}

/// Shared handle to the current policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyHandle {
    inner: Arc<RwLock<Arc<CapturePolicy>>>,
}

impl PolicyHandle {
    pub fn new(policy: CapturePolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(policy))),
        }
    }

    /// The policy in effect right now.
    pub fn current(&self) -> Arc<CapturePolicy> {
        self.inner.read().clone()
    }

    /// Swap in a new policy.
    pub fn replace(&self, policy: CapturePolicy) {
        *self.inner.write() = Arc::new(policy);
        tracing::info!("capture policy updated");
    }
}
