//! Adapters for platforms without a supported input or focus API.
//!
//! These let the agent build and run everywhere; no OS events are produced.

use crate::collector::focus::{FocusCallback, FocusProvider};
use crate::collector::input::{InputHook, InputSignal};
use crate::collector::CollectorError;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;

/// Input hook that never reports a signal.
#[derive(Default)]
pub struct NoopInputHook {
    // Held so the worker sees a live channel rather than a disconnect.
    signals: Option<Sender<InputSignal>>,
}

impl NoopInputHook {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputHook for NoopInputHook {
    fn start(&mut self, signals: Sender<InputSignal>) -> Result<(), CollectorError> {
        if self.signals.is_some() {
            return Err(CollectorError::AlreadyRunning);
        }
        self.signals = Some(signals);
        Ok(())
    }

    fn stop(&mut self) {
        self.signals = None;
    }
}

/// Focus provider that never reports a change.
#[derive(Default)]
pub struct NoopFocusProvider {
    callback: Mutex<Option<FocusCallback>>,
}

impl FocusProvider for NoopFocusProvider {
    fn subscribe(&self, on_change: FocusCallback) -> Result<(), CollectorError> {
        *self.callback.lock() = Some(on_change);
        Ok(())
    }

    fn unsubscribe(&self) {
        *self.callback.lock() = None;
    }
}

pub fn platform_focus_provider() -> Arc<dyn FocusProvider> {
    Arc::new(NoopFocusProvider::default())
}

/// No permission gate on these platforms.
pub fn check_permission() -> bool {
    true
}
