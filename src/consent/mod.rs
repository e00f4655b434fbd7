//! User consent.

pub mod store;

pub use store::{ConsentError, ConsentRecord, ConsentState, ConsentStore};

use std::sync::Arc;

/// Answers "may capture run right now?" for the state machine.
pub trait ConsentGate: Send + Sync {
    fn is_consented(&self) -> bool;
}

/// Consent gate that re-reads and verifies the stored record on every check.
pub struct StoreConsentGate {
    store: Arc<ConsentStore>,
    engagement_id: String,
}

impl StoreConsentGate {
    pub fn new(store: Arc<ConsentStore>, engagement_id: impl Into<String>) -> Self {
        Self {
            store,
            engagement_id: engagement_id.into(),
        }
    }
}

impl ConsentGate for StoreConsentGate {
    fn is_consented(&self) -> bool {
        self.store.is_consented(&self.engagement_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_follows_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConsentStore::open(dir.path(), "1").unwrap());
        let gate = StoreConsentGate::new(store.clone(), "eng-1");

        assert!(!gate.is_consented());
        store.grant("eng-1").unwrap();
        assert!(gate.is_consented());
        store.revoke("eng-1").unwrap();
        assert!(!gate.is_consented());
    }
}
