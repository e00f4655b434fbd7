//! Layer 1: context filter.
//!
//! Decides whether an event may be generated at all, based on where it
//! happened. Runs before sequencing, so blocked events never consume a
//! sequence number.

use crate::event::RawEvent;
use crate::filter::browsers::is_private_window;
use crate::policy::PolicyHandle;
use serde::Serialize;

/// Processes that are never captured regardless of policy.
const STATIC_BLOCKLIST: &[&str] = &[
    "com.1password.1password",
    "com.agilebits.onepassword7",
    "1password",
    "1password.exe",
    "com.bitwarden.desktop",
    "bitwarden",
    "bitwarden.exe",
    "org.keepassxc.keepassxc",
    "keepassxc",
    "keepassxc.exe",
    "com.lastpass.lastpass",
    "lastpass",
    "com.dashlane.dashlane",
    "dashlane",
    "com.apple.keychainaccess",
    "keychain access",
    "credentialuibroker.exe",
];

/// Why an event was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    UnknownProcess,
    StaticBlocklist,
    PolicyBlocklist,
    NotAllowlisted,
    PasswordField,
    PrivateBrowsing,
}

/// Outcome of the context filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Block(BlockReason),
}

impl FilterDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, FilterDecision::Block(_))
    }
}

/// Context filter bound to the live capture policy.
#[derive(Debug, Clone)]
pub struct ContextFilter {
    policy: PolicyHandle,
}

impl ContextFilter {
    pub fn new(policy: PolicyHandle) -> Self {
        Self { policy }
    }

    /// Whether a process may produce events at all, independent of event type.
    pub fn check_process(&self, process_id: Option<&str>) -> FilterDecision {
        let Some(process) = process_id else {
            return FilterDecision::Block(BlockReason::UnknownProcess);
        };

        if is_statically_blocked(process) {
            return FilterDecision::Block(BlockReason::StaticBlocklist);
        }

        let policy = self.policy.current();
        if policy.blocks(process) {
            return FilterDecision::Block(BlockReason::PolicyBlocklist);
        }
        if policy.allows(process) == Some(false) {
            return FilterDecision::Block(BlockReason::NotAllowlisted);
        }

        FilterDecision::Allow
    }

    /// Full check for one event.
    pub fn check(&self, event: &RawEvent) -> FilterDecision {
        let decision = self.check_process(event.process_id.as_deref());
        if decision.is_blocked() {
            return decision;
        }

        if event.event_type.is_keyboard_class() && event.password_field_focused {
            return FilterDecision::Block(BlockReason::PasswordField);
        }

        if event.event_type.is_navigation_class()
            && is_private_window(event.process_id.as_deref(), event.window_title.as_deref())
        {
            return FilterDecision::Block(BlockReason::PrivateBrowsing);
        }

        FilterDecision::Allow
    }
}

fn is_statically_blocked(process: &str) -> bool {
    STATIC_BLOCKLIST
        .iter()
        .any(|p| p.eq_ignore_ascii_case(process))
}
