//! KMFlow Agent - consent-gated desktop activity capture for process discovery.
//!
//! The agent observes which applications a consenting user works in and how
//! (switches, input counts, idle periods), filters and redacts that activity
//! on-device, and hands it to a local companion process.
//!
//! # Privacy Guarantees
//!
//! - **Consent first**: nothing is captured unless a valid, signed consent
//!   record exists for the engagement
//! - **No key content**: keyboard activity is reported as counts, never keys
//! - **Context filtering**: password fields, private browsing, password
//!   managers and blocklisted apps never produce events
//! - **Redaction**: emails, card numbers and similar PII are scrubbed before
//!   events leave the pipeline
//! - **Local only**: events go to a same-host companion process, never the network
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           KMFlow Agent                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐       │
//! │  │ Sources  │──▶│ L1 filter│──▶│ Sequence │──▶│ L2 scrub │──┐    │
//! │  └──────────┘   └──────────┘   └──────────┘   └──────────┘  │    │
//! │       ▲                                                     ▼    │
//! │  ┌──────────┐   ┌──────────┐                        ┌──────────┐ │
//! │  │  State   │◀──│ Consent  │                        │Transport │ │
//! │  │ machine  │   │  store   │                        └────┬─────┘ │
//! │  └──────────┘   └──────────┘                             │       │
//! │                                      ┌────────────┐      ▼       │
//! │                                      │ Supervisor │──▶ companion │
//! │                                      └────────────┘              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use kmflow_agent::{Agent, Config};
//!
//! # async fn run() -> Result<(), kmflow_agent::AgentError> {
//! let agent = Agent::new(Config::load().unwrap_or_default())?;
//! agent.grant_consent()?;
//! agent.start();
//! for event in agent.recent_events(10) {
//!     println!("{} {}", event.sequence_number, event.event_type);
//! }
//! agent.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod collector;
pub mod config;
pub mod consent;
pub mod control;
pub mod event;
pub mod filter;
mod fsutil;
pub mod integrity;
pub mod pipeline;
pub mod policy;
pub mod signing;
pub mod state;
pub mod supervisor;
pub mod transparency;
pub mod transport;

// Re-export key types at crate root for convenience
pub use agent::{Agent, AgentBuilder, AgentError, AgentStatus};
pub use collector::{CollectorError, EventSink, EventSource};
pub use config::Config;
pub use consent::{ConsentRecord, ConsentState, ConsentStore};
pub use event::{CaptureEvent, EventType, RawEvent};
pub use filter::{BlockReason, ContentScrubber, ContextFilter};
pub use pipeline::{CaptureGate, EmitOutcome, Pipeline};
pub use policy::{CapturePolicy, KeystrokeMode, PolicyHandle};
pub use state::{CaptureState, StateMachine};
pub use supervisor::{Supervisor, SupervisorStatus};
pub use transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};
pub use transport::{Transport, TransportError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Privacy declaration that can be displayed to users.
pub const PRIVACY_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║               KMFLOW AGENT - PRIVACY DECLARATION                 ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This agent records how work moves between applications so       ║
║  your organisation can understand its processes.                 ║
║                                                                  ║
║  ✓ WHAT WE CAPTURE (only after you consent):                     ║
║    • Which application and window is in front, and when          ║
║    • How many keys, clicks and scrolls occur (counts only)       ║
║    • When you are idle, in 15 minute bins                        ║
║                                                                  ║
║  ✗ WHAT WE NEVER CAPTURE:                                        ║
║    • Which keys you press (no passwords, messages, etc.)         ║
║    • Password fields, private browsing or password managers      ║
║    • Email addresses, card numbers or ID numbers (redacted)      ║
║    • Screen content, unless your administrator enabled it        ║
║                                                                  ║
║  Events stay on this machine and go only to the local KMFlow     ║
║  companion. You can pause or revoke consent at any time:         ║
║    kmflow-agent pause                                            ║
║    kmflow-agent consent revoke                                   ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;
