//! Local IPC delivery of captured events to the companion process.
//!
//! Events are written as newline-delimited JSON after a token handshake.
//! A single writer owns the connection, so events arrive in queue order.

pub mod backoff;
pub mod channel;
pub mod client;
pub mod protocol;

pub use backoff::Backoff;
pub use channel::{Discovery, Endpoint};
pub use client::{Transport, TransportSnapshot, TransportStatus};
pub use protocol::{AgentMessage, CompanionMessage};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("refusing to connect through symlinked socket {}", .0.display())]
    SymlinkRefused(PathBuf),

    #[error("socket {} is owned by uid {owner}, not the current user", .path.display())]
    ForeignOwner { path: PathBuf, owner: u32 },

    #[error("discovery host {0:?} is not a loopback address")]
    NonLoopback(String),

    #[error("companion rejected handshake: {0}")]
    HandshakeRejected(String),

    #[error("companion did not acknowledge handshake in time")]
    HandshakeTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}
