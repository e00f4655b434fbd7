//! Commands from other processes (the CLI, a tray shell) to a running agent.
//!
//! The sender atomically writes a single command to `control.json`; the
//! agent polls for it, applies it and deletes the file.

use crate::fsutil::atomic_write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Start,
    Pause,
    Resume,
    Stop,
    /// Consent was revoked out of process; stop capture and the companion.
    Revoke,
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlMessage {
    command: ControlCommand,
    issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ControlFile {
    path: PathBuf,
}

impl ControlFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `command`, replacing any command not yet picked up.
    pub fn send(&self, command: ControlCommand) -> std::io::Result<()> {
        let message = ControlMessage {
            command,
            issued_at: Utc::now(),
        };
        let json = serde_json::to_vec(&message).map_err(std::io::Error::other)?;
        atomic_write(&self.path, &json)
    }

    /// Remove and return the pending command, if any. Unparseable files are
    /// discarded.
    pub fn take(&self) -> Option<ControlCommand> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("cannot read control file: {e}");
                return None;
            }
        };
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("cannot remove control file: {e}");
        }

        match serde_json::from_slice::<ControlMessage>(&content) {
            Ok(message) => {
                tracing::debug!(command = ?message.command, issued_at = %message.issued_at, "control command received");
                Some(message.command)
            }
            Err(e) => {
                tracing::warn!("ignoring malformed control file: {e}");
                None
            }
        }
    }
}
