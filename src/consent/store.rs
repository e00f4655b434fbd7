//! Tamper-evident consent records.
//!
//! Each record is signed with a per-install secret. A record that fails
//! verification, or was given for an older consent text, counts as never
//! consented.

use crate::fsutil::{atomic_write, atomic_write_private};
use crate::signing::{self, KEY_LEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

const KEY_FILE: &str = ".consent_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    NeverConsented,
    Consented,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub engagement_id: String,
    pub state: ConsentState,
    pub consented_at: Option<DateTime<Utc>>,
    pub consent_version: String,
    #[serde(default)]
    pub signature: String,
}

impl ConsentRecord {
    pub fn never_consented(engagement_id: &str, consent_version: &str) -> Self {
        Self {
            engagement_id: engagement_id.to_string(),
            state: ConsentState::NeverConsented,
            consented_at: None,
            consent_version: consent_version.to_string(),
            signature: String::new(),
        }
    }

    pub fn is_consented(&self) -> bool {
        self.state == ConsentState::Consented
    }

    /// Bytes covered by the signature. Field order is fixed by the struct.
    fn canonical_bytes(&self) -> Result<Vec<u8>, ConsentError> {
        #[derive(Serialize)]
        struct Signed<'a> {
            engagement_id: &'a str,
            state: ConsentState,
            consented_at: Option<DateTime<Utc>>,
            consent_version: &'a str,
        }

        Ok(serde_json::to_vec(&Signed {
            engagement_id: &self.engagement_id,
            state: self.state,
            consented_at: self.consented_at,
            consent_version: &self.consent_version,
        })?)
    }
}

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("secure random source unavailable; refusing to create consent key")]
    SecureRandomUnavailable,
    #[error("consent key at {} is corrupt", .0.display())]
    InvalidKey(PathBuf),
    #[error("consent storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize consent record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Signed consent records, one file per engagement.
pub struct ConsentStore {
    dir: PathBuf,
    key: [u8; KEY_LEN],
    current_version: String,
}

impl ConsentStore {
    /// Open the store in `dir`, creating the install secret on first use.
    pub fn open(dir: impl Into<PathBuf>, current_version: impl Into<String>) -> Result<Self, ConsentError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let key = load_or_create_key(&dir.join(KEY_FILE))?;
        Ok(Self {
            dir,
            key,
            current_version: current_version.into(),
        })
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Load the verified record for `engagement_id`. Anything missing,
    /// unreadable, unsigned, tampered with or stale reads as NeverConsented.
    pub fn load(&self, engagement_id: &str) -> ConsentRecord {
        let never = ConsentRecord::never_consented(engagement_id, &self.current_version);
        let path = self.record_path(engagement_id);

        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return never,
            Err(e) => {
                tracing::warn!("cannot read consent record: {e}");
                return never;
            }
        };
        let record: ConsentRecord = match serde_json::from_slice(&content) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("consent record is malformed: {e}");
                return never;
            }
        };

        if record.engagement_id != engagement_id || !self.verify(&record) {
            tracing::warn!("consent record failed signature verification");
            return never;
        }
        if record.consent_version != self.current_version {
            tracing::info!(
                recorded = %record.consent_version,
                current = %self.current_version,
                "consent given for an older version"
            );
            return never;
        }
        record
    }

    /// Sign and persist `record`, replacing any previous one.
    pub fn save(&self, record: &mut ConsentRecord) -> Result<(), ConsentError> {
        record.signature = signing::sign(&self.key, &record.canonical_bytes()?);
        let json = serde_json::to_vec_pretty(record)?;
        atomic_write(&self.record_path(&record.engagement_id), &json)?;
        Ok(())
    }

    pub fn grant(&self, engagement_id: &str) -> Result<ConsentRecord, ConsentError> {
        let mut record = ConsentRecord {
            engagement_id: engagement_id.to_string(),
            state: ConsentState::Consented,
            consented_at: Some(Utc::now()),
            consent_version: self.current_version.clone(),
            signature: String::new(),
        };
        self.save(&mut record)?;
        tracing::info!(engagement = engagement_id, "consent granted");
        Ok(record)
    }

    pub fn revoke(&self, engagement_id: &str) -> Result<ConsentRecord, ConsentError> {
        let previous = self.load(engagement_id);
        let mut record = ConsentRecord {
            engagement_id: engagement_id.to_string(),
            state: ConsentState::Revoked,
            consented_at: previous.consented_at,
            consent_version: self.current_version.clone(),
            signature: String::new(),
        };
        self.save(&mut record)?;
        tracing::info!(engagement = engagement_id, "consent revoked");
        Ok(record)
    }

    pub fn is_consented(&self, engagement_id: &str) -> bool {
        self.load(engagement_id).is_consented()
    }

    /// File holding the record for `engagement_id`. The id is hashed so it
    /// cannot steer the path.
    pub fn record_path(&self, engagement_id: &str) -> PathBuf {
        let digest = Sha256::digest(engagement_id.as_bytes());
        let hex = format!("{digest:x}");
        self.dir.join(format!("consent_{}.json", &hex[..16]))
    }

    fn verify(&self, record: &ConsentRecord) -> bool {
        match record.canonical_bytes() {
            Ok(bytes) => signing::verify(&self.key, &bytes, &record.signature),
            Err(_) => false,
        }
    }
}

fn load_or_create_key(path: &Path) -> Result<[u8; KEY_LEN], ConsentError> {
    match std::fs::read(path) {
        Ok(bytes) => bytes
            .try_into()
            .map_err(|_| ConsentError::InvalidKey(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = signing::generate_key().ok_or(ConsentError::SecureRandomUnavailable)?;
            atomic_write_private(path, &key)?;
            tracing::info!("created consent signing key");
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}
