//! Code integrity verification.
//!
//! A manifest maps install-relative paths to SHA-256 digests and carries an
//! HMAC over its entries. The signature is checked before any entry is
//! trusted.

use crate::signing;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const MANIFEST_VERSION: u32 = 1;

/// Environment variable holding the base64 manifest key.
pub const MANIFEST_KEY_ENV: &str = "KMFLOW_MANIFEST_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub version: u32,
    /// Install-relative path (forward slashes) to lower-case hex SHA-256.
    pub entries: BTreeMap<String, String>,
    pub signature: String,
}

impl IntegrityManifest {
    fn canonical_bytes(version: u32, entries: &BTreeMap<String, String>) -> Vec<u8> {
        // BTreeMap keeps entry order stable.
        serde_json::to_vec(&(version, entries)).unwrap_or_default()
    }

    fn signature_valid(&self, key: &[u8]) -> bool {
        signing::verify(
            key,
            &Self::canonical_bytes(self.version, &self.entries),
            &self.signature,
        )
    }

    pub fn save(&self, path: &Path) -> Result<(), IntegrityError> {
        let json = serde_json::to_vec_pretty(self)?;
        crate::fsutil::atomic_write(path, &json)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Missing,
    Mismatch,
    OutsideRoot,
    Unreadable,
    BadSignature,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub kind: ViolationKind,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            ViolationKind::Missing => "file missing",
            ViolationKind::Mismatch => "digest mismatch",
            ViolationKind::OutsideRoot => "path escapes install root",
            ViolationKind::Unreadable => "file unreadable",
            ViolationKind::BadSignature => "manifest signature invalid",
            ViolationKind::Malformed => "manifest malformed",
        };
        write!(f, "{}: {what}", self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Passed,
    Failed(Vec<Violation>),
    ManifestMissing,
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("integrity check failed: {}", format_violations(.0))]
    Failed(Vec<Violation>),
    #[error("integrity manifest missing")]
    ManifestMissing,
    #[error("no manifest key configured (set KMFLOW_MANIFEST_KEY)")]
    MissingKey,
    #[error("manifest key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),
    #[error("path {0} is outside the install root")]
    OutsideRoot(String),
    #[error("integrity I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Resolve the manifest key: `KMFLOW_MANIFEST_KEY` first, then the
/// configured value.
pub fn resolve_key(configured: Option<&str>) -> Result<Vec<u8>, IntegrityError> {
    let encoded = std::env::var(MANIFEST_KEY_ENV)
        .ok()
        .or_else(|| configured.map(str::to_string))
        .ok_or(IntegrityError::MissingKey)?;
    Ok(STANDARD.decode(encoded.trim())?)
}

/// Check every file in the manifest at `manifest_path` against `code_root`.
pub fn verify(manifest_path: &Path, code_root: &Path, key: &[u8]) -> VerifyResult {
    let manifest_label = manifest_path.display().to_string();
    let content = match std::fs::read(manifest_path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return VerifyResult::ManifestMissing,
        Err(_) => return single(manifest_label, ViolationKind::Unreadable),
    };
    let manifest: IntegrityManifest = match serde_json::from_slice(&content) {
        Ok(manifest) => manifest,
        Err(_) => return single(manifest_label, ViolationKind::Malformed),
    };
    if !manifest.signature_valid(key) {
        return single(manifest_label, ViolationKind::BadSignature);
    }

    let canonical_root = match code_root.canonicalize() {
        Ok(root) => root,
        Err(_) => return single(code_root.display().to_string(), ViolationKind::Missing),
    };

    let violations: Vec<Violation> = manifest
        .entries
        .iter()
        .filter_map(|(rel, expected)| {
            check_entry(&canonical_root, rel, expected).map(|kind| Violation {
                path: rel.clone(),
                kind,
            })
        })
        .collect();

    if violations.is_empty() {
        tracing::info!(files = manifest.entries.len(), "integrity check passed");
        VerifyResult::Passed
    } else {
        for v in &violations {
            tracing::error!("integrity violation: {v}");
        }
        VerifyResult::Failed(violations)
    }
}

fn single(path: String, kind: ViolationKind) -> VerifyResult {
    tracing::error!(path = %path, ?kind, "integrity manifest rejected");
    VerifyResult::Failed(vec![Violation { path, kind }])
}

fn check_entry(root: &Path, rel: &str, expected: &str) -> Option<ViolationKind> {
    let Some(path) = resolve_within(root, rel) else {
        return Some(ViolationKind::OutsideRoot);
    };
    let resolved = match path.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Some(ViolationKind::Missing),
        Err(_) => return Some(ViolationKind::Unreadable),
    };
    // A symlink inside the root may still point outside it.
    if !resolved.starts_with(root) {
        return Some(ViolationKind::OutsideRoot);
    }
    match sha256_file(&resolved) {
        Ok(actual) if actual.eq_ignore_ascii_case(expected) => None,
        Ok(_) => Some(ViolationKind::Mismatch),
        Err(_) => Some(ViolationKind::Unreadable),
    }
}

/// Join a relative path onto `root`, refusing absolute paths and `..`.
fn resolve_within(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let mut path = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}

/// Lower-case hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Build a signed manifest for `files` (relative to `code_root`).
pub fn generate<P: AsRef<Path>>(
    code_root: &Path,
    files: &[P],
    key: &[u8],
) -> Result<IntegrityManifest, IntegrityError> {
    let mut entries = BTreeMap::new();
    for file in files {
        let rel = file.as_ref();
        let label = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let path = resolve_within(code_root, &label)
            .ok_or_else(|| IntegrityError::OutsideRoot(label.clone()))?;
        entries.insert(label, sha256_file(&path)?);
    }

    let signature = signing::sign(
        key,
        &IntegrityManifest::canonical_bytes(MANIFEST_VERSION, &entries),
    );
    Ok(IntegrityManifest {
        version: MANIFEST_VERSION,
        entries,
        signature,
    })
}

/// Startup policy: Failed is always fatal, ManifestMissing only outside
/// development mode.
pub fn check_startup(result: &VerifyResult, dev_mode: bool) -> Result<(), IntegrityError> {
    match result {
        VerifyResult::Passed => Ok(()),
        VerifyResult::Failed(violations) => Err(IntegrityError::Failed(violations.clone())),
        VerifyResult::ManifestMissing if dev_mode => {
            tracing::warn!("integrity manifest missing; continuing in development mode");
            Ok(())
        }
        VerifyResult::ManifestMissing => Err(IntegrityError::ManifestMissing),
    }
}
