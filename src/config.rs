//! Configuration for the KMFlow capture agent.

use crate::policy::CapturePolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "kmflow-agent";

/// Main configuration for the capture agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engagement this install captures for.
    pub engagement_id: String,

    /// Consent text version the user must have agreed to.
    pub consent_version: String,

    /// Path for consent records, capture state and transparency counters
    pub data_path: PathBuf,

    /// Operator capture policy
    pub policy: CapturePolicy,

    pub idle: IdleConfig,

    /// How often aggregated input counts are flushed
    #[serde(with = "duration_serde")]
    pub input_flush_interval: Duration,

    pub transport: TransportConfig,

    pub supervisor: SupervisorConfig,

    pub integrity: IntegrityConfig,

    /// Development mode tolerates a missing integrity manifest.
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            engagement_id: "default".to_string(),
            consent_version: "1".to_string(),
            policy: CapturePolicy::default(),
            idle: IdleConfig::default(),
            input_flush_interval: Duration::from_secs(10),
            transport: TransportConfig::for_data_dir(&data_dir),
            supervisor: SupervisorConfig::default(),
            integrity: IntegrityConfig::default(),
            dev_mode: false,
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, or defaults when it does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        std::fs::create_dir_all(self.consent_dir())?;
        Ok(())
    }

    pub fn consent_dir(&self) -> PathBuf {
        self.data_path.join("consent")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_path.join("capture_state.json")
    }

    pub fn transparency_path(&self) -> PathBuf {
        self.data_path.join("transparency.json")
    }

    /// Control file written by CLI commands and polled by a running agent.
    pub fn control_path(&self) -> PathBuf {
        self.data_path.join("control.json")
    }
}

/// Idle detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    #[serde(with = "duration_serde")]
    pub threshold: Duration,
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(300),
            check_interval: Duration::from_secs(5),
        }
    }
}

/// Local channel to the companion process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Unix socket path, or named pipe name on Windows.
    pub socket_path: PathBuf,

    /// Discovery file the companion writes for the TCP loopback fallback.
    pub discovery_path: PathBuf,

    /// Handshake token. Generated per run when unset.
    pub token: Option<String>,

    /// Events held while the companion is unreachable.
    pub queue_capacity: usize,

    #[serde(with = "millis_serde")]
    pub backoff_base: Duration,

    #[serde(with = "millis_serde")]
    pub backoff_cap: Duration,

    /// Reconnect attempts per outage.
    pub max_attempts: u32,
}

impl TransportConfig {
    fn for_data_dir(data_dir: &std::path::Path) -> Self {
        #[cfg(windows)]
        let socket_path = PathBuf::from(r"\\.\pipe\kmflow-agent");
        #[cfg(not(windows))]
        let socket_path = data_dir.join("agent.sock");

        Self {
            socket_path,
            discovery_path: data_dir.join("ipc_port.json"),
            token: None,
            queue_capacity: 10_000,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self::for_data_dir(&data_dir)
    }
}

/// Companion process supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub enabled: bool,

    /// Install directory executables are resolved against. Defaults to the
    /// agent executable's directory.
    pub install_dir: Option<PathBuf>,

    /// Companion executable, relative to `install_dir`.
    pub program: PathBuf,

    pub args: Vec<String>,

    /// Forwarded as `KMFLOW_BACKEND_URL` after validation.
    pub backend_url: Option<String>,

    /// Forwarded as `KMFLOW_LOG_LEVEL`.
    pub log_level: Option<String>,

    pub max_restarts: usize,

    #[serde(with = "duration_serde")]
    pub restart_window: Duration,

    #[serde(with = "millis_serde")]
    pub restart_delay: Duration,

    #[serde(with = "duration_serde")]
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            install_dir: None,
            program: PathBuf::from(if cfg!(windows) {
                "kmflow-intelligence.exe"
            } else {
                "kmflow-intelligence"
            }),
            args: Vec::new(),
            backend_url: None,
            log_level: None,
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
            restart_delay: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Code integrity checking.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Manifest location. Defaults to `integrity.json` in the install directory.
    pub manifest_path: Option<PathBuf>,

    /// Root the manifest paths are relative to. Defaults to the install directory.
    pub code_root: Option<PathBuf>,

    /// Base64 manifest signing key. `KMFLOW_MANIFEST_KEY` overrides it.
    pub manifest_key: Option<String>,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serde support for Duration as whole seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde support for Duration as milliseconds.
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.idle.threshold, Duration::from_secs(300));
        assert_eq!(config.transport.backoff_base, Duration::from_millis(500));
        assert_eq!(config.transport.max_attempts, 10);
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.supervisor.restart_window, Duration::from_secs(60));
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"engagement_id": "eng-42", "transport": {"backoff_base": 250}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.engagement_id, "eng-42");
        assert_eq!(config.transport.backoff_base, Duration::from_millis(250));
        assert_eq!(config.transport.backoff_cap, Duration::from_secs(30));
        assert_eq!(config.consent_version, "1");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.policy.blocklist.push("slack".into());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.policy.blocklist, vec!["slack".to_string()]);
        assert_eq!(loaded.input_flush_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
