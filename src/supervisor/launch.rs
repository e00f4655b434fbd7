//! Resolving the companion executable and building its environment.

use super::SupervisorError;
use crate::config::SupervisorConfig;
use std::path::{Component, Path, PathBuf};

/// Variables copied from the agent's own environment when present.
const PASSTHROUGH: &[&str] = &[
    "HOME",
    "USERPROFILE",
    "LOCALAPPDATA",
    "TMPDIR",
    "TEMP",
    "LANG",
    "SystemRoot",
];

pub const ENV_BACKEND_URL: &str = "KMFLOW_BACKEND_URL";
pub const ENV_LOG_LEVEL: &str = "KMFLOW_LOG_LEVEL";
pub const ENV_IPC_SOCKET: &str = "KMFLOW_IPC_SOCKET";
pub const ENV_IPC_TOKEN: &str = "KMFLOW_IPC_TOKEN";

/// Everything needed to spawn the companion. The environment is complete:
/// the child gets these variables and nothing else.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn from_config(
        config: &SupervisorConfig,
        socket_path: &Path,
        token: &str,
    ) -> Result<Self, SupervisorError> {
        let install_dir = match &config.install_dir {
            Some(dir) => dir.clone(),
            None => default_install_dir()?,
        };
        let program = resolve_program(&install_dir, &config.program)?;

        let mut env = vec![
            (ENV_IPC_SOCKET.to_string(), socket_path.display().to_string()),
            (ENV_IPC_TOKEN.to_string(), token.to_string()),
        ];
        if let Some(url) = &config.backend_url {
            validate_backend_url(url)?;
            env.push((ENV_BACKEND_URL.to_string(), url.clone()));
        }
        if let Some(level) = &config.log_level {
            validate_log_level(level)?;
            env.push((ENV_LOG_LEVEL.to_string(), level.clone()));
        }
        for name in PASSTHROUGH {
            if let Ok(value) = std::env::var(name) {
                env.push((name.to_string(), value));
            }
        }

        Ok(Self {
            program,
            args: config.args.clone(),
            env,
        })
    }

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn default_install_dir() -> Result<PathBuf, SupervisorError> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or(SupervisorError::NoInstallDir)
}

/// `program` must be a plain relative path below `install_dir`.
pub fn resolve_program(install_dir: &Path, program: &Path) -> Result<PathBuf, SupervisorError> {
    let plain = program.components().all(|c| matches!(c, Component::Normal(_)));
    if !plain || program.as_os_str().is_empty() {
        return Err(SupervisorError::ProgramOutsideInstallDir(program.to_path_buf()));
    }
    let path = install_dir.join(program);
    if !path.is_file() {
        return Err(SupervisorError::ProgramNotFound(path));
    }
    Ok(path)
}

/// Only absolute http(s) URLs with a host are forwarded.
pub fn validate_backend_url(raw: &str) -> Result<(), SupervisorError> {
    let invalid = || SupervisorError::InvalidBackendUrl(raw.to_string());
    let url = url::Url::parse(raw).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

fn validate_log_level(level: &str) -> Result<(), SupervisorError> {
    let ok = !level.is_empty()
        && level
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '=' | ',' | ':' | '.'));
    if ok {
        Ok(())
    } else {
        Err(SupervisorError::InvalidLogLevel(level.to_string()))
    }
}
