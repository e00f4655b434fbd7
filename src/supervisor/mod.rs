//! Keeps the companion process alive.
//!
//! A single actor task owns the child process. Unrequested exits are
//! restarted after a short delay, bounded by a [`CircuitBreaker`]; once it
//! trips the supervisor gives up and reports a fatal error.

mod breaker;
mod launch;

pub use breaker::CircuitBreaker;
pub use launch::{
    resolve_program, validate_backend_url, LaunchSpec, ENV_BACKEND_URL, ENV_IPC_SOCKET,
    ENV_IPC_TOKEN, ENV_LOG_LEVEL,
};

use crate::config::SupervisorConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("companion program {} must be a relative path inside the install directory", .0.display())]
    ProgramOutsideInstallDir(PathBuf),

    #[error("companion program not found at {}", .0.display())]
    ProgramNotFound(PathBuf),

    #[error("cannot determine the agent install directory")]
    NoInstallDir,

    #[error("backend URL {0:?} must be http(s) with a host")]
    InvalidBackendUrl(String),

    #[error("log level {0:?} contains unsupported characters")]
    InvalidLogLevel(String),

    #[error("failed to spawn companion: {0}")]
    Spawn(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("supervisor is not running")]
    Stopped,
}

/// Restart and shutdown timing.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: usize,
    pub window: Duration,
    pub restart_delay: Duration,
    pub stop_timeout: Duration,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: config.restart_window,
            restart_delay: config.restart_delay,
            stop_timeout: config.stop_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub restarts_in_window: usize,
    pub tripped: bool,
}

type StartedHook = Arc<dyn Fn(u32) + Send + Sync>;
type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks invoked from the supervisor task.
#[derive(Clone)]
pub struct SupervisorHooks {
    on_started: StartedHook,
    on_fatal: FatalHook,
}

impl Default for SupervisorHooks {
    fn default() -> Self {
        Self {
            on_started: Arc::new(|_| {}),
            on_fatal: Arc::new(|_| {}),
        }
    }
}

impl SupervisorHooks {
    /// Called with the pid after every successful spawn.
    pub fn on_started(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_started = Arc::new(hook);
        self
    }

    /// Called once when the circuit breaker trips.
    pub fn on_fatal(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_fatal = Arc::new(hook);
        self
    }
}

enum Request {
    Start(oneshot::Sender<Result<(), SupervisorError>>),
    Stop(oneshot::Sender<()>),
    Status(oneshot::Sender<SupervisorStatus>),
}

/// Handle to the supervisor actor.
pub struct Supervisor {
    commands: mpsc::Sender<Request>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Spawn the actor on the current runtime. The companion is not started
    /// until [`Supervisor::start`].
    pub fn spawn(launch: LaunchSpec, policy: RestartPolicy, hooks: SupervisorHooks) -> Self {
        let (commands, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let actor = Actor {
            launch,
            policy,
            hooks,
            breaker: CircuitBreaker::new(policy.max_restarts, policy.window),
            child: None,
            wanted: false,
            restart_at: None,
            commands: rx,
            cancel: cancel.clone(),
        };
        Self {
            commands,
            cancel,
            task: Mutex::new(Some(tokio::spawn(actor.run()))),
        }
    }

    /// Start the companion. A no-op while it is already running. Resets a
    /// tripped breaker.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Start(tx)).await?;
        rx.await.map_err(|_| SupervisorError::Stopped)?
    }

    /// Stop the companion and suppress restarts. Returns once it has exited.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Stop(tx)).await?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }

    pub async fn status(&self) -> Result<SupervisorStatus, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Status(tx)).await?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }

    /// Stop the companion and end the actor.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            tracing::debug!("supervisor already gone: {e}");
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("supervisor task ended abnormally: {e}");
            }
        }
    }

    async fn send(&self, command: Request) -> Result<(), SupervisorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SupervisorError::Stopped)
    }
}

struct Actor {
    launch: LaunchSpec,
    policy: RestartPolicy,
    hooks: SupervisorHooks,
    breaker: CircuitBreaker,
    child: Option<Child>,
    /// Whether the companion should be running.
    wanted: bool,
    restart_at: Option<Instant>,
    commands: mpsc::Receiver<Request>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                exit = wait_child(&mut self.child) => self.on_exit(exit),
                _ = sleep_until(self.restart_at) => {
                    self.restart_at = None;
                    if self.wanted {
                        if let Err(e) = self.spawn_child() {
                            tracing::warn!("companion restart failed: {e}");
                            // Counts against the breaker like a crash.
                            self.schedule_restart();
                        }
                    }
                }
            }
        }

        self.wanted = false;
        if let Some(child) = self.child.take() {
            terminate(child, self.policy.stop_timeout).await;
        }
        tracing::debug!("supervisor stopped");
    }

    async fn handle(&mut self, command: Request) {
        match command {
            Request::Start(reply) => {
                let result = if self.child.is_some() {
                    Ok(())
                } else {
                    self.breaker.reset();
                    self.restart_at = None;
                    self.wanted = true;
                    self.spawn_child().map(|_| ())
                };
                if result.is_err() {
                    self.wanted = false;
                }
                let _ = reply.send(result);
            }
            Request::Stop(reply) => {
                self.wanted = false;
                self.restart_at = None;
                if let Some(child) = self.child.take() {
                    terminate(child, self.policy.stop_timeout).await;
                }
                let _ = reply.send(());
            }
            Request::Status(reply) => {
                let _ = reply.send(SupervisorStatus {
                    running: self.child.is_some(),
                    pid: self.child.as_ref().and_then(Child::id),
                    restarts_in_window: self.breaker.restarts_in_window(std::time::Instant::now()),
                    tripped: self.breaker.is_tripped(),
                });
            }
        }
    }

    fn spawn_child(&mut self) -> Result<u32, SupervisorError> {
        let mut command = Command::new(&self.launch.program);
        command
            .args(&self.launch.args)
            .env_clear()
            .envs(self.launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = self.launch.program.parent() {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id().unwrap_or_default();
        self.child = Some(child);
        tracing::info!(pid, program = %self.launch.program.display(), "companion started");
        (self.hooks.on_started)(pid);
        Ok(pid)
    }

    fn on_exit(&mut self, exit: std::io::Result<ExitStatus>) {
        self.child = None;
        match exit {
            Ok(status) => tracing::warn!(%status, "companion exited unexpectedly"),
            Err(e) => tracing::warn!("lost track of companion: {e}"),
        }
        if self.wanted {
            self.schedule_restart();
        }
    }

    /// Queue a restart after the configured delay, or trip and report a fatal
    /// error once the breaker is full. Both crashes and failed respawn
    /// attempts take a slot in the window, so a companion that cannot be
    /// spawned again trips the breaker as quickly as one that keeps crashing.
    fn schedule_restart(&mut self) {
        if self.breaker.try_restart(std::time::Instant::now()) {
            self.restart_at = Some(Instant::now() + self.policy.restart_delay);
            return;
        }
        self.wanted = false;
        let message = format!(
            "companion crashed more than {} times in {}s; not restarting",
            self.policy.max_restarts,
            self.policy.window.as_secs()
        );
        tracing::error!("{message}");
        (self.hooks.on_fatal)(&message);
    }
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Ask the child to exit, then kill it if it has not within `timeout`.
async fn terminate(mut child: Child, timeout: Duration) {
    let pid = child.id();

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, "SIGTERM failed: {e}");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            tracing::debug!("terminate failed: {e}");
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(?pid, %status, "companion stopped"),
        Ok(Err(e)) => tracing::warn!(?pid, "waiting for companion failed: {e}"),
        Err(_) => {
            tracing::warn!(?pid, "companion ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(?pid, "kill failed: {e}");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            env: Vec::new(),
        }
    }

    fn policy() -> RestartPolicy {
        RestartPolicy {
            max_restarts: 5,
            window: Duration::from_secs(60),
            restart_delay: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_breaker_trips_after_repeated_crashes() {
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let starts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let hooks = SupervisorHooks::default()
            .on_started(move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
            .on_fatal(move |message| {
                let _ = fatal_tx.send(message.to_string());
            });

        let supervisor = Supervisor::spawn(shell("exit 1"), policy(), hooks);
        supervisor.start().await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(10), fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(message.contains("not restarting"));

        // The first start plus five restarts; the sixth crash is not restarted.
        assert_eq!(starts.load(std::sync::atomic::Ordering::SeqCst), 6);
        let status = supervisor.status().await.unwrap();
        assert!(status.tripped);
        assert!(!status.running);
        assert_eq!(status.restarts_in_window, 5);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_suppresses_restart() {
        let supervisor =
            Supervisor::spawn(shell("sleep 30"), policy(), SupervisorHooks::default());
        supervisor.start().await.unwrap();
        let status = supervisor.status().await.unwrap();
        assert!(status.running);
        assert!(status.pid.is_some());

        tokio::time::timeout(Duration::from_secs(6), supervisor.stop())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = supervisor.status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.restarts_in_window, 0);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let supervisor =
            Supervisor::spawn(shell("sleep 30"), policy(), SupervisorHooks::default());
        supervisor.start().await.unwrap();
        let first = supervisor.status().await.unwrap().pid;
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.status().await.unwrap().pid, first);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_program_fails_start() {
        let launch = LaunchSpec {
            program: PathBuf::from("/nonexistent/kmflow-companion"),
            args: Vec::new(),
            env: Vec::new(),
        };
        let supervisor = Supervisor::spawn(launch, policy(), SupervisorHooks::default());
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::Spawn(_))
        ));
        assert!(!supervisor.status().await.unwrap().running);
        supervisor.shutdown().await;
    }
}
