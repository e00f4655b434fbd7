//! The capture agent: consent, state machine, sources, privacy pipeline,
//! transport and companion supervisor wired together.

use crate::collector::{
    self, CurrentForeground, EventSink, EventSource, FocusProvider, FocusSource, IdleMonitor,
    IdleSource, InputHook, InputSource, ScreenGrabber, SourceSet, VisualCapture,
};
use crate::config::Config;
use crate::consent::{ConsentError, ConsentRecord, ConsentStore, StoreConsentGate};
use crate::event::CaptureEvent;
use crate::filter::{ContentScrubber, ContextFilter, ScrubberError};
use crate::integrity::{self, IntegrityError, VerifyResult};
use crate::pipeline::{CaptureGate, Pipeline};
use crate::policy::{CapturePolicy, PolicyHandle};
use crate::signing;
use crate::state::{CaptureState, StateMachine};
use crate::supervisor::{
    LaunchSpec, RestartPolicy, Supervisor, SupervisorError, SupervisorHooks, SupervisorStatus,
};
use crate::transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};
use crate::transport::{Transport, TransportSnapshot};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Manifest file name looked up in the install directory.
pub const MANIFEST_FILE: &str = "integrity.json";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Consent(#[from] ConsentError),
    #[error(transparent)]
    Scrubber(#[from] ScrubberError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("secure random source unavailable; cannot create IPC token")]
    SecureRandomUnavailable,
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Point-in-time view for `status` output.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub engagement_id: String,
    pub state: CaptureState,
    pub consented: bool,
    pub sources_running: bool,
    pub transport: TransportSnapshot,
    pub companion: Option<SupervisorStatus>,
    pub transparency: TransparencyStats,
}

/// Platform adapters, replaceable for tests or embedding.
pub struct AgentBuilder {
    config: Config,
    focus: Option<Arc<dyn FocusProvider>>,
    input: Option<Box<dyn InputHook>>,
    grabber: Option<Arc<dyn ScreenGrabber>>,
}

impl AgentBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            focus: None,
            input: None,
            grabber: None,
        }
    }

    pub fn focus_provider(mut self, provider: Arc<dyn FocusProvider>) -> Self {
        self.focus = Some(provider);
        self
    }

    pub fn input_hook(mut self, hook: Box<dyn InputHook>) -> Self {
        self.input = Some(hook);
        self
    }

    /// Enables visual-context capture, still subject to policy.
    pub fn screen_grabber(mut self, grabber: Arc<dyn ScreenGrabber>) -> Self {
        self.grabber = Some(grabber);
        self
    }

    /// Build the agent and restore its persisted state. Must be called from
    /// within a tokio runtime.
    pub fn build(self) -> Result<Agent, AgentError> {
        let config = self.config;
        config.ensure_directories()?;

        let store = Arc::new(ConsentStore::open(
            config.consent_dir(),
            config.consent_version.clone(),
        )?);
        let gate = Arc::new(StoreConsentGate::new(store.clone(), config.engagement_id.clone()));
        let state = Arc::new(StateMachine::new(gate).with_persistence(config.state_path()));

        let policy = PolicyHandle::new(config.policy.clone());
        let filter = ContextFilter::new(policy.clone());
        let transparency: SharedTransparencyLog =
            Arc::new(TransparencyLog::with_persistence(config.transparency_path()));

        let capture_gate = CaptureGate::new();
        let (queue_tx, queue_rx) = mpsc::channel(config.transport.queue_capacity.max(1));
        let pipeline = Arc::new(Pipeline::new(
            filter.clone(),
            ContentScrubber::new()?,
            capture_gate.clone(),
            queue_tx,
            transparency.clone(),
        ));

        let foreground = CurrentForeground::default();
        let idle = Arc::new(IdleMonitor::new(config.idle.threshold));

        let focus_provider = self.focus.unwrap_or_else(collector::platform_focus_provider);
        let mut focus = FocusSource::new(focus_provider, filter, foreground.clone());
        if let Some(grabber) = self.grabber {
            focus = focus.with_visual_capture(Arc::new(VisualCapture::new(grabber, policy.clone())));
        }
        let hook = self
            .input
            .unwrap_or_else(|| Box::new(collector::PlatformInputHook::new()));
        let input = InputSource::new(hook, foreground.clone(), config.input_flush_interval)
            .with_idle_monitor(idle.clone());
        let idle_source = IdleSource::new(idle, foreground, config.idle.check_interval);

        let sources = Arc::new(SourceSet::new(vec![
            Box::new(focus) as Box<dyn EventSource>,
            Box::new(input),
            Box::new(idle_source),
        ]));

        state.subscribe(lifecycle_subscriber(pipeline.clone(), sources.clone()));

        let token = match &config.transport.token {
            Some(token) => token.clone(),
            None => {
                let bytes = signing::generate_key().ok_or(AgentError::SecureRandomUnavailable)?;
                URL_SAFE_NO_PAD.encode(bytes)
            }
        };
        let transport = Transport::spawn(&config.transport, token.clone(), capture_gate, queue_rx);

        let restored = state.restore();
        tracing::info!(engagement = %config.engagement_id, state = %restored, "agent ready");

        Ok(Agent {
            config,
            store,
            state,
            pipeline,
            sources,
            policy,
            transparency,
            transport,
            token,
            supervisor: Mutex::new(None),
        })
    }
}

/// Directory the companion and the integrity manifest are resolved against.
pub fn install_dir(config: &Config) -> Result<PathBuf, AgentError> {
    if let Some(dir) = &config.supervisor.install_dir {
        return Ok(dir.clone());
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .ok_or_else(|| SupervisorError::NoInstallDir.into())
}

/// Check the install against its manifest. The key is only needed when a
/// manifest is present.
pub fn verify_install(config: &Config) -> Result<VerifyResult, AgentError> {
    let install_dir = install_dir(config)?;
    let integrity = &config.integrity;
    let manifest = integrity
        .manifest_path
        .clone()
        .unwrap_or_else(|| install_dir.join(MANIFEST_FILE));
    let root = integrity.code_root.clone().unwrap_or(install_dir);

    if !manifest.exists() {
        return Ok(VerifyResult::ManifestMissing);
    }
    let key = integrity::resolve_key(integrity.manifest_key.as_deref())?;
    Ok(integrity::verify(&manifest, &root, &key))
}

/// Starts sources on entry to Capturing and stops them on exit, with the
/// capture gate following.
fn lifecycle_subscriber(
    pipeline: Arc<Pipeline>,
    sources: Arc<SourceSet>,
) -> crate::state::Subscriber {
    Box::new(move |old, new| {
        if new.is_capturing() {
            if *old != CaptureState::Paused {
                pipeline.begin_session();
            }
            pipeline.gate().open();
            let sink: Arc<dyn EventSink> = pipeline.clone();
            if let Err(e) = sources.start_all(sink) {
                pipeline.gate().close();
                return Err(format!("failed to start capture sources: {e}"));
            }
        } else if old.is_capturing() {
            pipeline.gate().close();
            sources.stop_all();
        }
        Ok(())
    })
}

pub struct Agent {
    config: Config,
    store: Arc<ConsentStore>,
    state: Arc<StateMachine>,
    pipeline: Arc<Pipeline>,
    sources: Arc<SourceSet>,
    policy: PolicyHandle,
    transparency: SharedTransparencyLog,
    transport: Transport,
    token: String,
    supervisor: Mutex<Option<Arc<Supervisor>>>,
}

impl Agent {
    /// Build with the platform's own adapters.
    pub fn new(config: Config) -> Result<Self, AgentError> {
        AgentBuilder::new(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        self.state.state()
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn is_consented(&self) -> bool {
        self.store.is_consented(&self.config.engagement_id)
    }

    /// Begin capturing. A no-op without consent.
    pub fn start(&self) -> bool {
        let started = self.state.start_capture();
        if !started && !self.is_consented() {
            tracing::info!("capture not started: consent required");
            self.state.require_consent();
        }
        started
    }

    pub fn pause(&self) -> bool {
        self.state.pause_capture()
    }

    pub fn resume(&self) -> bool {
        self.state.resume_capture()
    }

    pub fn stop(&self) -> bool {
        self.state.stop_capture()
    }

    /// Record consent for the configured engagement. Capture still has to be
    /// started explicitly.
    pub fn grant_consent(&self) -> Result<ConsentRecord, AgentError> {
        let record = self.store.grant(&self.config.engagement_id)?;
        if self.state.state() == CaptureState::ConsentRequired {
            self.state.stop_capture();
        }
        Ok(record)
    }

    /// Withdraw consent. Capture stops before this returns, and the
    /// companion is asked to shut down.
    pub async fn revoke(&self) -> Result<ConsentRecord, AgentError> {
        let record = self.store.revoke(&self.config.engagement_id)?;
        self.transition(|state| {
            state.require_consent();
        })
        .await;
        if let Some(supervisor) = self.companion() {
            supervisor.stop().await?;
        }
        Ok(record)
    }

    /// Newest first, already redacted.
    pub fn recent_events(&self, limit: usize) -> Vec<CaptureEvent> {
        self.transparency.recent_events(limit)
    }

    pub fn update_policy(&self, policy: CapturePolicy) {
        self.policy.replace(policy);
    }

    pub fn policy(&self) -> Arc<CapturePolicy> {
        self.policy.current()
    }

    /// Stop capturing if consent is no longer valid, e.g. after it was
    /// revoked from another process.
    pub fn enforce_consent(&self) {
        let state = self.state.state();
        if matches!(state, CaptureState::Capturing | CaptureState::Paused) && !self.is_consented() {
            tracing::warn!("consent no longer valid, stopping capture");
            self.state.require_consent();
        }
    }

    /// Verify the install and launch the companion under supervision.
    pub async fn start_companion(&self) -> Result<(), AgentError> {
        let supervisor = match self.companion() {
            Some(supervisor) => supervisor,
            None => {
                if let Err(e) = self.verify_install().await {
                    let message = e.to_string();
                    self.transition(move |state| {
                        state.set_error(message);
                    })
                    .await;
                    return Err(e);
                }
                let spawned = Arc::new(self.spawn_supervisor()?);
                self.install_companion(spawned)
            }
        };
        supervisor.start().await?;
        Ok(())
    }

    fn spawn_supervisor(&self) -> Result<Supervisor, AgentError> {
        let launch = LaunchSpec::from_config(
            &self.config.supervisor,
            &self.config.transport.socket_path,
            &self.token,
        )?;
        let state = self.state.clone();
        let reconnect = self.transport.reconnect_trigger();
        let hooks = SupervisorHooks::default()
            .on_started(move |_| reconnect())
            .on_fatal(move |message| {
                let state = state.clone();
                let message = message.to_string();
                // Leaving Capturing joins source threads.
                drop(tokio::task::spawn_blocking(move || state.set_error(message)));
            });
        Ok(Supervisor::spawn(
            launch,
            RestartPolicy::from(&self.config.supervisor),
            hooks,
        ))
    }

    /// Hashing the install reads every listed file.
    async fn verify_install(&self) -> Result<(), AgentError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || -> Result<(), AgentError> {
            let result = verify_install(&config)?;
            integrity::check_startup(&result, config.dev_mode)?;
            Ok(())
        })
        .await?
    }

    fn companion(&self) -> Option<Arc<Supervisor>> {
        self.supervisor.lock().clone()
    }

    /// Keep the first supervisor installed if another caller raced us.
    fn install_companion(&self, spawned: Arc<Supervisor>) -> Arc<Supervisor> {
        self.supervisor.lock().get_or_insert(spawned).clone()
    }

    /// Run a state change off the async workers; leaving Capturing joins
    /// source threads.
    async fn transition<F>(&self, change: F)
    where
        F: FnOnce(&StateMachine) + Send + 'static,
    {
        let state = self.state.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || change(&state)).await {
            tracing::error!("state transition task failed: {e}");
        }
    }

    pub async fn status(&self) -> AgentStatus {
        let companion = match self.companion() {
            Some(supervisor) => supervisor.status().await.ok(),
            None => None,
        };
        AgentStatus {
            engagement_id: self.config.engagement_id.clone(),
            state: self.state.state(),
            consented: self.is_consented(),
            sources_running: self.sources.any_running(),
            transport: self.transport.status(),
            companion,
            transparency: self.transparency.stats(),
        }
    }

    pub fn transparency(&self) -> &SharedTransparencyLog {
        &self.transparency
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.pipeline.session_id()
    }

    /// Stop capture, the companion and the transport. The persisted state is
    /// left as it was so the next start resumes it.
    pub async fn shutdown(mut self) {
        self.pipeline.gate().close();
        let sources = self.sources.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || sources.stop_all()).await {
            tracing::error!("failed to stop sources: {e}");
        }

        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
        self.transport.shutdown().await;

        if let Err(e) = self.transparency.save() {
            tracing::warn!("failed to save transparency log: {e}");
        }
        tracing::info!("agent shut down");
    }
}
