//! KMFlow Agent CLI
//!
//! Consent-gated desktop activity capture for process discovery.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use kmflow_agent::{
    agent::{self, Agent, AgentError},
    collector::check_permission,
    config::Config,
    consent::ConsentStore,
    control::{ControlCommand, ControlFile},
    integrity::{self, VerifyResult},
    state::load_state,
    CaptureState, PRIVACY_DECLARATION, VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kmflow-agent")]
#[command(author = "KMFlow")]
#[command(version = VERSION)]
#[command(about = "Consent-gated desktop activity capture agent", long_about = None)]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground
    Run {
        /// Do not launch the companion process
        #[arg(long)]
        no_companion: bool,
    },

    /// Manage consent for the configured engagement
    Consent {
        #[command(subcommand)]
        action: ConsentAction,
    },

    /// Pause capture in the running agent
    Pause,

    /// Resume capture in the running agent
    Resume,

    /// Stop capture in the running agent
    Stop,

    /// Show agent status
    Status,

    /// Verify the install against its integrity manifest
    Verify,

    /// Integrity manifest tooling
    Manifest {
        #[command(subcommand)]
        action: ManifestAction,
    },

    /// Display privacy declaration
    Privacy,

    /// Show configuration
    Config,
}

#[derive(Subcommand)]
enum ConsentAction {
    /// Record consent and start capture
    Grant,
    /// Withdraw consent and stop capture
    Revoke,
    /// Show the stored consent record
    Show,
}

#[derive(Subcommand)]
enum ManifestAction {
    /// Hash files under ROOT into a signed manifest
    Generate {
        /// Directory the listed files are relative to
        #[arg(long)]
        root: PathBuf,

        /// Where to write the manifest
        #[arg(long, short)]
        output: PathBuf,

        /// Files to include, relative to ROOT
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run { no_companion } => cmd_run(config, no_companion),
        Commands::Consent { action } => match action {
            ConsentAction::Grant => cmd_consent_grant(&config),
            ConsentAction::Revoke => cmd_consent_revoke(&config),
            ConsentAction::Show => cmd_consent_show(&config),
        },
        Commands::Pause => send_control(&config, ControlCommand::Pause, "Capture paused."),
        Commands::Resume => send_control(&config, ControlCommand::Resume, "Capture resumed."),
        Commands::Stop => send_control(&config, ControlCommand::Stop, "Capture stopped."),
        Commands::Status => cmd_status(&config),
        Commands::Verify => cmd_verify(&config),
        Commands::Manifest { action } => match action {
            ManifestAction::Generate {
                root,
                output,
                files,
            } => cmd_manifest_generate(&config, &root, &output, &files),
        },
        Commands::Privacy => {
            println!("{PRIVACY_DECLARATION}");
            Ok(())
        }
        Commands::Config => cmd_config(&config, cli.config.as_ref()),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(Config::load().unwrap_or_default()),
    }
}

fn cmd_run(config: Config, no_companion: bool) -> anyhow::Result<()> {
    println!("KMFlow Agent v{VERSION}");
    println!();

    if !check_permission() {
        eprintln!("Error: Input Monitoring permission not granted.");
        eprintln!();
        eprintln!("To grant permission:");
        eprintln!("1. Open System Settings > Privacy & Security");
        eprintln!("2. Select 'Input Monitoring' and 'Accessibility'");
        eprintln!("3. Add this application to the allowed list");
        eprintln!("4. Restart the application");
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(run_agent(config, no_companion))
}

async fn run_agent(config: Config, no_companion: bool) -> anyhow::Result<()> {
    let control = ControlFile::new(config.control_path());
    if let Some(stale) = control.take() {
        tracing::info!(command = ?stale, "discarded control command issued while not running");
    }
    let launch_companion = config.supervisor.enabled && !no_companion;

    let agent = Agent::new(config).context("failed to initialise agent")?;
    println!("Engagement: {}", agent.config().engagement_id);

    if launch_companion {
        match agent.start_companion().await {
            Ok(()) => println!("Companion: started"),
            Err(e @ AgentError::Integrity(_)) => {
                agent.shutdown().await;
                return Err(e).context("refusing to start: install failed integrity verification");
            }
            Err(e) => eprintln!("Warning: companion not started: {e}"),
        }
    }

    if agent.state() == CaptureState::Idle {
        agent.start();
    }
    println!("State: {}", agent.state());
    if !agent.is_consented() {
        println!("Run `kmflow-agent consent grant` to begin capturing.");
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone())?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut ticks: u64 = 0;
    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        ticks += 1;

        if let Some(command) = control.take() {
            apply_control(&agent, command).await;
        }
        agent.enforce_consent();

        if ticks % 60 == 0 {
            if let Err(e) = agent.transparency().save() {
                tracing::warn!("failed to save transparency log: {e}");
            }
        }
    }

    println!();
    println!("Shutting down...");
    println!("{}", agent.transparency().summary());
    agent.shutdown().await;
    Ok(())
}

async fn apply_control(agent: &Agent, command: ControlCommand) {
    let changed = match command {
        ControlCommand::Start => agent.start(),
        ControlCommand::Pause => agent.pause(),
        ControlCommand::Resume => agent.resume(),
        ControlCommand::Stop => agent.stop(),
        ControlCommand::Revoke => match agent.revoke().await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("revocation failed: {e}");
                false
            }
        },
    };
    tracing::info!(command = ?command, changed, state = %agent.state(), "control command applied");
}

fn open_store(config: &Config) -> anyhow::Result<ConsentStore> {
    ConsentStore::open(config.consent_dir(), config.consent_version.clone())
        .context("failed to open consent store")
}

fn cmd_consent_grant(config: &Config) -> anyhow::Result<()> {
    let record = open_store(config)?.grant(&config.engagement_id)?;
    ControlFile::new(config.control_path()).send(ControlCommand::Start)?;
    println!(
        "Consent recorded for engagement '{}' (version {}).",
        record.engagement_id, record.consent_version
    );
    println!("A running agent will start capturing shortly.");
    Ok(())
}

fn cmd_consent_revoke(config: &Config) -> anyhow::Result<()> {
    open_store(config)?.revoke(&config.engagement_id)?;
    ControlFile::new(config.control_path()).send(ControlCommand::Revoke)?;
    println!("Consent revoked for engagement '{}'.", config.engagement_id);
    println!("Capture stops and the companion shuts down within a few seconds.");
    Ok(())
}

fn cmd_consent_show(config: &Config) -> anyhow::Result<()> {
    let record = open_store(config)?.load(&config.engagement_id);
    println!("Engagement:      {}", record.engagement_id);
    println!("State:           {:?}", record.state);
    println!("Consent version: {}", record.consent_version);
    match record.consented_at {
        Some(at) => println!("Consented at:    {}", at.to_rfc3339()),
        None => println!("Consented at:    never"),
    }
    Ok(())
}

fn send_control(config: &Config, command: ControlCommand, message: &str) -> anyhow::Result<()> {
    ControlFile::new(config.control_path())
        .send(command)
        .context("failed to write control file")?;
    println!("{message}");
    Ok(())
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    println!("KMFlow Agent Status");
    println!("===================");
    println!();

    println!(
        "Input Monitoring Permission: {}",
        if check_permission() {
            "Granted ✓"
        } else {
            "Not Granted ✗"
        }
    );
    println!("Engagement: {}", config.engagement_id);

    let consented = open_store(config)?.is_consented(&config.engagement_id);
    println!("Consent: {}", if consented { "granted" } else { "not granted" });

    match load_state(&config.state_path()) {
        Ok(Some(state)) => println!("Capture state: {state}"),
        Ok(None) => println!("Capture state: never started"),
        Err(e) => println!("Capture state: unreadable ({e})"),
    }
    println!();

    let stats_path = config.transparency_path();
    match std::fs::read_to_string(&stats_path) {
        Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(stats) => {
                println!("Cumulative Statistics:");
                for key in [
                    "events_emitted",
                    "events_blocked",
                    "blocked_sensitive_field",
                    "redactions_applied",
                    "events_dropped",
                ] {
                    if let Some(value) = stats.get(key) {
                        println!("  {key}: {value}");
                    }
                }
            }
            Err(e) => println!("Transparency log unreadable: {e}"),
        },
        Err(_) => println!("No previous session data found."),
    }
    Ok(())
}

fn cmd_verify(config: &Config) -> anyhow::Result<()> {
    match agent::verify_install(config)? {
        VerifyResult::Passed => println!("Integrity check passed."),
        VerifyResult::ManifestMissing if config.dev_mode => {
            println!("No integrity manifest (tolerated in development mode).")
        }
        VerifyResult::ManifestMissing => bail!("integrity manifest missing"),
        VerifyResult::Failed(violations) => {
            for violation in &violations {
                eprintln!("  {violation}");
            }
            bail!("integrity check failed ({} violations)", violations.len());
        }
    }
    Ok(())
}

fn cmd_manifest_generate(
    config: &Config,
    root: &Path,
    output: &Path,
    files: &[PathBuf],
) -> anyhow::Result<()> {
    let key = integrity::resolve_key(config.integrity.manifest_key.as_deref())?;
    let manifest = integrity::generate(root, files, &key)?;
    manifest.save(output)?;
    println!(
        "Wrote manifest with {} entries to {}",
        manifest.entries.len(),
        output.display()
    );
    Ok(())
}

fn cmd_config(config: &Config, path: Option<&PathBuf>) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    let path = path.cloned().unwrap_or_else(Config::config_path);
    println!("Config file: {}", path.display());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")
}
