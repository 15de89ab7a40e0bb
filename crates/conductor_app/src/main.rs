use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use conductor_core::ConductorConfig;
use conductor_core::logging;
use conductor_engine::{EngineEvent, HttpBackend, HttpHealthProbe, Orchestrator};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Route LLM tasks across local and remote providers.
#[derive(Debug, Parser)]
#[command(name = "conductor", version, about)]
struct Cli {
    /// Configuration file (`.json` or `.toml`).
    #[arg(short, long)]
    config: PathBuf,

    /// Directory for rotated log files. Defaults to `~/.conductor/logs`.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Write every engine event to the log as one JSON line until the bus closes.
async fn log_events(mut rx: broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(target: "conductor::events", "{json}"),
                Err(e) => warn!("Failed to serialize event: {e}"),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConductorConfig::load_from_path(&cli.config)
        .with_context(|| format!("Invalid configuration {}", cli.config.display()))?;

    let logs_dir = match cli.log_dir {
        Some(dir) => dir,
        None => ConductorConfig::logs_dir()?,
    };
    let _log_guard = logging::init_logging(&logs_dir, &logging::default_filter(&config.log_level))?;
    info!(
        config = %cli.config.display(),
        providers = config.providers.len(),
        "Starting conductor v{VERSION}"
    );

    let probe = Arc::new(HttpHealthProbe::new(config.health.probe_timeout));
    let orchestrator = Orchestrator::from_config(&config, Arc::new(HttpBackend::new()), probe)
        .context("Failed to set up orchestrator")?;

    let event_log = tokio::spawn(log_events(orchestrator.events()));
    orchestrator.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    orchestrator.shutdown().await;
    event_log.abort();
    Ok(())
}
