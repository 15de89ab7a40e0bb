use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initializes logging with a daily-rotated file in `logs_dir` plus compact
/// console output. `RUST_LOG` takes precedence over `filter`.
///
/// Returns a guard that must be kept alive for the duration of the process.
pub fn init_logging(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "conductor");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

/// Default filter for a configured level: the level for everything, with the
/// conductor crates one notch more verbose when running at `info`.
pub fn default_filter(level: &str) -> String {
    if level.eq_ignore_ascii_case("info") {
        "info,conductor_engine=debug,conductor_app=debug".into()
    } else {
        level.to_string()
    }
}
