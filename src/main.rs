use anyhow::{Context as _, Result};
use clap::Parser;
use reqflow::{EngineBuilder, EngineConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "reqflowd", about = "Durable HTTP request queue engine", version)]
struct Args {
    /// Data directory for the SQLite store and `queue.toml`.
    #[arg(long, env = "REQFLOW_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "REQFLOW_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "REQFLOW_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Number of worker tasks to run. Defaults to the configured worker_count.
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    let mut config = EngineConfig::load(args.data_dir.clone());
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }

    info!(data_dir = %config.data_dir.display(), workers = config.worker_count, "starting reqflow engine");

    let engine = EngineBuilder::new(config)
        .build()
        .await
        .context("failed to build engine")?;
    engine.start().await;

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "engine event");
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received, draining workers");
    engine.shutdown().await?;

    Ok(())
}

/// Initialize the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file. Returns a `WorkerGuard` that must stay
/// alive for the process lifetime.
///
/// Falls back to stdout-only logging with a warning if the log directory
/// can't be created — never panics on a bad log path.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("reqflow.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
