use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use socwatch::agent::Agent;
use socwatch::config::{Config, Overrides};

/// Apple Silicon power and utilization monitor built on powermetrics.
#[derive(Parser)]
#[command(name = "socwatch", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Sampling and refresh interval in milliseconds.
    #[arg(short, long)]
    interval: Option<u64>,

    /// Serve Prometheus metrics on this address (":9090" or "9090").
    #[arg(short, long)]
    prometheus: Option<String>,

    /// Write JSON snapshots to stdout.
    #[arg(long)]
    headless: bool,

    /// Stop after this many headless snapshots (0 runs until shutdown).
    #[arg(long, requires = "headless")]
    count: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected by build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("socwatch {}", version::full());
        return Ok(());
    }

    let overrides = Overrides {
        log_level: cli.log_level,
        interval_ms: cli.interval,
        prometheus: cli.prometheus,
        headless: cli.headless,
        count: cli.count,
    };

    let cfg = Config::resolve(cli.config.as_deref(), &overrides).context("loading config")?;

    // Logs go to stderr; stdout belongs to the headless feed.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting socwatch",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let shutdown = agent.shutdown_token();
    tokio::select! {
        result = wait_for_signal() => result?,
        _ = shutdown.cancelled() => {
            tracing::info!("agent finished, shutting down");
        }
    }

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("socwatch stopped");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("waiting for SIGINT")?;
    tracing::info!("received SIGINT, shutting down");
    Ok(())
}
