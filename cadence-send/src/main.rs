//! cadence-send - publish daemon
//!
//! Polls the job queue and publishes content items when their booked slots
//! come due.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use libcadence::logging::{self, LoggingConfig};
use libcadence::{CadenceError, CadenceService, Config, Result};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cadence-send")]
#[command(version)]
#[command(about = "Publish daemon for the Cadence queue")]
#[command(long_about = "\
cadence-send - Publish daemon for the Cadence queue

DESCRIPTION:
    cadence-send is a long-running daemon that claims due publish jobs and
    pushes content to every target account through its platform adapter.

    Jobs interrupted by a crash are picked up again on start. Rate-limited
    items are deferred, server failures are retried with exponential
    backoff, and every account gets its own publish outcome.

USAGE:
    # Run in foreground (logs to stderr)
    cadence-send

    # Poll every 30 seconds
    cadence-send --poll-interval 30

    # Process everything due right now and exit
    cadence-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight jobs finish first)

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml (or $CADENCE_CONFIG)

    [scheduler]
    poll_interval = 5      # seconds between polls
    concurrency = 5        # jobs in flight at once
    max_attempts = 4       # passes per item before giving up
    initial_backoff = 2    # seconds, doubled on each retry

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Seconds between polls (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Run due jobs once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "cadence-send failed");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            logging::init_default();
            return Err(e);
        }
    };
    LoggingConfig::from_section(&config.logging, cli.verbose).init();

    if cli.poll_interval == Some(0) {
        return Err(CadenceError::InvalidInput(
            "poll interval must be at least 1 second".to_string(),
        ));
    }
    let poll_interval = cli.poll_interval.unwrap_or(config.scheduler.poll_interval);

    let service = CadenceService::from_config(config).await?;
    let runner = Arc::new(service.runner().with_poll_interval(poll_interval));
    info!(poll_interval, "cadence-send starting");

    if cli.once {
        let recovered = runner.queue().recover_stale().await?;
        let ran = runner.run_once().await?;
        info!(recovered, ran, "processed due jobs once, exiting");
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    runner.run_until(shutdown).await?;
    info!("cadence-send stopped");
    Ok(())
}

/// Flip `shutdown` on SIGINT or SIGTERM
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| CadenceError::InvalidInput(format!("signal setup failed: {}", e)))?;

    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "shutdown signal received, stopping gracefully");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}
