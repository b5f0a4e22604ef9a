//! Supply Tracker CLI
//!
//! Parses and sums per-block supply records from a tracer's JSONL log,
//! surviving chain reorganisations and process restarts.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use supply_tracker::{
    api,
    checkpoint::TotalSupply,
    config::TrackerConfig,
    reader::{self, FeedEvent},
    tracker::SupplyTracker,
};

#[derive(Parser)]
#[command(name = "supply-tracker")]
#[command(about = "Parse and sum supply data from a tracer's JSONL log")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracker daemon
    Run {
        /// File to read supply records from (rotated siblings are discovered)
        #[arg(long)]
        supply_file: Option<PathBuf>,

        /// File to persist the aggregate state for subsequent runs
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Port for the HTTP state endpoint
        #[arg(long)]
        api_port: Option<u16>,

        /// Remove any persisted state and start fresh
        #[arg(long)]
        fresh: bool,
    },

    /// Print the persisted state summary
    Status,

    /// Validate the configuration file
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let mut config = match &cli.config {
        Some(path) => TrackerConfig::from_file(path)
            .with_context(|| format!("loading config from {path:?}"))?,
        None => TrackerConfig::default(),
    };

    match cli.command {
        Commands::Run {
            supply_file,
            state_file,
            api_port,
            fresh,
        } => {
            if let Some(path) = supply_file {
                config.supply_file = path;
            }
            if let Some(path) = state_file {
                config.state_file = path;
            }
            if let Some(port) = api_port {
                config.api_port = port;
            }
            config.validate()?;
            run(config, fresh).await
        }
        Commands::Status => show_status(&config),
        Commands::ValidateConfig => {
            config.validate()?;
            println!("Configuration is valid.");
            println!("  Supply file: {:?}", config.supply_file);
            println!("  State file: {:?}", config.state_file);
            println!("  API port: {}", config.api_port);
            println!("  Poll interval: {}s", config.poll_interval_secs);
            Ok(())
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn run(config: TrackerConfig, fresh: bool) -> Result<()> {
    if fresh && config.state_file.exists() {
        info!("Removing existing state file {:?}", config.state_file);
        std::fs::remove_file(&config.state_file)
            .with_context(|| format!("removing {:?}", config.state_file))?;
    }

    // Resume from the checkpoint if one exists.
    let mut last_consumed = None;
    let tracker = match TotalSupply::load(&config.state_file)
        .with_context(|| format!("loading state from {:?}", config.state_file))?
    {
        Some(persisted) => {
            let (head, totals, file) = persisted.into_state();
            info!(
                "Loaded state at block {} from {:?}; last parsed log file: {}",
                head.number,
                config.state_file,
                file.as_deref().unwrap_or("none"),
            );
            last_consumed = file;
            SupplyTracker::from_checkpoint(head, totals)
        }
        None => {
            info!("No state file found, starting from scratch");
            SupplyTracker::new()
        }
    };
    let tracker = Arc::new(RwLock::new(tracker));

    let (tx, rx) = mpsc::channel(1024);
    let reader_task = tokio::spawn(reader::run_feed(
        config.supply_file.clone(),
        last_consumed,
        Duration::from_secs(config.poll_interval_secs),
        tx,
    ));
    let driver_task = tokio::spawn(drive(rx, tracker.clone(), config.state_file.clone()));
    let api_task = tokio::spawn(api::serve(config.api_port, tracker.clone()));

    tokio::select! {
        biased;

        res = shutdown_signal() => {
            res?;
            info!("Received shutdown signal, exiting");
            Ok(())
        }
        res = reader_task => {
            match res.context("log feed task panicked")? {
                // Every file consumed and nothing left to tail: stay up for
                // the API until a signal arrives.
                Ok(()) => {
                    info!("Log feed finished");
                    shutdown_signal().await?;
                    info!("Received shutdown signal, exiting");
                    Ok(())
                }
                Err(err) => Err(err.context("log feed failed")),
            }
        }
        res = driver_task => {
            res.context("driver task panicked")?.context("driver failed")
        }
        res = api_task => {
            res.context("API task panicked")?.context("API server failed")
        }
    }
}

/// Consume feed events: ingest records, checkpoint on consumed-file markers.
async fn drive(
    mut rx: mpsc::Receiver<FeedEvent>,
    tracker: Arc<RwLock<SupplyTracker>>,
    state_file: PathBuf,
) -> Result<()> {
    while let Some(event) = rx.recv().await {
        match event {
            FeedEvent::Record(record) => {
                let number = record.number;
                let outcome = match tracker.write() {
                    Ok(mut guard) => guard.ingest(record),
                    Err(_) => anyhow::bail!("tracker lock poisoned"),
                };
                // Skipped records are logged, not fatal: the next valid
                // block re-converges the state.
                if let Err(err) = outcome {
                    error!("Skipping record for block {}: {}", number, err);
                }
            }
            FeedEvent::FileConsumed(name) => {
                let (head, totals) = match tracker.read() {
                    Ok(guard) => guard.snapshot(),
                    Err(_) => anyhow::bail!("tracker lock poisoned"),
                };
                TotalSupply::from_state(&head, &totals, Some(name.clone()))
                    .save(&state_file)
                    .with_context(|| format!("saving state to {state_file:?}"))?;
                debug!("Checkpointed consumed log file {}", name);
            }
        }
    }
    Ok(())
}

fn show_status(config: &TrackerConfig) -> Result<()> {
    match TotalSupply::load(&config.state_file)? {
        Some(state) => println!("{}", state.summary()),
        None => println!("No state file at {:?}", config.state_file),
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
