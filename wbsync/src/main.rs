//! wbsync - incremental indicator synchronization
//!
//! Resolves configuration, runs one synchronization and prints the stored
//! datasets plus the indicators that failed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wbsync::{SyncOutcome, Synchronizer};
use wbsync_common::config::{self, TomlConfig};

/// Rows printed per indicator
const PREVIEW_ROWS: usize = 5;

/// Command-line arguments for wbsync
#[derive(Parser, Debug)]
#[command(name = "wbsync")]
#[command(about = "Incrementally synchronize World Bank indicators into a local store")]
#[command(version)]
struct Args {
    /// Indicator codes (repeat the flag or separate with commas)
    #[arg(short, long, required = true, value_delimiter = ',')]
    indicators: Vec<String>,

    /// ISO-3 country codes, or `all`
    #[arg(short, long, value_delimiter = ',', default_value = "all")]
    countries: Vec<String>,

    #[arg(long, default_value_t = 2000)]
    start_year: i32,

    /// Defaults to the current year
    #[arg(long)]
    end_year: Option<i32>,

    /// Concurrent fetch workers (defaults to `sync.concurrency_limit`)
    #[arg(long)]
    max_workers: Option<usize>,

    /// Path to wbsync.toml
    #[arg(long, env = "WBSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Data folder holding the database
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Cancel outstanding fetches after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(config::default_config_path);
    let mut toml_config = match &config_path {
        Some(path) => config::load_toml_config(path).context("Failed to load configuration")?,
        None => TomlConfig::default(),
    };
    toml_config.apply_env_overrides();

    let level = toml_config.logging.level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("wbsync={level},wbsync_common={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting wbsync {}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) if path.exists() => info!("Configuration: {}", path.display()),
        Some(path) => warn!("No config file at {}, using defaults", path.display()),
        None => warn!("No config directory on this platform, using defaults"),
    }

    if let Some(secs) = args.deadline_secs {
        toml_config.sync.run_deadline_secs = Some(secs);
    }

    let root_folder = config::resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    let db_path = toml_config.database_path(&root_folder);
    info!("Database: {}", db_path.display());

    let synchronizer = Synchronizer::connect(&toml_config, &db_path)
        .await
        .context("Failed to open the observation store")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling fetches");
            ctrl_c.cancel();
        }
    });

    let end_year = args.end_year.unwrap_or_else(wbsync_common::time::current_year);
    let workers = args.max_workers.unwrap_or(toml_config.sync.concurrency_limit);

    let outcome = synchronizer
        .synchronize_with_cancel(
            &args.indicators,
            &args.countries,
            args.start_year,
            end_year,
            workers,
            cancel,
        )
        .await?;

    print_outcome(&outcome);
    synchronizer.close().await;

    Ok(())
}

fn print_outcome(outcome: &SyncOutcome) {
    for (code, dataset) in &outcome.datasets {
        let name = outcome
            .indicator_names
            .get(code)
            .map(String::as_str)
            .unwrap_or(code.as_str());
        println!("{} ({}): {} rows", name, code, dataset.len());

        for observation in dataset.iter().take(PREVIEW_ROWS) {
            let value = observation
                .value
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} {} {}",
                observation.country_code, observation.year, value
            );
        }

        if let Some(report) = outcome.reports.get(code) {
            println!("  {}", report.display_string());
        }
    }

    if outcome.cancelled {
        println!("Run was cancelled before all fetches completed");
    }

    if !outcome.failures.is_empty() {
        println!("Failed indicators:");
        for (code, failure) in &outcome.failures {
            println!("  {} [{:?}]: {}", code, failure.stage, failure.message);
        }
    }
}
