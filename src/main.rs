//! netsensor - edge network experience sensor
//!
//! Runs scheduled connectivity and service probes across the configured
//! networks, records every result and serves live gauges for scraping.

mod config;
mod daemon;
mod location;
mod metrics;
mod probe;
mod scheduler;
mod sink;
mod web;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the sensor configuration file
    #[arg(short, long, env = "NETSENSOR_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Write the raw event log here instead of the configured path
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netsensor=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();

    if args.validate {
        return match config::Config::load(&args.config) {
            Ok(cfg) => {
                tracing::info!(
                    "Configuration OK: {} networks, {} services",
                    cfg.networks.len(),
                    cfg.services.len()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    let options = daemon::RunOptions {
        config_path: args.config,
        log_path: args.log_path,
    };
    match daemon::run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}
