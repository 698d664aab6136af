//! # Canopy Server
//!
//! Publish/subscribe broker with hierarchical channels.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! canopy
//!
//! # Run with custom config
//! canopy --config /path/to/canopy.toml
//! CANOPY_CONFIG=~/canopy.toml canopy
//!
//! # Run with environment variables
//! CANOPY_PORT=7400 CANOPY_HOST=0.0.0.0 CANOPY_ROUTER__SWEEP_INTERVAL_MS=0 canopy
//! ```

mod config;
mod handlers;
mod metrics;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Canopy publish/subscribe broker.
#[derive(Debug, Parser)]
#[command(name = "canopy", version, about)]
struct Cli {
    /// Path to a TOML config file; `~` is expanded.
    #[arg(short, long, env = "CANOPY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "canopy_server=debug,canopy_core=info,canopy_transport=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let cli = Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?;

    tracing::info!("Starting Canopy broker on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
