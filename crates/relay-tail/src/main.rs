//! # relay-tail
//!
//! Subscribe to realtime channels and log everything they deliver.
//!
//! ## Usage
//!
//! ```bash
//! # Use relay.toml, /etc/relay/relay.toml or ~/.config/relay/relay.toml
//! relay-tail
//!
//! # Use a specific config file
//! relay-tail /path/to/relay.toml
//!
//! # Override settings from the environment
//! RELAY__CLIENT__URL=https://project.example.co RELAY__CLIENT__API_KEY=anon relay-tail
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tenvis_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => config::TailConfig::load_from(&path)?,
        None => config::TailConfig::load()?,
    };

    tracing::info!(
        url = %config.client.url,
        channels = config.channels.len(),
        "Starting relay-tail"
    );

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!(error = %e, "Failed to start metrics server");
        }
    }

    handlers::run(config).await
}
