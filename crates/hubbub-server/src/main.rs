//! # hubbub
//!
//! Realtime chat server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! hubbub
//!
//! # Run with environment variables
//! HUBBUB_PORT=8080 HUBBUB_HOST=0.0.0.0 HUBBUB_BASE_PATH=/chat hubbub
//! ```
//!
//! A `hubbub.toml` in the working directory, `/etc/hubbub/` or
//! `~/.config/hubbub/` takes precedence over the environment.

use anyhow::{Context, Result};
use hubbub_core::Hub;
use hubbub_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hubbub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    tracing::info!("Starting hubbub server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    let (hub, hub_task) = Hub::spawn(config.hub_config());

    // Start the server
    handlers::run_server(config, hub).await?;

    hub_task.abort();
    Ok(())
}
