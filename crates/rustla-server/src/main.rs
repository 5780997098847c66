//! # rustla
//!
//! Presence and channel-routing server for stream viewers.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! rustla
//!
//! # Run with a config file
//! RUSTLA_CONFIG=/path/to/rustla.toml rustla
//!
//! # Run a worker against a shared redis store
//! RUSTLA_ROLE=worker RUSTLA_STORE=redis RUSTLA_REDIS_URL=redis://127.0.0.1/ rustla
//! ```

use anyhow::Result;
use rustla_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "rustla=debug,rustla_server=debug,rustla_core=debug,rustla_relay=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!(
        role = ?config.cluster.role,
        "Starting rustla on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
