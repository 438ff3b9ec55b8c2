//! Daybook sync relay.
//!
//! Usage: `daybook-server [config.json]`. Without an argument the config
//! path is taken from `DAYBOOK_CONFIG`, and `DAYBOOK_BIND`, `DAYBOOK_PORT`
//! and `DAYBOOK_JWT_SECRET` override individual settings.

use anyhow::Context;
use relay::{Relay, RelayConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = RelayConfig::load(config_path.as_deref()).context("Failed to load relay configuration")?;

    tracing::info!(
        "Starting daybook relay (ping every {}s, {} client groups)",
        config.ping_interval_secs,
        config.client_groups.len()
    );

    let relay = Relay::new(config);
    let shutdown = relay.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => shutdown.shutdown(),
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    relay.run().await?;
    Ok(())
}
