//! gridpool Coordinator
//!
//! Runs the resource-manager coordinator: the single authority over the
//! node and source registries. On startup it creates the default node
//! source; on Ctrl-C it drives the multi-phase shutdown and waits for the
//! coordinator actor to finish.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gridpool_coordinator::auth::CallerId;
use gridpool_coordinator::config::Config;
use gridpool_coordinator::coordinator::Coordinator;
use gridpool_coordinator::monitoring::LogBroadcaster;
use gridpool_coordinator::selection::EmptySelector;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gridpool coordinator");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        mailbox_capacity = config.mailbox_capacity,
        ping_frequency_ms = config.default_ping_frequency_ms,
        "Configuration loaded"
    );

    // Events go to the log until an external transport is wired in; the
    // selector has nothing to offer without a scheduler attached.
    let broadcaster = Arc::new(LogBroadcaster);
    let selector = Arc::new(EmptySelector);

    let (handle, actor_ref) = Coordinator::start(&config, broadcaster, selector).await?;
    info!("Coordinator ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    if let Err(e) = handle.shutdown(CallerId::process(), false).await {
        warn!(error = %e, "Shutdown request failed");
    }

    // The actor stops itself once the last source has unregistered
    actor_ref.join().await;

    info!("Coordinator shutdown complete");
    Ok(())
}
