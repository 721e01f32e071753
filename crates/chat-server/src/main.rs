//! # Pulse Chat Server
//!
//! Realtime channel messaging over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! pulse-chat
//!
//! # Run with custom config
//! pulse-chat --config /path/to/pulse-chat.toml
//!
//! # Print the effective configuration and exit
//! pulse-chat --print-config
//!
//! # Override individual settings
//! PULSE_CHAT__PORT=8080 PULSE_CHAT__HUB__OUTBOUND_CAPACITY=512 pulse-chat
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Path given with `--config`, if any.
fn config_path() -> Option<PathBuf> {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_chat=debug,pulse_chat_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load(config_path().as_deref())?;

    if std::env::args().any(|arg| arg == "--print-config") {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!("Starting Pulse Chat server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    let state = Arc::new(handlers::AppState::open(config).await?);

    // Background delivery sweep
    let sweep = tokio::spawn(
        Arc::clone(state.service.delivery()).run_sweep_loop(state.shutdown.child_token()),
    );

    // Start the server
    let result = handlers::run_server(Arc::clone(&state)).await;

    state.shutdown.cancel();
    if let Err(e) = sweep.await {
        tracing::warn!("Delivery sweep task failed: {}", e);
    }

    result
}
