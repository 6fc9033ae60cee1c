//! # cowrite Server
//!
//! Accepts replicas, assigns site ids, and relays edits between them.

use anyhow::{Context, Result};
use cowrite_core::SiteRegistry;
use cowrite_server::{serve, ServerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting cowrite server"
    );

    let config = ServerConfig::from_env()?;
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    tracing::info!(addr = %listener.local_addr()?, "Listening for replicas");

    tokio::select! {
        result = serve(listener, Arc::new(SiteRegistry::new()), config.event_queue) => {
            result.context("Accept loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}
