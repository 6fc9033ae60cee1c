//! Server configuration.

use anyhow::{Context, Result};
use std::net::SocketAddr;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to accept replicas on
    pub listen: SocketAddr,

    /// Capacity of the hub event queue
    pub event_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8765)),
            event_queue: 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COWRITE_LISTEN`: Listen address, e.g. `0.0.0.0:8765`
    /// - `COWRITE_EVENT_QUEUE`: Hub event queue capacity
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(listen) = std::env::var("COWRITE_LISTEN") {
            config.listen = listen.parse().context("Invalid COWRITE_LISTEN")?;
        }

        if let Ok(capacity) = std::env::var("COWRITE_EVENT_QUEUE") {
            let capacity: usize = capacity
                .parse()
                .context("Invalid COWRITE_EVENT_QUEUE")?;
            config.event_queue = capacity.max(1);
        }

        Ok(config)
    }
}
