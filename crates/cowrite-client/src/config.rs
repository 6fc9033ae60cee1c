//! Client configuration.

use anyhow::{bail, Context, Result};
use cowrite_core::{SiteId, SENTINEL_SITE};
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Session authority URL; `None` edits offline
    pub server: Option<String>,

    /// Display name announced on join
    pub username: String,

    /// Site used when editing without a server
    pub offline_site: Option<SiteId>,

    /// Snapshot file used by `save` and `load`
    pub file: PathBuf,

    /// How often queued operation records are written to the server
    pub flush_interval: Duration,

    /// Journal configuration
    pub persistence: PersistenceConfig,
}

/// Journal configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Store type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for SQLite)
    pub db_path: PathBuf,

    /// Interval between journal snapshots
    pub snapshot_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: Some("tcp://127.0.0.1:8765".to_string()),
            username: "anonymous".to_string(),
            offline_site: None,
            file: PathBuf::from("cowrite-content.cw"),
            flush_interval: Duration::from_millis(50),
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./cowrite.db"),
                snapshot_interval: Duration::from_secs(60),
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COWRITE_SERVER`: authority URL, or `off` to edit offline
    /// - `COWRITE_USERNAME`: display name (falls back to `USER`)
    /// - `COWRITE_SITE`: site id for offline editing
    /// - `COWRITE_FILE`: snapshot file for save/load
    /// - `COWRITE_STORE`: "sqlite" or "memory"
    /// - `COWRITE_DB_PATH`: SQLite journal path
    /// - `COWRITE_FLUSH_MS`: outbound flush interval in milliseconds
    /// - `COWRITE_SNAPSHOT_SECS`: journal snapshot interval in seconds
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(server) = std::env::var("COWRITE_SERVER") {
            config.server = match server.trim() {
                "" | "off" | "none" => None,
                url => Some(url.to_string()),
            };
        }

        if let Ok(name) = std::env::var("COWRITE_USERNAME").or_else(|_| std::env::var("USER")) {
            if !name.trim().is_empty() {
                config.username = name.trim().to_string();
            }
        }

        if let Ok(site) = std::env::var("COWRITE_SITE") {
            let site: SiteId = site.parse().context("Invalid COWRITE_SITE")?;
            if site == SENTINEL_SITE {
                bail!("COWRITE_SITE must not be {SENTINEL_SITE}");
            }
            config.offline_site = Some(site);
        }

        if let Ok(file) = std::env::var("COWRITE_FILE") {
            config.file = PathBuf::from(file);
        }

        if let Ok(store_type) = std::env::var("COWRITE_STORE") {
            config.persistence.store_type = store_type;
        }

        if let Ok(db_path) = std::env::var("COWRITE_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Ok(ms) = std::env::var("COWRITE_FLUSH_MS") {
            let ms: u64 = ms.parse().context("Invalid COWRITE_FLUSH_MS")?;
            config.flush_interval = Duration::from_millis(ms.max(1));
        }

        if let Ok(secs) = std::env::var("COWRITE_SNAPSHOT_SECS") {
            let secs: u64 = secs.parse().context("Invalid COWRITE_SNAPSHOT_SECS")?;
            config.persistence.snapshot_interval = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }

    /// Name under which the journal keys this document.
    #[must_use]
    pub fn doc_name(&self) -> String {
        self.file.display().to_string()
    }
}
