//! cowrite client binary.
//!
//! Usage: `cowrite [FILE]`; see [`ClientConfig::from_env`] for settings.

use anyhow::Result;
use cowrite_client::{connect, input_loop, redraw_loop, ClientConfig, Command, Session};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr, stdout shows the document
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting cowrite client");

    let mut config = ClientConfig::from_env()?;
    if let Some(file) = std::env::args().nth(1) {
        config.file = file.into();
    }

    let client_id = Uuid::new_v4();
    let link = match config.server.clone() {
        Some(server) => {
            match connect(&server, &config.username, client_id, config.flush_interval).await {
                Ok(link) => Some(link),
                Err(err) => {
                    tracing::warn!(error = %err, "Editing offline");
                    config.server = None;
                    None
                }
            }
        }
        None => None,
    };

    let session = Session::open(config)?;

    let (commands, command_rx) = mpsc::channel(64);
    tokio::spawn(input_loop(BufReader::new(tokio::io::stdin()), commands.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = commands.send(Command::Quit).await;
        }
    });
    let redraw = tokio::spawn(redraw_loop(session.view(), tokio::io::stdout()));

    let doc = session.run(command_rx, link).await?;
    redraw.await??;

    tracing::info!(len = doc.len(), "Client stopped");
    Ok(())
}
