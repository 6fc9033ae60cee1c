//! Connection handling.

use crate::hub::{Hub, HubEvent};
use cowrite_core::{SiteId, SiteRegistry};
use cowrite_proto::{Message, MessageReader, MessageWriter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accept replicas on `listener` until it fails.
///
/// # Errors
///
/// Returns error if accepting a connection fails.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<SiteRegistry>,
    event_queue: usize,
) -> std::io::Result<()> {
    let (events_tx, events_rx) = mpsc::channel(event_queue);
    tokio::spawn(Hub::new().run(events_rx));

    loop {
        let (stream, addr) = listener.accept().await?;
        tracing::debug!(%addr, "Accepted connection");
        tokio::spawn(handle_connection(
            stream,
            addr,
            Arc::clone(&registry),
            events_tx.clone(),
        ));
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SiteRegistry>,
    events: mpsc::Sender<HubEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = MessageReader::new(BufReader::new(read_half));

    let username = match reader.recv().await {
        Ok(Some(Message::Join {
            username,
            client_id,
        })) => {
            tracing::debug!(%addr, %client_id, "Join received");
            username
        }
        Ok(Some(other)) => {
            tracing::warn!(%addr, kind = other.kind(), "Expected join, closing connection");
            return;
        }
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(%addr, error = %err, "Failed to read join");
            return;
        }
    };

    let site = registry.assign();
    tracing::info!(%addr, site, username = %username, "Peer joined");

    let (outbox, inbox) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, inbox, site));

    if events
        .send(HubEvent::Joined {
            site,
            username,
            outbox,
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        match reader.recv().await {
            Ok(Some(msg)) => {
                if events.send(HubEvent::Inbound { site, msg }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) if !err.is_fatal() => {
                tracing::warn!(site, error = %err, "Dropping malformed message");
            }
            Err(err) => {
                tracing::warn!(site, error = %err, "Connection failed");
                break;
            }
        }
    }

    let _ = events.send(HubEvent::Left { site }).await;
    tracing::info!(site, "Peer left");
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    site: SiteId,
) {
    let mut writer = MessageWriter::new(write_half);
    let mut batch = Vec::new();

    while let Some(msg) = inbox.recv().await {
        batch.push(msg);
        while let Ok(msg) = inbox.try_recv() {
            batch.push(msg);
        }

        if let Err(err) = writer.send_batch(&batch).await {
            tracing::warn!(site, error = %err, "Failed to write to peer");
            break;
        }
        batch.clear();
    }
}
