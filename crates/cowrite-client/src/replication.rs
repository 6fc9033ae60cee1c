//! Link to the session authority.
//!
//! [`connect`] opens the TCP stream, announces the replica and spawns two
//! tasks: a receiver that forwards inbound messages to the session, and a
//! flusher that batches outbound messages on an interval. Either task
//! reports [`Inbound::Disconnected`] when the stream fails and then stops;
//! there is no internal retry.

use cowrite_proto::{Message, MessageReader, MessageWriter};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;
use uuid::Uuid;

/// Default authority port.
pub const DEFAULT_PORT: u16 = 8765;

const QUEUE_DEPTH: usize = 1024;

/// What the receiver hands to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A message from the authority
    Message(Message),
    /// The stream is gone; carries the reason
    Disconnected(String),
}

/// An open connection, seen from the session loop.
#[derive(Debug)]
pub struct Link {
    /// Messages and connectivity changes, in arrival order
    pub inbound: mpsc::Receiver<Inbound>,
    /// Queue drained by the flusher
    pub outbound: mpsc::Sender<Message>,
    /// The flusher task; finishes after `outbound` is dropped and drained
    pub flusher: JoinHandle<()>,
}

/// Connect to `server` and send the join message.
///
/// # Errors
///
/// Returns error if the URL is invalid, the connection cannot be opened,
/// or the join cannot be written.
pub async fn connect(
    server: &str,
    username: &str,
    client_id: Uuid,
    flush_interval: Duration,
) -> Result<Link, ReplicationError> {
    let (host, port) = parse_server_url(server)?;

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| ReplicationError::Connect(format!("{host}:{port}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| ReplicationError::Connect(e.to_string()))?;
    let (read_half, write_half) = stream.into_split();

    let mut writer = MessageWriter::new(write_half);
    writer
        .send(&Message::Join {
            username: username.to_string(),
            client_id,
        })
        .await
        .map_err(|e| ReplicationError::Send(e.to_string()))?;

    tracing::info!(%host, port, %client_id, "Connected to session authority");

    let (inbound_tx, inbound) = mpsc::channel(QUEUE_DEPTH);
    let (outbound, outbound_rx) = mpsc::channel(QUEUE_DEPTH);

    tokio::spawn(receive_loop(
        MessageReader::new(BufReader::new(read_half)),
        inbound_tx.clone(),
    ));
    let flusher = tokio::spawn(flush_loop(writer, outbound_rx, flush_interval, inbound_tx));

    Ok(Link {
        inbound,
        outbound,
        flusher,
    })
}

/// Forward every inbound message until the stream ends.
pub async fn receive_loop<R: AsyncBufRead + Unpin>(
    mut reader: MessageReader<R>,
    inbound: mpsc::Sender<Inbound>,
) {
    loop {
        match reader.recv().await {
            Ok(Some(msg)) => {
                tracing::trace!(kind = msg.kind(), "Received message");
                if inbound.send(Inbound::Message(msg)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = inbound
                    .send(Inbound::Disconnected("server closed the connection".to_string()))
                    .await;
                return;
            }
            Err(err) if !err.is_fatal() => {
                tracing::warn!(error = %err, "Dropping malformed message");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Connection failed");
                let _ = inbound.send(Inbound::Disconnected(err.to_string())).await;
                return;
            }
        }
    }
}

/// Write queued messages once per `interval`.
///
/// Drains what is left and returns once every sender is dropped.
pub async fn flush_loop<W: AsyncWrite + Unpin>(
    mut writer: MessageWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
    interval: Duration,
    status: mpsc::Sender<Inbound>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch = Vec::new();
    let mut open = true;

    while open {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    batch.push(msg);
                    continue;
                }
                None => open = false,
            },
            _ = ticker.tick() => {}
        }

        if batch.is_empty() {
            continue;
        }

        if let Err(err) = writer.send_batch(&batch).await {
            tracing::warn!(error = %err, pending = batch.len(), "Failed to flush operations");
            let _ = status.send(Inbound::Disconnected(err.to_string())).await;
            return;
        }
        tracing::debug!(count = batch.len(), "Flushed outbound messages");
        batch.clear();
    }
}

/// Parse an authority URL into host and port.
///
/// Accepts `tcp://host[:port]`, `cowrite://host[:port]` or bare
/// `host[:port]`.
///
/// # Errors
///
/// Returns [`ReplicationError::InvalidServerUrl`] for anything else.
pub fn parse_server_url(input: &str) -> Result<(String, u16), ReplicationError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| ReplicationError::InvalidServerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "cowrite" => {}
            scheme => {
                return Err(ReplicationError::InvalidServerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| ReplicationError::InvalidServerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ReplicationError::InvalidServerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => DEFAULT_PORT,
        Some(port) => port.parse().map_err(|_| {
            ReplicationError::InvalidServerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(ReplicationError::InvalidServerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors for the authority link.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicationError {
    /// Invalid server URL
    #[error("invalid server URL: {0}")]
    InvalidServerUrl(String),
    /// TCP connect failed
    #[error("connect error: {0}")]
    Connect(String),
    /// Writing to the server failed
    #[error("send error: {0}")]
    Send(String),
}
