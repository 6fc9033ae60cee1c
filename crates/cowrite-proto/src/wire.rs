//! Newline-delimited JSON framing over tokio streams.

use crate::messages::{Message, MessageError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one [`Message`] per line.
pub struct MessageReader<R> {
    inner: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    /// Wrap a buffered reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
        }
    }

    /// Read the next message.
    ///
    /// Blank lines are skipped. Returns `Ok(None)` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Decode`] for a line that is not a valid message
    /// and [`WireError::NotUtf8`] for a line that is not text; in both cases
    /// the stream stays usable and the next call reads the following line.
    /// Returns [`WireError::Io`] if the underlying read fails.
    pub async fn recv(&mut self) -> Result<Option<Message>, WireError> {
        loop {
            self.line.clear();
            let read = match self.inner.read_line(&mut self.line).await {
                Ok(read) => read,
                // The line is already consumed, so the next read starts after it
                Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                    return Err(WireError::NotUtf8(err));
                }
                Err(err) => return Err(err.into()),
            };
            if read == 0 {
                return Ok(None);
            }

            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }

            return Message::from_json(text).map(Some).map_err(WireError::Decode);
        }
    }
}

/// Writes one [`Message`] per line.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write and flush a single message.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the write fails.
    pub async fn send(&mut self, msg: &Message) -> Result<(), WireError> {
        self.send_batch(std::slice::from_ref(msg)).await
    }

    /// Write several messages and flush once.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the write fails.
    pub async fn send_batch(&mut self, msgs: &[Message]) -> Result<(), WireError> {
        let mut buf = String::new();
        for msg in msgs {
            buf.push_str(&msg.to_json_line().map_err(WireError::Encode)?);
        }
        self.inner.write_all(buf.as_bytes()).await?;
        self.inner.flush().await?;
        tracing::trace!(count = msgs.len(), bytes = buf.len(), "Wrote messages");
        Ok(())
    }
}

/// Errors for message framing.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Underlying stream failed
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
    /// A line was not valid UTF-8
    #[error("line is not text: {0}")]
    NotUtf8(std::io::Error),
    /// A line did not decode into a message
    #[error("bad message: {0}")]
    Decode(MessageError),
    /// A message could not be encoded
    #[error("cannot encode message: {0}")]
    Encode(MessageError),
}

impl WireError {
    /// Whether the stream must be abandoned after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
