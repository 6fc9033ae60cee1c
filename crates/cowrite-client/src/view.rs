//! What the redraw task shows.

use cowrite_core::SiteId;
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// A status notification for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Something happened
    Info(String),
    /// An edit or request was rejected
    Error(String),
    /// The link to the authority is gone; edits stay local
    Disconnected,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info(msg) => write!(f, "{msg}"),
            Self::Error(msg) => write!(f, "error: {msg}"),
            Self::Disconnected => write!(f, "lost connection! edits stay local"),
        }
    }
}

/// Snapshot of the session state published after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct View {
    /// Visible document content
    pub content: String,
    /// Site this replica edits as, once known
    pub site: Option<SiteId>,
    /// Whether the authority link is up
    pub connected: bool,
    /// Participants reported by the authority
    pub users: Vec<String>,
    /// Latest notification
    pub status: Option<Status>,
}

/// Render one frame.
#[must_use]
pub fn render(view: &View) -> String {
    let site = view
        .site
        .map_or_else(|| "site ?".to_string(), |site| format!("site {site}"));
    let link = if view.connected { "online" } else { "offline" };

    let mut frame = format!("--- {site} | {link}");
    if !view.users.is_empty() {
        frame.push_str(" | users: ");
        frame.push_str(&view.users.join(", "));
    }
    frame.push('\n');
    frame.push_str(&view.content);
    if !view.content.ends_with('\n') {
        frame.push('\n');
    }
    if let Some(status) = &view.status {
        frame.push_str(&format!("--- {status}\n"));
    }
    frame
}

/// Print a frame for every published view until the session ends.
///
/// # Errors
///
/// Returns error if writing to `out` fails.
pub async fn redraw_loop<W: AsyncWrite + Unpin>(
    mut view: watch::Receiver<View>,
    mut out: W,
) -> std::io::Result<()> {
    loop {
        let frame = render(&view.borrow_and_update());
        out.write_all(frame.as_bytes()).await?;
        out.flush().await?;

        if view.changed().await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_header_content_and_status() {
        let view = View {
            content: "hello".to_string(),
            site: Some(3),
            connected: true,
            users: vec!["ann".to_string(), "bo".to_string()],
            status: Some(Status::Info("bo joined".to_string())),
        };

        assert_eq!(
            render(&view),
            "--- site 3 | online | users: ann, bo\nhello\n--- bo joined\n"
        );
    }

    #[test]
    fn renders_offline_view() {
        let view = View {
            status: Some(Status::Disconnected),
            ..View::default()
        };

        assert_eq!(
            render(&view),
            "--- site ? | offline\n\n--- lost connection! edits stay local\n"
        );
    }

    #[tokio::test]
    async fn redraw_stops_with_session() {
        let (tx, rx) = watch::channel(View::default());
        let mock = tokio_test::io::Builder::new()
            .write(b"--- site ? | offline\n\n")
            .build();

        drop(tx);
        redraw_loop(rx, mock).await.unwrap();
    }
}
