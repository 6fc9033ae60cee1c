//! Session runtime.
//!
//! The [`Session`] owns the [`Document`] and is the only task that mutates
//! it. Commands from the input task, messages from the receiver and the
//! checkpoint timer are serialised through one `select!` loop; outbound
//! records are handed to the flusher queue and views to the redraw task,
//! so nothing waits on the network while the document is being edited.

use crate::config::ClientConfig;
use crate::input::Command;
use crate::persistence::SqliteStore;
use crate::replication::{Inbound, Link};
use crate::view::{Status, View};
use anyhow::{bail, Context, Result};
use cowrite_core::{codec, Document, OperationRecord, SiteAssignment, SiteId};
use cowrite_proto::Message;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// One replica's editing session.
pub struct Session {
    config: ClientConfig,
    doc_name: String,
    doc: Document,
    site: SiteAssignment,
    store: Option<SqliteStore>,
    journal_seq: i64,
    dirty: bool,
    outbound: Option<mpsc::Sender<Message>>,
    flusher: Option<JoinHandle<()>>,
    view: watch::Sender<View>,
}

impl Session {
    /// Create a session with the journal store named by `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened or restored.
    pub fn open(config: ClientConfig) -> Result<Self> {
        let store = match config.persistence.store_type.as_str() {
            "sqlite" => Some(
                SqliteStore::open(&config.persistence.db_path)
                    .context("Failed to open SQLite journal")?,
            ),
            "memory" => None,
            other => bail!("Unknown COWRITE_STORE '{other}'"),
        };
        Self::with_store(config, store)
    }

    /// Create a session over an already opened store.
    ///
    /// The document comes from the journal if it has one, else from the
    /// snapshot file if it exists, else it starts empty.
    ///
    /// # Errors
    ///
    /// Returns error if the journal holds a corrupt snapshot.
    pub fn with_store(config: ClientConfig, store: Option<SqliteStore>) -> Result<Self> {
        let doc_name = config.doc_name();
        let mut status = None;
        let mut dirty = false;

        let restored = match &store {
            Some(store) => store
                .restore(&doc_name)
                .context("Failed to restore journal")?,
            None => None,
        };
        let doc = match restored {
            Some(doc) => doc,
            None if config.file.exists() => match codec::load(&config.file) {
                Ok(doc) => {
                    tracing::info!(
                        file = %config.file.display(),
                        len = doc.len(),
                        "Loaded snapshot file"
                    );
                    dirty = true;
                    doc
                }
                Err(err) => {
                    tracing::warn!(
                        file = %config.file.display(),
                        error = %err,
                        "Ignoring snapshot file"
                    );
                    status = Some(Status::Error(format!("cannot load file: {err}")));
                    Document::new()
                }
            },
            None => Document::new(),
        };

        // With an authority the site always comes from its `SiteId`
        let mut site = SiteAssignment::unassigned();
        if let (None, Some(offline)) = (&config.server, config.offline_site) {
            site.accept(offline)?;
        }

        let journal_seq = match &store {
            Some(store) => store.last_seq(&doc_name)?,
            None => 0,
        };

        let (view, _) = watch::channel(View {
            content: doc.content(),
            site: site.get(),
            connected: false,
            users: Vec::new(),
            status,
        });

        Ok(Self {
            config,
            doc_name,
            doc,
            site,
            store,
            journal_seq,
            dirty,
            outbound: None,
            flusher: None,
            view,
        })
    }

    /// Subscribe to published views.
    #[must_use]
    pub fn view(&self) -> watch::Receiver<View> {
        self.view.subscribe()
    }

    /// The current document.
    #[must_use]
    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Run until `Quit` arrives or the command queue closes.
    ///
    /// Returns the final document.
    ///
    /// # Errors
    ///
    /// Returns error if the final checkpoint cannot be written.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        link: Option<Link>,
    ) -> Result<Document> {
        let mut inbound = match link {
            Some(link) => {
                self.outbound = Some(link.outbound);
                self.flusher = Some(link.flusher);
                Some(link.inbound)
            }
            None => None,
        };
        let connected = inbound.is_some();
        self.view.send_modify(|view| view.connected = connected);

        let period = self.config.persistence.snapshot_interval;
        let mut checkpoints = tokio::time::interval_at(Instant::now() + period, period);
        checkpoints.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            doc_name = %self.doc_name,
            len = self.doc.len(),
            connected,
            "Session started"
        );

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Quit) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                event = next_inbound(&mut inbound) => match event {
                    Some(Inbound::Message(msg)) => self.on_message(msg).await,
                    Some(Inbound::Disconnected(reason)) => {
                        inbound = None;
                        self.on_disconnect(&reason);
                    }
                    None => {
                        inbound = None;
                        self.on_disconnect("receiver stopped");
                    }
                },
                _ = checkpoints.tick() => {
                    if let Err(err) = self.checkpoint() {
                        tracing::warn!(error = %err, "Checkpoint failed");
                    }
                }
            }
        }

        self.finish().await
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Insert { index, text } => self.insert(index, &text).await,
            Command::Delete { index } => self.delete(index).await,
            Command::Save => match codec::save(&self.config.file, &self.doc) {
                Ok(()) => self.notify(Status::Info(format!(
                    "saved to {}",
                    self.config.file.display()
                ))),
                Err(err) => self.notify(Status::Error(format!("save failed: {err}"))),
            },
            Command::Load => self.load().await,
            Command::Show => self.publish(),
            Command::Quit => {}
        }
    }

    async fn insert(&mut self, index: usize, text: &str) {
        let Some(site) = self.site.get() else {
            self.notify(Status::Error("no site id yet".to_string()));
            return;
        };

        for (offset, value) in text.chars().enumerate() {
            match self.doc.local_insert(index + offset, value, site) {
                Ok((_, op)) => self.record(op, true).await,
                Err(err) => {
                    self.notify(Status::Error(err.to_string()));
                    return;
                }
            }
        }
        self.publish();
    }

    async fn delete(&mut self, index: usize) {
        match self.doc.local_delete(index) {
            Ok((_, op)) => {
                self.record(op, true).await;
                self.publish();
            }
            Err(err) => self.notify(Status::Error(err.to_string())),
        }
    }

    async fn load(&mut self) {
        let loaded = match codec::load(&self.config.file) {
            Ok(doc) => doc,
            Err(err) => {
                self.notify(Status::Error(format!("load failed: {err}")));
                return;
            }
        };

        let added = self.doc.merge(&loaded);
        self.dirty = true;
        tracing::info!(file = %self.config.file.display(), added, "Merged snapshot file");

        self.share_document(None).await;
        self.notify(Status::Info(format!(
            "loaded {}",
            self.config.file.display()
        )));
    }

    async fn on_message(&mut self, msg: Message) {
        match msg {
            Message::SiteId { site } => match self.site.accept(site) {
                Ok(()) => {
                    tracing::info!(site, "Site assigned");
                    self.view.send_modify(|view| view.site = Some(site));
                    self.notify(Status::Info(format!("editing as site {site}")));
                }
                Err(err) => tracing::warn!(site, error = %err, "Ignoring site assignment"),
            },
            Message::Joined { username } => {
                self.notify(Status::Info(format!("{username} joined")));
            }
            Message::Users { names } => {
                self.view.send_modify(|view| view.users = names);
            }
            Message::Operation { op } => match self.doc.remote_apply(&op) {
                Ok(_) => {
                    self.record(op, false).await;
                    self.publish();
                }
                Err(err) => {
                    tracing::warn!(error = %err, kind = op.kind(), "Dropping remote operation");
                    self.notify(Status::Error(format!("dropped remote edit: {err}")));
                }
            },
            Message::DocRequest { requester } => {
                tracing::debug!(requester, "Sending document to new peer");
                self.share_document(Some(requester)).await;
            }
            Message::DocSync {
                requester,
                snapshot,
            } => self.on_doc_sync(requester, &snapshot).await,
            Message::Join { .. } => {
                tracing::warn!("Ignoring join sent to a replica");
            }
        }
    }

    async fn on_doc_sync(&mut self, requester: Option<SiteId>, snapshot: &[u8]) {
        let received = match codec::decode(snapshot) {
            Ok(doc) => doc,
            Err(err) => {
                tracing::warn!(error = %err, "Dropping document snapshot");
                self.notify(Status::Error(format!("bad snapshot from peer: {err}")));
                return;
            }
        };

        let added = self.doc.merge(&received);
        self.dirty = true;
        tracing::info!(added, len = self.doc.len(), "Merged peer snapshot");

        // Edits made offline before joining reach the others this way
        if requester.is_some() && requester == self.site.get() && self.doc != received {
            self.share_document(None).await;
        }

        self.notify(Status::Info("synchronised with peers".to_string()));
    }

    fn on_disconnect(&mut self, reason: &str) {
        tracing::warn!(reason, "Disconnected from session authority");
        self.outbound = None;
        self.view.send_modify(|view| view.connected = false);
        self.notify(Status::Disconnected);
    }

    /// Journal an applied record and, for local edits, queue it for peers.
    async fn record(&mut self, op: OperationRecord, local: bool) {
        if let Some(store) = &self.store {
            match store.append_op(&self.doc_name, &op) {
                Ok(seq) => self.journal_seq = seq,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to journal operation");
                    self.notify(Status::Error(format!("journal write failed: {err}")));
                }
            }
        }

        if local {
            self.send(Message::Operation { op }).await;
        }
    }

    async fn share_document(&mut self, requester: Option<SiteId>) {
        match Message::doc_sync(requester, &self.doc) {
            Ok(msg) => self.send(msg).await,
            Err(err) => tracing::warn!(error = %err, "Failed to encode document"),
        }
    }

    async fn send(&mut self, msg: Message) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        if outbound.send(msg).await.is_err() {
            self.on_disconnect("flusher stopped");
        }
    }

    fn checkpoint(&mut self) -> Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        if !self.dirty
            && store.snapshot(&self.doc_name)?.map(|(_, seq)| seq) == Some(self.journal_seq)
        {
            return Ok(());
        }

        store
            .checkpoint(&self.doc_name, &self.doc, self.journal_seq)
            .context("Failed to write journal checkpoint")?;
        self.dirty = false;
        Ok(())
    }

    async fn finish(mut self) -> Result<Document> {
        self.checkpoint()?;

        self.outbound = None;
        if let Some(flusher) = self.flusher.take() {
            if tokio::time::timeout(FLUSH_GRACE, flusher).await.is_err() {
                tracing::warn!("Outbound queue not drained before exit");
            }
        }

        tracing::info!(len = self.doc.len(), "Session finished");
        Ok(self.doc)
    }

    fn notify(&self, status: Status) {
        self.view.send_modify(|view| view.status = Some(status));
    }

    fn publish(&self) {
        let content = self.doc.content();
        self.view.send_modify(|view| view.content = content);
    }
}

async fn next_inbound(inbound: &mut Option<mpsc::Receiver<Inbound>>) -> Option<Inbound> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
