//! Message routing between connected replicas.

use cowrite_core::SiteId;
use cowrite_proto::Message;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Events fed to the hub by connection tasks.
#[derive(Debug)]
pub enum HubEvent {
    /// A replica completed its join and was assigned `site`
    Joined {
        /// Assigned site
        site: SiteId,
        /// Display name
        username: String,
        /// Queue drained by the connection's writer task
        outbox: mpsc::UnboundedSender<Message>,
    },
    /// A message arrived from `site`
    Inbound {
        /// Sending site
        site: SiteId,
        /// The message
        msg: Message,
    },
    /// The connection of `site` closed
    Left {
        /// Departed site
        site: SiteId,
    },
}

#[derive(Debug)]
struct Peer {
    username: String,
    outbox: mpsc::UnboundedSender<Message>,
}

/// Single owner of the peer table.
///
/// All routing decisions happen on one task, so messages from one site are
/// relayed in the order they arrived.
#[derive(Debug, Default)]
pub struct Hub {
    peers: BTreeMap<SiteId, Peer>,
    /// Unanswered snapshot requests, requester to donor
    pending_sync: BTreeMap<SiteId, SiteId>,
}

impl Hub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process events until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        tracing::info!("Hub stopped");
    }

    /// Apply one event.
    pub fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Joined {
                site,
                username,
                outbox,
            } => self.on_joined(site, username, outbox),
            HubEvent::Inbound { site, msg } => self.on_inbound(site, msg),
            HubEvent::Left { site } => self.on_left(site),
        }
    }

    /// Number of connected peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if no peer is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn on_joined(
        &mut self,
        site: SiteId,
        username: String,
        outbox: mpsc::UnboundedSender<Message>,
    ) {
        let _ = outbox.send(Message::SiteId { site });
        self.peers.insert(
            site,
            Peer {
                username: username.clone(),
                outbox,
            },
        );
        self.request_document(site);
        self.broadcast(None, &Message::Joined { username });
        self.broadcast(None, &self.users_message());
    }

    fn on_left(&mut self, site: SiteId) {
        let Some(peer) = self.peers.remove(&site) else {
            return;
        };
        tracing::info!(site, username = %peer.username, "Peer removed");

        self.pending_sync.remove(&site);
        let orphaned: Vec<SiteId> = self
            .pending_sync
            .iter()
            .filter(|&(_, &donor)| donor == site)
            .map(|(&requester, _)| requester)
            .collect();
        for requester in orphaned {
            self.pending_sync.remove(&requester);
            self.request_document(requester);
        }

        self.broadcast(None, &self.users_message());
    }

    /// Ask the longest-connected other peer for a snapshot on behalf of
    /// `requester`.
    fn request_document(&mut self, requester: SiteId) {
        let Some((&donor, peer)) = self.peers.iter().find(|&(&site, _)| site != requester) else {
            return;
        };
        tracing::debug!(donor, requester, "Requesting document for new peer");
        if peer.outbox.send(Message::DocRequest { requester }).is_ok() {
            self.pending_sync.insert(requester, donor);
        }
    }

    fn on_inbound(&mut self, site: SiteId, msg: Message) {
        match msg {
            Message::Operation { .. } => self.broadcast(Some(site), &msg),
            Message::DocSync {
                requester: Some(requester),
                ..
            } => {
                self.pending_sync.remove(&requester);
                if !self.send(requester, msg) {
                    tracing::debug!(site, requester, "Snapshot requester is gone");
                }
            }
            Message::DocSync { requester: None, .. } => self.broadcast(Some(site), &msg),
            other => {
                tracing::warn!(site, kind = other.kind(), "Ignoring unexpected message from peer");
            }
        }
    }

    fn send(&self, site: SiteId, msg: Message) -> bool {
        self.peers
            .get(&site)
            .is_some_and(|peer| peer.outbox.send(msg).is_ok())
    }

    fn broadcast(&self, except: Option<SiteId>, msg: &Message) {
        for (&site, peer) in &self.peers {
            if Some(site) == except {
                continue;
            }
            if peer.outbox.send(msg.clone()).is_err() {
                tracing::debug!(site, "Outbox closed, peer is leaving");
            }
        }
    }

    fn users_message(&self) -> Message {
        Message::Users {
            names: self.peers.values().map(|p| p.username.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::Document;

    fn join(hub: &mut Hub, site: SiteId, name: &str) -> mpsc::UnboundedReceiver<Message> {
        let (outbox, inbox) = mpsc::unbounded_channel();
        hub.handle(HubEvent::Joined {
            site,
            username: name.to_string(),
            outbox,
        });
        inbox
    }

    fn drain(inbox: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = inbox.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn first_peer_gets_site_and_presence() {
        let mut hub = Hub::new();
        let mut ann = join(&mut hub, 1, "ann");

        assert_eq!(
            drain(&mut ann),
            vec![
                Message::SiteId { site: 1 },
                Message::Joined {
                    username: "ann".to_string()
                },
                Message::Users {
                    names: vec!["ann".to_string()]
                },
            ]
        );
    }

    #[test]
    fn second_peer_triggers_doc_request_to_first() {
        let mut hub = Hub::new();
        let mut ann = join(&mut hub, 1, "ann");
        drain(&mut ann);
        let mut bo = join(&mut hub, 2, "bo");

        let to_ann = drain(&mut ann);
        assert_eq!(to_ann[0], Message::DocRequest { requester: 2 });
        assert!(to_ann.contains(&Message::Users {
            names: vec!["ann".to_string(), "bo".to_string()]
        }));
        assert_eq!(drain(&mut bo)[0], Message::SiteId { site: 2 });
    }

    #[test]
    fn operations_are_relayed_to_others_only() {
        let mut hub = Hub::new();
        let mut ann = join(&mut hub, 1, "ann");
        let mut bo = join(&mut hub, 2, "bo");
        drain(&mut ann);
        drain(&mut bo);

        let mut doc = Document::new();
        let (_, op) = doc.local_insert(0, 'x', 1).unwrap();
        let msg = Message::Operation { op };
        hub.handle(HubEvent::Inbound {
            site: 1,
            msg: msg.clone(),
        });

        assert!(drain(&mut ann).is_empty());
        assert_eq!(drain(&mut bo), vec![msg]);
    }

    #[test]
    fn doc_sync_goes_to_requester() {
        let mut hub = Hub::new();
        let mut ann = join(&mut hub, 1, "ann");
        let mut bo = join(&mut hub, 2, "bo");
        let mut cy = join(&mut hub, 3, "cy");
        drain(&mut ann);
        drain(&mut bo);
        drain(&mut cy);

        let sync = Message::doc_sync(Some(3), &Document::new()).unwrap();
        hub.handle(HubEvent::Inbound {
            site: 1,
            msg: sync.clone(),
        });

        assert!(drain(&mut bo).is_empty());
        assert_eq!(drain(&mut cy), vec![sync]);
    }

    #[test]
    fn doc_request_moves_on_when_donor_leaves() {
        let mut hub = Hub::new();
        let mut ann = join(&mut hub, 1, "ann");
        let mut bo = join(&mut hub, 2, "bo");
        let mut cy = join(&mut hub, 3, "cy");
        drain(&mut ann);
        drain(&mut bo);
        drain(&mut cy);

        // ann was asked for cy's snapshot and leaves without answering
        hub.handle(HubEvent::Left { site: 1 });
        let to_bo = drain(&mut bo);
        assert!(to_bo.contains(&Message::DocRequest { requester: 3 }));

        // Once bo answers, a later departure does not ask again
        let sync = Message::doc_sync(Some(3), &Document::new()).unwrap();
        hub.handle(HubEvent::Inbound {
            site: 2,
            msg: sync.clone(),
        });
        assert_eq!(drain(&mut cy), vec![sync]);
        let _dan = join(&mut hub, 4, "dan");
        drain(&mut bo);
        drain(&mut cy);
        hub.handle(HubEvent::Left { site: 2 });
        assert!(!drain(&mut cy).contains(&Message::DocRequest { requester: 3 }));
    }

    #[test]
    fn departed_requester_is_forgotten() {
        let mut hub = Hub::new();
        let mut ann = join(&mut hub, 1, "ann");
        let mut bo = join(&mut hub, 2, "bo");
        let _cy = join(&mut hub, 3, "cy");
        hub.handle(HubEvent::Left { site: 3 });
        drain(&mut ann);
        drain(&mut bo);

        hub.handle(HubEvent::Left { site: 1 });
        assert!(!drain(&mut bo)
            .iter()
            .any(|msg| matches!(msg, Message::DocRequest { .. })));
    }

    #[test]
    fn leaving_updates_users() {
        let mut hub = Hub::new();
        let mut ann = join(&mut hub, 1, "ann");
        let _bo = join(&mut hub, 2, "bo");
        drain(&mut ann);

        hub.handle(HubEvent::Left { site: 2 });
        assert_eq!(hub.len(), 1);
        assert_eq!(
            drain(&mut ann),
            vec![Message::Users {
                names: vec!["ann".to_string()]
            }]
        );
    }
}
