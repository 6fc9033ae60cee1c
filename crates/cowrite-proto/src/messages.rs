//! Protocol messages for a collaborative session.

use cowrite_core::{codec, Document, OperationRecord, SiteId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message exchanged between a replica and the session authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// Replica -> authority: first message on a new connection
    Join {
        /// Display name
        username: String,
        /// Random id of the client process, for logs
        client_id: Uuid,
    },
    /// Authority -> replica: the site id to mint identifiers with
    SiteId {
        /// Assigned site
        site: SiteId,
    },
    /// Authority -> replicas: someone joined
    Joined {
        /// Display name of the new participant
        username: String,
    },
    /// Authority -> replicas: current participants
    Users {
        /// Display names
        names: Vec<String>,
    },
    /// An edit produced by one replica, relayed to the others
    Operation {
        /// The edit
        op: OperationRecord,
    },
    /// Authority -> replica: send your document for `requester`
    DocRequest {
        /// Site waiting for the snapshot
        requester: SiteId,
    },
    /// A full document snapshot
    DocSync {
        /// Site the snapshot is meant for; `None` broadcasts it
        requester: Option<SiteId>,
        /// Snapshot codec bytes
        #[serde(with = "snapshot_base64")]
        snapshot: Vec<u8>,
    },
}

impl Message {
    /// Build a `DocSync` carrying a snapshot of `doc`.
    ///
    /// # Errors
    ///
    /// Returns error if the document cannot be encoded.
    pub fn doc_sync(requester: Option<SiteId>, doc: &Document) -> Result<Self, MessageError> {
        let snapshot = codec::encode(doc).map_err(|e| MessageError::Snapshot(e.to_string()))?;
        Ok(Self::DocSync {
            requester,
            snapshot,
        })
    }

    /// Short name of the message type, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::SiteId { .. } => "siteId",
            Self::Joined { .. } => "joined",
            Self::Users { .. } => "users",
            Self::Operation { .. } => "operation",
            Self::DocRequest { .. } => "docRequest",
            Self::DocSync { .. } => "docSync",
        }
    }

    /// Serialize to a JSON line, newline included.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json_line(&self) -> Result<String, MessageError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Deserialize from one JSON object.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        serde_json::from_str(text).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

mod snapshot_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Snapshot encoding failed
    #[error("snapshot encoding failed: {0}")]
    Snapshot(String),
}
