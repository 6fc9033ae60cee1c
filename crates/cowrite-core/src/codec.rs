//! Snapshot codec for documents.
//!
//! A snapshot is the full node set (tombstones included), the highest
//! counter seen per site, and any buffered deletes, encoded as CBOR. The
//! same bytes bootstrap a joining replica and back the save/load file.

use crate::document::Document;
use crate::ident::Identifier;
use crate::node::{CharNode, Dot};
use crate::site::SiteId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    nodes: Vec<CharNode>,
    counters: Vec<(SiteId, u64)>,
    pending_deletes: Vec<Identifier>,
}

/// Encode a document to snapshot bytes.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn encode(doc: &Document) -> Result<Vec<u8>, CodecError> {
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        nodes: doc.nodes().cloned().collect(),
        counters: doc.counters().iter().map(|(&s, &c)| (s, c)).collect(),
        pending_deletes: doc.pending_deletes().cloned().collect(),
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&snapshot, &mut bytes)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    tracing::debug!(
        nodes = snapshot.nodes.len(),
        bytes = bytes.len(),
        "Encoded snapshot"
    );
    Ok(bytes)
}

/// Decode and validate snapshot bytes into a new document.
///
/// Nothing is built unless the whole snapshot validates.
///
/// # Errors
///
/// Returns [`CodecError::CorruptState`] if the bytes do not parse or the
/// node list is not well formed.
pub fn decode(bytes: &[u8]) -> Result<Document, CodecError> {
    let snapshot: Snapshot =
        ciborium::from_reader(bytes).map_err(|e| CodecError::CorruptState(e.to_string()))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(CodecError::CorruptState(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }

    let mut counters = BTreeMap::new();
    for (site, counter) in snapshot.counters {
        if counters.insert(site, counter).is_some() {
            return Err(CodecError::CorruptState(format!(
                "counter for site {site} recorded twice"
            )));
        }
    }

    let begin = Identifier::begin();
    let end = Identifier::end();
    let mut dots = HashSet::with_capacity(snapshot.nodes.len());
    let mut previous: Option<&Identifier> = None;

    for node in &snapshot.nodes {
        if !node.id.is_well_formed() || node.id <= begin || node.id >= end {
            return Err(CodecError::CorruptState(format!(
                "ill-formed identifier {}",
                node.id
            )));
        }
        if node.id.creator() != Some(node.site) || node.counter == 0 {
            return Err(CodecError::CorruptState(format!(
                "node {} carries inconsistent dot {}",
                node.id,
                node.dot()
            )));
        }
        if let Some(prev) = previous {
            if *prev >= node.id {
                return Err(CodecError::CorruptState(format!(
                    "identifiers out of order or duplicated at {}",
                    node.id
                )));
            }
        }
        if !dots.insert(Dot::new(node.site, node.counter)) {
            return Err(CodecError::CorruptState(format!(
                "duplicate dot {}",
                node.dot()
            )));
        }
        let max = counters.get(&node.site).copied().unwrap_or(0);
        if node.counter > max {
            return Err(CodecError::CorruptState(format!(
                "counter {} of site {} exceeds recorded maximum {max}",
                node.counter, node.site
            )));
        }
        previous = Some(&node.id);
    }

    let mut pending = BTreeSet::new();
    for id in snapshot.pending_deletes {
        if !id.is_well_formed() {
            return Err(CodecError::CorruptState(format!(
                "ill-formed pending delete {id}"
            )));
        }
        // A delete is only buffered while its target has not arrived
        if snapshot
            .nodes
            .binary_search_by(|node| node.id.cmp(&id))
            .is_ok()
        {
            return Err(CodecError::CorruptState(format!(
                "pending delete {id} targets a present node"
            )));
        }
        pending.insert(id);
    }

    let doc = Document::from_parts(snapshot.nodes, counters, pending);
    tracing::debug!(nodes = doc.node_count(), "Decoded snapshot");
    Ok(doc)
}

/// Write a document snapshot to `path`.
///
/// The bytes go to a sibling temporary file first and are renamed into
/// place, so a crash never leaves a half-written snapshot behind.
///
/// # Errors
///
/// Returns error if encoding or any file operation fails.
pub fn save(path: &Path, doc: &Document) -> Result<(), CodecError> {
    let bytes = encode(doc)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "Saved document");
    Ok(())
}

/// Read a document snapshot from `path`.
///
/// # Errors
///
/// Returns error if the file cannot be read or does not decode.
pub fn load(path: &Path) -> Result<Document, CodecError> {
    let bytes = std::fs::read(path)?;
    let doc = decode(&bytes)?;
    tracing::info!(path = %path.display(), nodes = doc.node_count(), "Loaded document");
    Ok(doc)
}

/// Errors for snapshot encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed
    #[error("snapshot encoding failed: {0}")]
    Encode(String),
    /// Bytes did not decode into a well-formed document
    #[error("corrupt snapshot: {0}")]
    CorruptState(String),
    /// Snapshot file could not be read or written
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
