//! The replicated character sequence.
//!
//! A [`Document`] keeps every [`CharNode`] ever inserted, sorted by
//! identifier and bounded by two sentinels. Local edits are addressed by
//! visible index and produce [`OperationRecord`]s; remote records are
//! addressed by identifier, so applying them commutes with any other
//! insert or delete and every replica converges to the same content.

use crate::ident::{self, IdentError, Identifier};
use crate::node::{CharNode, Dot};
use crate::site::{SiteId, SENTINEL_SITE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Wire-level description of a single edit, addressed by identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OperationRecord {
    /// A character was inserted
    Insert {
        /// Identifier of the new node
        id: Identifier,
        /// The inserted character
        value: char,
        /// Inserting site
        site: SiteId,
        /// Per-site insert counter
        counter: u64,
    },
    /// A character was deleted
    Delete {
        /// Identifier of the deleted node
        id: Identifier,
    },
}

impl OperationRecord {
    /// Identifier the record refers to.
    #[must_use]
    pub fn id(&self) -> &Identifier {
        match self {
            Self::Insert { id, .. } | Self::Delete { id } => id,
        }
    }

    /// Short name of the record kind, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Delete { .. } => "delete",
        }
    }
}

/// A sequence CRDT of characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Sorted by identifier; `nodes[0]` and the last node are sentinels
    nodes: Vec<CharNode>,
    /// Dots of every node held, for duplicate detection
    dots: HashSet<Dot>,
    /// Highest insert counter seen per site
    counters: BTreeMap<SiteId, u64>,
    /// Deletes that arrived before their insert
    pending_deletes: BTreeSet<Identifier>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create an empty document holding only the sentinels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![
                CharNode::sentinel(Identifier::begin()),
                CharNode::sentinel(Identifier::end()),
            ],
            dots: HashSet::new(),
            counters: BTreeMap::new(),
            pending_deletes: BTreeSet::new(),
        }
    }

    /// Rebuild a document from validated parts.
    ///
    /// `nodes` must be sorted by identifier and exclude the sentinels.
    pub(crate) fn from_parts(
        nodes: Vec<CharNode>,
        counters: BTreeMap<SiteId, u64>,
        pending_deletes: BTreeSet<Identifier>,
    ) -> Self {
        let mut doc = Self::new();
        doc.dots = nodes.iter().map(CharNode::dot).collect();
        doc.nodes.splice(1..1, nodes);
        doc.counters = counters;
        doc.pending_deletes = pending_deletes;
        doc
    }

    /// Visible content: values of non-tombstoned nodes in identifier order.
    #[must_use]
    pub fn content(&self) -> String {
        self.nodes
            .iter()
            .filter(|n| n.is_visible())
            .map(|n| n.value)
            .collect()
    }

    /// Number of visible characters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_visible()).count()
    }

    /// Check if no character is visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.nodes.iter().any(CharNode::is_visible)
    }

    /// Number of nodes held, tombstones included, sentinels excluded.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len() - 2
    }

    /// All nodes in identifier order, tombstones included, sentinels excluded.
    pub fn nodes(&self) -> impl Iterator<Item = &CharNode> {
        self.nodes[1..self.nodes.len() - 1].iter()
    }

    /// Identifiers of deleted nodes.
    pub fn tombstones(&self) -> impl Iterator<Item = &Identifier> {
        self.nodes().filter(|n| n.tombstoned).map(|n| &n.id)
    }

    /// Buffered deletes whose insert has not arrived yet.
    pub fn pending_deletes(&self) -> impl Iterator<Item = &Identifier> {
        self.pending_deletes.iter()
    }

    /// Highest insert counter seen per site.
    #[must_use]
    pub fn counters(&self) -> &BTreeMap<SiteId, u64> {
        &self.counters
    }

    /// Highest insert counter seen for `site`, or 0.
    #[must_use]
    pub fn max_counter(&self, site: SiteId) -> u64 {
        self.counters.get(&site).copied().unwrap_or(0)
    }

    /// Look up a node by identifier.
    #[must_use]
    pub fn get(&self, id: &Identifier) -> Option<&CharNode> {
        self.find(id).ok().map(|slot| &self.nodes[slot])
    }

    /// Insert `value` so that it becomes visible at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::IndexOutOfRange`] if `index > len()`, and
    /// [`DocumentError::InvalidRange`] if `site` cannot mint identifiers.
    /// The document is unchanged on error.
    pub fn local_insert(
        &mut self,
        index: usize,
        value: char,
        site: SiteId,
    ) -> Result<(String, OperationRecord), DocumentError> {
        let len = self.len();
        if index > len {
            return Err(DocumentError::IndexOutOfRange { index, len });
        }

        // Anchor on the visible predecessor and its immediate neighbour,
        // tombstone or not, so a tombstoned identifier is never minted again.
        let anchor = if index == 0 {
            0
        } else {
            self.visible_slot(index - 1)
                .ok_or(DocumentError::IndexOutOfRange { index, len })?
        };
        let id = ident::between(&self.nodes[anchor].id, &self.nodes[anchor + 1].id, site)?;
        let counter = self.max_counter(site) + 1;

        let node = CharNode::new(id.clone(), value, site, counter);
        self.dots.insert(node.dot());
        self.observe_counter(site, counter);
        self.nodes.insert(anchor + 1, node);

        tracing::debug!(index, site, counter, id = %id, "Local insert");
        Ok((
            self.content(),
            OperationRecord::Insert {
                id,
                value,
                site,
                counter,
            },
        ))
    }

    /// Delete the character visible at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::IndexOutOfRange`] if `index >= len()`.
    /// The document is unchanged on error.
    pub fn local_delete(
        &mut self,
        index: usize,
    ) -> Result<(String, OperationRecord), DocumentError> {
        let len = self.len();
        let slot = self
            .visible_slot(index)
            .ok_or(DocumentError::IndexOutOfRange { index, len })?;

        let node = &mut self.nodes[slot];
        node.tombstone();
        let id = node.id.clone();

        tracing::debug!(index, id = %id, "Local delete");
        Ok((self.content(), OperationRecord::Delete { id }))
    }

    /// Merge an operation record produced by any replica.
    ///
    /// Duplicate inserts are ignored. A delete for an unknown identifier is
    /// buffered until the matching insert arrives.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::MalformedOperation`] if the record cannot be
    /// interpreted. The document is unchanged on error.
    pub fn remote_apply(&mut self, op: &OperationRecord) -> Result<String, DocumentError> {
        match op {
            OperationRecord::Insert {
                id,
                value,
                site,
                counter,
            } => {
                validate_insert(id, *site, *counter)?;
                self.integrate(CharNode::new(id.clone(), *value, *site, *counter))?;
            }
            OperationRecord::Delete { id } => {
                if !id.is_well_formed() {
                    return Err(DocumentError::MalformedOperation(format!(
                        "delete of ill-formed identifier {id}"
                    )));
                }
                self.mark_deleted(id);
            }
        }
        Ok(self.content())
    }

    /// Merge the full state of another replica into this one.
    ///
    /// The result holds the union of both node sets and tombstones and the
    /// highest counter per site. Returns the number of nodes added.
    pub fn merge(&mut self, other: &Self) -> usize {
        let mut added = 0;
        for node in other.nodes() {
            match self.find(&node.id) {
                Ok(slot) => {
                    if node.tombstoned {
                        self.nodes[slot].tombstone();
                    }
                }
                Err(_) => match self.integrate(node.clone()) {
                    Ok(true) => added += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, id = %node.id, "Skipping node during merge");
                    }
                },
            }
        }
        for id in &other.pending_deletes {
            self.mark_deleted(id);
        }
        for (&site, &counter) in &other.counters {
            self.observe_counter(site, counter);
        }

        tracing::debug!(
            added,
            nodes = self.node_count(),
            "Merged document state"
        );
        added
    }

    /// Place a node in sorted position.
    ///
    /// Returns `false` if its dot is already held.
    fn integrate(&mut self, mut node: CharNode) -> Result<bool, DocumentError> {
        let dot = node.dot();
        if self.dots.contains(&dot) {
            tracing::debug!(%dot, "Ignoring duplicate insert");
            return Ok(false);
        }

        let slot = match self.find(&node.id) {
            Ok(_) => {
                return Err(DocumentError::MalformedOperation(format!(
                    "identifier {} already held by another insert",
                    node.id
                )));
            }
            Err(slot) => slot,
        };

        if self.pending_deletes.remove(&node.id) {
            node.tombstone();
        }

        tracing::debug!(
            %dot,
            id = %node.id,
            tombstoned = node.tombstoned,
            "Integrated insert"
        );
        self.dots.insert(dot);
        self.observe_counter(node.site, node.counter);
        self.nodes.insert(slot, node);
        Ok(true)
    }

    /// Tombstone a node, or buffer the delete if the node is unknown.
    fn mark_deleted(&mut self, id: &Identifier) {
        match self.find(id) {
            Ok(slot) => {
                let changed = self.nodes[slot].tombstone();
                tracing::debug!(id = %id, changed, "Applied delete");
            }
            Err(_) => {
                tracing::debug!(id = %id, "Buffered delete for unknown identifier");
                self.pending_deletes.insert(id.clone());
            }
        }
    }

    fn observe_counter(&mut self, site: SiteId, counter: u64) {
        let max = self.counters.entry(site).or_insert(0);
        if counter > *max {
            *max = counter;
        }
    }

    fn find(&self, id: &Identifier) -> Result<usize, usize> {
        self.nodes.binary_search_by(|n| n.id.cmp(id))
    }

    /// Slot in `nodes` of the `index`-th visible node.
    fn visible_slot(&self, index: usize) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_visible())
            .nth(index)
            .map(|(slot, _)| slot)
    }
}

/// Structural checks on a remote insert.
fn validate_insert(id: &Identifier, site: SiteId, counter: u64) -> Result<(), DocumentError> {
    if site == SENTINEL_SITE || counter == 0 {
        return Err(DocumentError::MalformedOperation(format!(
            "insert with reserved dot {site}:{counter}"
        )));
    }
    if !id.is_well_formed() || *id <= Identifier::begin() || *id >= Identifier::end() {
        return Err(DocumentError::MalformedOperation(format!(
            "insert of ill-formed identifier {id}"
        )));
    }
    if id.creator() != Some(site) {
        return Err(DocumentError::MalformedOperation(format!(
            "identifier {id} was not minted by site {site}"
        )));
    }
    Ok(())
}

/// Errors for document operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// A local edit addressed an index outside the visible content
    #[error("index {index} out of range for visible length {len}")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Visible length at the time of the request
        len: usize,
    },
    /// A remote record could not be interpreted
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    /// Identifier generation was given invalid input
    #[error(transparent)]
    InvalidRange(#[from] IdentError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::Position;

    /// Apply local edits described as `(index, Some(char))` for insert and
    /// `(index, None)` for delete, returning the produced records.
    fn edit(
        doc: &mut Document,
        site: SiteId,
        edits: &[(usize, Option<char>)],
    ) -> Vec<OperationRecord> {
        edits
            .iter()
            .map(|&(index, value)| match value {
                Some(c) => doc.local_insert(index, c, site).unwrap().1,
                None => doc.local_delete(index).unwrap().1,
            })
            .collect()
    }

    fn apply_all(doc: &mut Document, ops: &[OperationRecord]) {
        for op in ops {
            doc.remote_apply(op).unwrap();
        }
    }

    /// Small deterministic generator for shuffles.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: usize) -> usize {
            self.0 = self
                .0
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            usize::try_from(self.0 >> 33).unwrap() % bound
        }

        fn shuffle<T>(&mut self, items: &mut [T]) {
            for i in (1..items.len()).rev() {
                let j = self.next(i + 1);
                items.swap(i, j);
            }
        }
    }

    #[test]
    fn local_insert_builds_content() {
        let mut doc = Document::new();
        let (text, _) = doc.local_insert(0, 'h', 1).unwrap();
        assert_eq!(text, "h");
        let (text, _) = doc.local_insert(1, 'i', 1).unwrap();
        assert_eq!(text, "hi");
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.max_counter(1), 2);
    }

    #[test]
    fn local_insert_lands_at_index() {
        let mut doc = Document::new();
        for (i, c) in "abcdef".chars().enumerate() {
            doc.local_insert(i, c, 1).unwrap();
        }
        for index in [0, 3, 6, 2] {
            let (text, _) = doc.local_insert(index, 'x', 1).unwrap();
            assert_eq!(text.chars().nth(index), Some('x'));
        }
        assert_eq!(doc.content(), "xaxbxcdxef");
    }

    #[test]
    fn local_insert_out_of_range_leaves_state() {
        let mut doc = Document::new();
        doc.local_insert(0, 'a', 1).unwrap();
        let before = doc.clone();

        assert_eq!(
            doc.local_insert(2, 'b', 1),
            Err(DocumentError::IndexOutOfRange { index: 2, len: 1 })
        );
        assert_eq!(doc, before);
    }

    #[test]
    fn local_insert_with_reserved_site_fails() {
        let mut doc = Document::new();
        assert!(matches!(
            doc.local_insert(0, 'a', SENTINEL_SITE),
            Err(DocumentError::InvalidRange(IdentError::ReservedSite))
        ));
        assert!(doc.is_empty());
    }

    #[test]
    fn local_delete_on_empty_fails() {
        let mut doc = Document::new();
        assert_eq!(
            doc.local_delete(0),
            Err(DocumentError::IndexOutOfRange { index: 0, len: 0 })
        );
        assert_eq!(doc.content(), "");
    }

    #[test]
    fn local_delete_tombstones() {
        let mut doc = Document::new();
        edit(&mut doc, 1, &[(0, Some('a')), (1, Some('b')), (2, Some('c'))]);

        let (text, op) = doc.local_delete(1).unwrap();
        assert_eq!(text, "ac");
        assert_eq!(doc.node_count(), 3);
        assert_eq!(doc.tombstones().collect::<Vec<_>>(), vec![op.id()]);
        assert!(doc.get(op.id()).unwrap().tombstoned);
    }

    #[test]
    fn reinsert_after_delete_mints_fresh_identifier() {
        let mut doc = Document::new();
        let first = edit(&mut doc, 1, &[(0, Some('a')), (0, None)]);
        let second = edit(&mut doc, 1, &[(0, Some('b'))]);

        assert_ne!(first[0].id(), second[0].id());
        assert_eq!(doc.content(), "b");
        assert_eq!(doc.node_count(), 2);
    }

    #[test]
    fn scenario_two_sites_converge() {
        let mut site1 = Document::new();
        let ops1 = edit(&mut site1, 1, &[(0, Some('h')), (1, Some('i'))]);
        assert_eq!(site1.content(), "hi");

        let mut site2 = Document::new();
        let ops2 = edit(&mut site2, 2, &[(0, Some('!'))]);
        assert_eq!(site2.content(), "!");

        apply_all(&mut site1, &ops2);
        apply_all(&mut site2, &ops1);

        assert_eq!(site1.content(), site2.content());
        assert_eq!(site1.content(), "h!i");
    }

    #[test]
    fn remote_insert_is_idempotent() {
        let mut origin = Document::new();
        let ops = edit(&mut origin, 1, &[(0, Some('a')), (1, Some('b'))]);

        let mut replica = Document::new();
        apply_all(&mut replica, &ops);
        let once = replica.content();
        apply_all(&mut replica, &ops);

        assert_eq!(replica.content(), once);
        assert_eq!(replica.node_count(), 2);
    }

    #[test]
    fn remote_delete_is_idempotent() {
        let mut origin = Document::new();
        let mut ops = edit(&mut origin, 1, &[(0, Some('a')), (1, Some('b'))]);
        ops.extend(edit(&mut origin, 1, &[(0, None)]));

        let mut replica = Document::new();
        apply_all(&mut replica, &ops);
        apply_all(&mut replica, &ops[2..]);
        assert_eq!(replica.content(), "b");
    }

    #[test]
    fn remote_records_commute() {
        let mut a = Document::new();
        let op_a = edit(&mut a, 1, &[(0, Some('a'))]).remove(0);
        let mut b = Document::new();
        let op_b = edit(&mut b, 2, &[(0, Some('b'))]).remove(0);

        let mut ab = Document::new();
        apply_all(&mut ab, &[op_a.clone(), op_b.clone()]);
        let mut ba = Document::new();
        apply_all(&mut ba, &[op_b, op_a]);

        assert_eq!(ab.content(), ba.content());
    }

    #[test]
    fn delete_before_insert_is_buffered() {
        let mut origin = Document::new();
        let ops = edit(&mut origin, 1, &[(0, Some('a')), (1, Some('b')), (0, None)]);

        let mut replica = Document::new();
        replica.remote_apply(&ops[2]).unwrap();
        assert_eq!(replica.pending_deletes().count(), 1);
        assert_eq!(replica.content(), "");

        replica.remote_apply(&ops[1]).unwrap();
        replica.remote_apply(&ops[0]).unwrap();
        assert_eq!(replica.content(), "b");
        assert_eq!(replica.pending_deletes().count(), 0);
        assert_eq!(replica.content(), origin.content());
    }

    #[test]
    fn remote_insert_advances_counters() {
        let mut origin = Document::new();
        let ops = edit(&mut origin, 3, &[(0, Some('a')), (1, Some('b'))]);

        let mut replica = Document::new();
        apply_all(&mut replica, &ops);
        assert_eq!(replica.max_counter(3), 2);

        let (_, op) = replica.local_insert(2, 'c', 3).unwrap();
        assert!(matches!(op, OperationRecord::Insert { counter: 3, .. }));
    }

    #[test]
    fn malformed_records_are_rejected_without_mutation() {
        let mut doc = Document::new();
        doc.local_insert(0, 'a', 1).unwrap();
        let before = doc.clone();

        let minted_by_two = Identifier::new(vec![Position::new(40, 2)]);
        let cases = vec![
            OperationRecord::Insert {
                id: Identifier::new(vec![]),
                value: 'x',
                site: 2,
                counter: 1,
            },
            OperationRecord::Insert {
                id: minted_by_two.clone(),
                value: 'x',
                site: 5,
                counter: 1,
            },
            OperationRecord::Insert {
                id: minted_by_two.clone(),
                value: 'x',
                site: 2,
                counter: 0,
            },
            OperationRecord::Insert {
                id: Identifier::end(),
                value: 'x',
                site: 0,
                counter: 1,
            },
            OperationRecord::Insert {
                id: Identifier::new(vec![Position::new(crate::ident::BASE + 3, 2)]),
                value: 'x',
                site: 2,
                counter: 1,
            },
            OperationRecord::Delete {
                id: Identifier::begin(),
            },
        ];

        for op in &cases {
            assert!(
                matches!(doc.remote_apply(op), Err(DocumentError::MalformedOperation(_))),
                "accepted {op:?}"
            );
            assert_eq!(doc, before);
        }
    }

    #[test]
    fn identifier_collision_is_malformed() {
        let mut doc = Document::new();
        let (_, op) = doc.local_insert(0, 'a', 1).unwrap();
        let OperationRecord::Insert { id, .. } = op else {
            panic!("expected insert");
        };

        let clash = OperationRecord::Insert {
            id,
            value: 'z',
            site: 1,
            counter: 7,
        };
        assert!(matches!(
            doc.remote_apply(&clash),
            Err(DocumentError::MalformedOperation(_))
        ));
        assert_eq!(doc.content(), "a");
    }

    #[test]
    fn concurrent_inserts_at_same_index_do_not_interleave_by_arrival() {
        let mut base = Document::new();
        let seed = edit(&mut base, 1, &[(0, Some('[')), (1, Some(']'))]);

        let mut a = base.clone();
        let mut b = base.clone();
        let ops_a = edit(&mut a, 2, &[(1, Some('x')), (2, Some('y'))]);
        let ops_b = edit(&mut b, 3, &[(1, Some('1')), (2, Some('2'))]);

        apply_all(&mut a, &ops_b);
        apply_all(&mut b, &ops_a);

        let mut fresh = Document::new();
        let mut all = seed;
        all.extend(ops_b);
        all.extend(ops_a);
        apply_all(&mut fresh, &all);

        assert_eq!(a.content(), b.content());
        assert_eq!(a.content(), fresh.content());
        assert_eq!(a.content().len(), 6);
    }

    #[test]
    fn shuffled_delivery_converges() {
        let mut replicas: Vec<Document> = (0..3).map(|_| Document::new()).collect();
        let mut ops = Vec::new();
        let mut rng = Lcg(7);

        for round in 0..40 {
            for (i, doc) in replicas.iter_mut().enumerate() {
                let site = SiteId::try_from(i).unwrap() + 1;
                let len = doc.len();
                if len > 0 && round % 3 == 2 {
                    ops.push(doc.local_delete(rng.next(len)).unwrap().1);
                } else {
                    let c = char::from(b'a' + u8::try_from(rng.next(26)).unwrap());
                    ops.push(doc.local_insert(rng.next(len + 1), c, site).unwrap().1);
                }
            }
        }

        let mut contents = Vec::new();
        for seed in 0..5 {
            let mut order = ops.clone();
            Lcg(seed).shuffle(&mut order);
            let mut doc = Document::new();
            apply_all(&mut doc, &order);
            assert_eq!(doc.pending_deletes().count(), 0);
            contents.push(doc.content());
        }

        for doc in &mut replicas {
            apply_all(doc, &ops);
            contents.push(doc.content());
        }

        assert!(contents.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn merge_unions_state() {
        let mut a = Document::new();
        let ops_a = edit(&mut a, 1, &[(0, Some('a')), (1, Some('b'))]);

        let mut b = Document::new();
        apply_all(&mut b, &ops_a);
        edit(&mut b, 2, &[(2, Some('c')), (0, None)]);

        let mut offline = a.clone();
        edit(&mut offline, 1, &[(2, Some('!'))]);

        let added = offline.merge(&b);
        assert_eq!(added, 1);
        assert_eq!(offline.max_counter(2), 1);
        assert_eq!(offline.max_counter(1), 3);

        let mut reverse = b.clone();
        reverse.merge(&offline);
        assert_eq!(offline.content(), reverse.content());
        assert!(!offline.content().contains('a'));
    }
}
