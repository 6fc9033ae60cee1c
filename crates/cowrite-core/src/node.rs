//! Character nodes held by a [`Document`](crate::Document).

use crate::ident::Identifier;
use crate::site::{SiteId, SENTINEL_SITE};
use serde::{Deserialize, Serialize};

/// Unique name of an insert: the originating site and its per-site counter.
///
/// Used to drop duplicate deliveries of the same insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dot {
    /// Originating site
    pub site: SiteId,
    /// Per-site insert counter, starting at 1
    pub counter: u64,
}

impl Dot {
    /// Create a new dot.
    #[must_use]
    pub const fn new(site: SiteId, counter: u64) -> Self {
        Self { site, counter }
    }
}

impl std::fmt::Display for Dot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.site, self.counter)
    }
}

/// One character of the replicated sequence.
///
/// Identity (`id`, `site`, `counter`) is fixed at creation. Deleting a node
/// only sets `tombstoned`; the node stays in the sequence so inserts
/// anchored next to it remain well defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharNode {
    /// Position in the sequence
    pub id: Identifier,
    /// The character
    pub value: char,
    /// Site that inserted the character
    pub site: SiteId,
    /// Insert counter of `site`
    pub counter: u64,
    /// Whether the character has been deleted
    pub tombstoned: bool,
}

impl CharNode {
    /// Create a visible node.
    #[must_use]
    pub fn new(id: Identifier, value: char, site: SiteId, counter: u64) -> Self {
        Self {
            id,
            value,
            site,
            counter,
            tombstoned: false,
        }
    }

    /// Create a begin or end sentinel.
    pub(crate) fn sentinel(id: Identifier) -> Self {
        Self {
            id,
            value: '\0',
            site: SENTINEL_SITE,
            counter: 0,
            tombstoned: false,
        }
    }

    /// Whether this node is one of the document bounds.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.site == SENTINEL_SITE
    }

    /// Whether this node contributes to the visible content.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        !self.tombstoned && !self.is_sentinel()
    }

    /// The dedup key of this node.
    #[must_use]
    pub fn dot(&self) -> Dot {
        Dot::new(self.site, self.counter)
    }

    /// Mark the node deleted.
    ///
    /// Returns `true` if the node was visible before.
    pub fn tombstone(&mut self) -> bool {
        let was_visible = !self.tombstoned;
        self.tombstoned = true;
        was_visible
    }
}
