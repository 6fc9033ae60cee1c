//! Site numbering.
//!
//! The designated authority hands every connecting replica a fresh site id
//! from a [`SiteRegistry`]; the replica keeps it in a [`SiteAssignment`]
//! for the rest of the session.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Integer naming one replica.
pub type SiteId = u64;

/// Site reserved for the begin/end sentinels. Never assigned to a replica.
pub const SENTINEL_SITE: SiteId = 0;

/// Authority-side allocator of site ids.
///
/// Ids start at 1, strictly increase, and are never reused.
#[derive(Debug)]
pub struct SiteRegistry {
    next: AtomicU64,
}

impl Default for SiteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SiteRegistry {
    /// Create a registry that starts handing out ids at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(SENTINEL_SITE + 1),
        }
    }

    /// Assign the next site id.
    pub fn assign(&self) -> SiteId {
        let site = self.next.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(site, "Assigned site id");
        site
    }

    /// Number of ids handed out so far.
    #[must_use]
    pub fn assigned(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

/// Replica-side record of the site id received from the authority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteAssignment {
    site: Option<SiteId>,
}

impl SiteAssignment {
    /// An assignment that has not received its id yet.
    #[must_use]
    pub fn unassigned() -> Self {
        Self { site: None }
    }

    /// The assigned id, if any.
    #[must_use]
    pub fn get(&self) -> Option<SiteId> {
        self.site
    }

    /// Accept the id sent by the authority.
    ///
    /// Re-accepting the same id is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the id is the sentinel site or differs from an id
    /// already accepted.
    pub fn accept(&mut self, site: SiteId) -> Result<(), SiteError> {
        if site == SENTINEL_SITE {
            return Err(SiteError::Reserved);
        }
        match self.site {
            None => {
                self.site = Some(site);
                Ok(())
            }
            Some(current) if current == site => Ok(()),
            Some(current) => Err(SiteError::AlreadyAssigned {
                current,
                offered: site,
            }),
        }
    }
}

/// Errors for site assignment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SiteError {
    /// The authority offered the sentinel site
    #[error("site 0 is reserved for sentinels")]
    Reserved,
    /// A different id was already accepted for this session
    #[error("site already assigned: have {current}, offered {offered}")]
    AlreadyAssigned {
        /// Id accepted earlier
        current: SiteId,
        /// Id offered now
        offered: SiteId,
    },
}
