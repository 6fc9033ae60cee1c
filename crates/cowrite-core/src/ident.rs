//! Dense position identifiers for the sequence CRDT.
//!
//! An [`Identifier`] is a path of [`Position`]s compared lexicographically:
//! - Each position holds a digit in `[0, BASE)` and the site that minted it
//! - Positions order by digit first, then by site (lower site first)
//! - A proper prefix sorts before any of its extensions
//!
//! Between any two distinct identifiers a new one can always be minted,
//! descending to a deeper level when a level has no free digit left.

use crate::site::{SiteId, SENTINEL_SITE};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Exclusive upper bound of the digit space at every level.
pub const BASE: u32 = 1 << 16;

/// Largest step taken away from the lower neighbour when minting a digit.
///
/// Small steps leave room to the right, which is where typing happens.
pub const BOUNDARY: u32 = 10;

/// One level of an identifier path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Digit at this level
    pub digit: u32,
    /// Site that minted the digit
    pub site: SiteId,
}

impl Position {
    /// Smallest possible position, used to pad a shorter lower bound.
    pub const MIN: Self = Self {
        digit: 0,
        site: SENTINEL_SITE,
    };

    /// Create a new position.
    #[must_use]
    pub const fn new(digit: u32, site: SiteId) -> Self {
        Self { digit, site }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.digit.cmp(&other.digit) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // Same digit minted independently: the site breaks the tie
        self.site.cmp(&other.site)
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A totally ordered, densifiable position token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Vec<Position>);

impl Identifier {
    /// Create an identifier from raw positions.
    #[must_use]
    pub fn new(positions: Vec<Position>) -> Self {
        Self(positions)
    }

    /// The begin sentinel, below every minted identifier.
    #[must_use]
    pub fn begin() -> Self {
        Self(vec![Position::new(0, SENTINEL_SITE)])
    }

    /// The end sentinel, above every minted identifier.
    #[must_use]
    pub fn end() -> Self {
        Self(vec![Position::new(BASE, SENTINEL_SITE)])
    }

    /// The positions making up this identifier.
    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.0
    }

    /// Number of levels.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// The site that minted this identifier (the site of its last position).
    #[must_use]
    pub fn creator(&self) -> Option<SiteId> {
        self.0.last().map(|p| p.site)
    }

    /// Check the structure expected of an identifier held by a real node.
    ///
    /// Rejects empty paths, out-of-range digits, and a reserved creator site.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.iter().all(|p| p.digit < BASE)
            && self.creator() != Some(SENTINEL_SITE)
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}@{}", p.digit, p.site)?;
        }
        Ok(())
    }
}

/// Mint an identifier strictly between `low` and `high`, tagged with `site`.
///
/// Walks both paths level by level. At the first level with a digit gap of
/// at least two the new digit is placed inside the gap and the path ends
/// there. Otherwise the lower bound's position is copied and the walk
/// descends; once the copied prefix drops below `high` the upper bound of
/// every deeper level is [`BASE`].
///
/// # Errors
///
/// Returns [`IdentError::InvalidRange`] if `low >= high`, and
/// [`IdentError::ReservedSite`] if `site` is the sentinel site.
pub fn between(
    low: &Identifier,
    high: &Identifier,
    site: SiteId,
) -> Result<Identifier, IdentError> {
    if low >= high {
        return Err(IdentError::InvalidRange {
            low: low.to_string(),
            high: high.to_string(),
        });
    }
    if site == SENTINEL_SITE {
        return Err(IdentError::ReservedSite);
    }

    let mut path = Vec::with_capacity(low.depth() + 1);
    // True while `path` equals the prefix of `high` of the same length
    let mut bounded = true;
    let mut depth = 0;

    loop {
        let lo = low.0.get(depth).copied().unwrap_or(Position::MIN);
        let hi_digit = if bounded {
            high.0.get(depth).map_or(BASE, |p| p.digit)
        } else {
            BASE
        };

        let gap = u64::from(hi_digit).saturating_sub(u64::from(lo.digit));
        if gap >= 2 {
            let step = (gap / 2).min(u64::from(BOUNDARY));
            let step = u32::try_from(step).unwrap_or(BOUNDARY);
            path.push(Position::new(lo.digit + step, site));
            return Ok(Identifier(path));
        }

        if bounded {
            bounded = high.0.get(depth) == Some(&lo);
        }
        path.push(lo);
        depth += 1;
    }
}

/// Errors that can occur while minting identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentError {
    /// Bounds are not strictly ordered
    #[error("invalid identifier range: {low} is not below {high}")]
    InvalidRange {
        /// Lower bound as rendered text
        low: String,
        /// Upper bound as rendered text
        high: String,
    },
    /// The sentinel site cannot mint identifiers
    #[error("site 0 is reserved for sentinels")]
    ReservedSite,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(pairs: &[(u32, SiteId)]) -> Identifier {
        Identifier::new(pairs.iter().map(|&(d, s)| Position::new(d, s)).collect())
    }

    #[test]
    fn ordering_is_lexicographic_with_site_tiebreak() {
        assert!(id(&[(5, 1)]) < id(&[(6, 1)]));
        assert!(id(&[(5, 1)]) < id(&[(5, 2)]));
        assert!(id(&[(5, 2)]) < id(&[(6, 1)]));
        // Prefix sorts first
        assert!(id(&[(5, 1)]) < id(&[(5, 1), (0, 1)]));
        assert!(id(&[(5, 1), (9, 3)]) < id(&[(5, 2)]));
    }

    #[test]
    fn sentinels_bound_minted_identifiers() {
        let minted = between(&Identifier::begin(), &Identifier::end(), 1).unwrap();
        assert!(Identifier::begin() < minted);
        assert!(minted < Identifier::end());
        assert!(minted.is_well_formed());
        assert_eq!(minted.creator(), Some(1));
        assert!(!Identifier::end().is_well_formed());
        assert!(!Identifier::begin().is_well_formed());
    }

    #[test]
    fn between_uses_gap_at_first_level() {
        let minted = between(&id(&[(10, 1)]), &id(&[(20, 1)]), 3).unwrap();
        assert_eq!(minted, id(&[(15, 3)]));
    }

    #[test]
    fn between_adjacent_digits_descends() {
        let low = id(&[(5, 1)]);
        let high = id(&[(6, 1)]);
        let minted = between(&low, &high, 2).unwrap();
        assert_eq!(minted.depth(), 2);
        assert!(low < minted && minted < high);
    }

    #[test]
    fn between_same_digit_different_sites() {
        let low = id(&[(5, 1)]);
        let high = id(&[(5, 2)]);
        let minted = between(&low, &high, 7).unwrap();
        assert!(low < minted && minted < high);
        assert_eq!(minted.positions()[0], Position::new(5, 1));
    }

    #[test]
    fn between_prefix_and_extension() {
        let low = id(&[(5, 1)]);
        let high = id(&[(5, 1), (1, 2)]);
        let minted = between(&low, &high, 4).unwrap();
        assert!(low < minted && minted < high);

        let high = id(&[(5, 1), (0, 2)]);
        let minted = between(&low, &high, 4).unwrap();
        assert!(low < minted && minted < high);
    }

    #[test]
    fn repeated_front_inserts_stay_ordered() {
        let mut high = Identifier::end();
        for _ in 0..500 {
            let minted = between(&Identifier::begin(), &high, 1).unwrap();
            assert!(Identifier::begin() < minted && minted < high);
            high = minted;
        }
    }

    #[test]
    fn repeated_appends_stay_shallow() {
        let mut low = Identifier::begin();
        for _ in 0..1000 {
            let minted = between(&low, &Identifier::end(), 1).unwrap();
            assert!(low < minted && minted < Identifier::end());
            low = minted;
        }
        assert_eq!(low.depth(), 1);
    }

    #[test]
    fn concurrent_mints_are_distinct_and_ordered_by_site() {
        let a = between(&Identifier::begin(), &Identifier::end(), 1).unwrap();
        let b = between(&Identifier::begin(), &Identifier::end(), 2).unwrap();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn invalid_range_rejected() {
        let a = id(&[(5, 1)]);
        assert!(matches!(
            between(&a, &a, 1),
            Err(IdentError::InvalidRange { .. })
        ));
        assert!(matches!(
            between(&Identifier::end(), &Identifier::begin(), 1),
            Err(IdentError::InvalidRange { .. })
        ));
    }

    #[test]
    fn reserved_site_rejected() {
        assert_eq!(
            between(&Identifier::begin(), &Identifier::end(), SENTINEL_SITE),
            Err(IdentError::ReservedSite)
        );
    }

    #[test]
    fn display_format() {
        assert_eq!(id(&[(5, 1), (12, 3)]).to_string(), "5@1.12@3");
    }
}
