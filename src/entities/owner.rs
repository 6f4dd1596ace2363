// 🏢 Owner Entity - Companies and sectors that claims accumulate against
//
// Every ledger entry belongs to exactly one owner. Cumulative totals are
// scoped per owner, so the owner is also the unit of locking and recalculation.
//
// Two kinds of owner feed two parallel streams with the same shape:
// - Company → "company claims" (stamp duty actually invoiced)
// - Sector  → "sector claims"  (stamp duty expected from a sector)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type OwnerId = i64;

// ============================================================================
// OWNER KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    /// Company claims stream
    Company,

    /// Sector claims stream
    Sector,
}

impl OwnerKind {
    pub const ALL: [OwnerKind; 2] = [OwnerKind::Company, OwnerKind::Sector];

    /// Stable storage tag (written to SQLite, used in lock keys)
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Company => "company",
            OwnerKind::Sector => "sector",
        }
    }

    /// Document type the external accounting system files this stream under
    pub fn doctype(&self) -> &'static str {
        match self {
            OwnerKind::Company => "Stamp Calculation",
            OwnerKind::Sector => "Expected Stamp",
        }
    }

    /// Human-readable name of the stream
    pub fn stream_name(&self) -> &'static str {
        match self {
            OwnerKind::Company => "company claims",
            OwnerKind::Sector => "sector claims",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "company" | "companies" => Ok(OwnerKind::Company),
            "sector" | "sectors" => Ok(OwnerKind::Sector),
            other => Err(format!("unknown owner kind: {}", other)),
        }
    }
}

// ============================================================================
// OWNER ENTITY
// ============================================================================

/// A company or sector. Names are unique per kind, compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    pub id: OwnerId,
    pub kind: OwnerKind,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Owner {
    /// Canonical form of a submitted owner name ("  Acme  Ltd " → "Acme Ltd")
    pub fn normalize_name(name: &str) -> String {
        name.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Key used for the case-insensitive uniqueness check
    pub fn lookup_key(name: &str) -> String {
        Self::normalize_name(name).to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_kind_round_trips_through_storage_tag() {
        for kind in OwnerKind::ALL {
            assert_eq!(kind.as_str().parse::<OwnerKind>().unwrap(), kind);
        }
        assert_eq!("Companies".parse::<OwnerKind>().unwrap(), OwnerKind::Company);
        assert!("bank".parse::<OwnerKind>().is_err());
    }

    #[test]
    fn test_streams_have_distinct_doctypes() {
        assert_ne!(OwnerKind::Company.doctype(), OwnerKind::Sector.doctype());
    }

    #[test]
    fn test_owner_name_normalization() {
        assert_eq!(Owner::normalize_name("  Acme   Ltd "), "Acme Ltd");
        assert_eq!(Owner::lookup_key("ACME ltd"), Owner::lookup_key(" acme  LTD"));
    }
}
