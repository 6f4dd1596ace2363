// 🧾 Ledger Entry - One submitted claim and its place in the owner's running ledger
//
// Inputs (claim value, copies, rate, exchange rate) are set by the claim workflow.
// Derived fields are owned by the engines:
// - own_duty               → duty calculator, on create and on every input update
// - past_total, running_total → recalculation engine only
//
// Invariant (per owner, ordered by created_at then id):
//   past_total[i]    = Σ own_duty[j] for j < i
//   running_total[i] = own_duty[i] + past_total[i]

use crate::entities::owner::{OwnerId, OwnerKind};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub type EntryId = i64;

/// Default stamp rate (0.15%)
pub fn default_rate() -> Decimal {
    Decimal::new(15, 4)
}

/// Default exchange rate (claim already in local currency)
pub fn default_exchange_rate() -> Decimal {
    Decimal::ONE
}

// ============================================================================
// CLAIM INPUT
// ============================================================================

/// Everything the claim-submission workflow provides for a new entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimInput {
    pub claim_value: Decimal,
    pub copies: i64,
    pub rate: Decimal,
    pub exchange_rate: Decimal,
    pub invoice_date: Option<NaiveDate>,
    pub note: Option<String>,
    pub recorded_by: Option<String>,

    /// Backdated creation time. None = now.
    /// A backdated entry is slotted into the owner's order by this time.
    pub recorded_at: Option<DateTime<Utc>>,
}

impl ClaimInput {
    pub fn new(claim_value: Decimal, copies: i64) -> Self {
        ClaimInput {
            claim_value,
            copies,
            rate: default_rate(),
            exchange_rate: default_exchange_rate(),
            invoice_date: None,
            note: None,
            recorded_by: None,
            recorded_at: None,
        }
    }

    pub fn with_rate(mut self, rate: Decimal) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_exchange_rate(mut self, exchange_rate: Decimal) -> Self {
        self.exchange_rate = exchange_rate;
        self
    }

    pub fn with_invoice_date(mut self, date: NaiveDate) -> Self {
        self.invoice_date = Some(date);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn recorded_by(mut self, actor: impl Into<String>) -> Self {
        self.recorded_by = Some(actor.into());
        self
    }

    pub fn backdated(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(at);
        self
    }
}

// ============================================================================
// ENTRY PATCH
// ============================================================================

/// Partial update from the claim-edit workflow. Derived fields are not patchable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryPatch {
    pub claim_value: Option<Decimal>,
    pub copies: Option<i64>,
    pub rate: Option<Decimal>,
    pub exchange_rate: Option<Decimal>,

    /// Some(None) clears the invoice date
    pub invoice_date: Option<Option<NaiveDate>>,
    pub note: Option<Option<String>>,
}

impl EntryPatch {
    pub fn is_empty(&self) -> bool {
        self.claim_value.is_none()
            && self.copies.is_none()
            && self.rate.is_none()
            && self.exchange_rate.is_none()
            && self.invoice_date.is_none()
            && self.note.is_none()
    }

    /// True when the patch touches an input of the duty formula
    pub fn changes_duty_inputs(&self) -> bool {
        self.claim_value.is_some()
            || self.copies.is_some()
            || self.rate.is_some()
            || self.exchange_rate.is_some()
    }

    /// Apply the patch to the entry's inputs (own_duty is NOT recomputed here)
    pub fn apply(&self, entry: &mut LedgerEntry) {
        if let Some(v) = self.claim_value {
            entry.claim_value = v;
        }
        if let Some(c) = self.copies {
            entry.copies = c;
        }
        if let Some(r) = self.rate {
            entry.rate = r;
        }
        if let Some(x) = self.exchange_rate {
            entry.exchange_rate = x;
        }
        if let Some(date) = self.invoice_date {
            entry.invoice_date = date;
        }
        if let Some(note) = &self.note {
            entry.note = note.clone();
        }
    }
}

// ============================================================================
// LEDGER ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    // ========================================================================
    // IDENTITY (never changes)
    // ========================================================================
    pub id: EntryId,
    pub kind: OwnerKind,
    pub owner_id: OwnerId,
    pub created_at: DateTime<Utc>,

    // ========================================================================
    // CLAIM INPUTS
    // ========================================================================
    pub claim_value: Decimal,
    pub copies: i64,
    pub rate: Decimal,
    pub exchange_rate: Decimal,
    pub invoice_date: Option<NaiveDate>,
    pub note: Option<String>,
    pub recorded_by: String,

    // ========================================================================
    // DERIVED
    // ========================================================================
    pub own_duty: Decimal,
    pub past_total: Decimal,
    pub running_total: Decimal,

    // ========================================================================
    // BOOKKEEPING
    // ========================================================================
    /// Bumped on every persisted change of the row
    pub version: i64,

    /// Row changed and no sync task has been handed out for it yet
    pub sync_pending: bool,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Date used for yearly reporting: invoice date, else creation date
    pub fn reporting_date(&self) -> NaiveDate {
        self.invoice_date
            .unwrap_or_else(|| self.created_at.date_naive())
    }

    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey {
            kind: self.kind,
            entry_id: self.id,
        }
    }

    /// Total order used by the recalculation walk
    pub fn ledger_order(&self) -> (DateTime<Utc>, EntryId) {
        (self.created_at, self.id)
    }

    /// Full, self-contained copy of the entry for the sync dispatcher
    pub fn snapshot(&self, owner_name: &str) -> EntrySnapshot {
        EntrySnapshot {
            kind: self.kind,
            entry_id: self.id,
            owner_id: self.owner_id,
            owner_name: owner_name.to_string(),
            claim_value: self.claim_value,
            copies: self.copies,
            rate: self.rate,
            exchange_rate: self.exchange_rate,
            own_duty: self.own_duty,
            past_total: self.past_total,
            running_total: self.running_total,
            invoice_date: self.invoice_date,
            note: self.note.clone(),
            recorded_by: self.recorded_by.clone(),
            created_at: self.created_at,
            version: self.version,
        }
    }
}

// ============================================================================
// CORRELATION KEY
// ============================================================================

/// Stable address of an entry in the external system.
/// Built from local identity only, never from ids the external system assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub kind: OwnerKind,
    pub entry_id: EntryId,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-claim:{}", self.kind, self.entry_id)
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub kind: OwnerKind,
    pub entry_id: EntryId,
    pub owner_id: OwnerId,
    pub owner_name: String,
    pub claim_value: Decimal,
    pub copies: i64,
    pub rate: Decimal,
    pub exchange_rate: Decimal,
    pub own_duty: Decimal,
    pub past_total: Decimal,
    pub running_total: Decimal,
    pub invoice_date: Option<NaiveDate>,
    pub note: Option<String>,
    pub recorded_by: String,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl EntrySnapshot {
    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey {
            kind: self.kind,
            entry_id: self.entry_id,
        }
    }

    /// SHA-256 over the synced content. Equal fingerprints → nothing new to push.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{:?}|{:?}|{}|{}",
            self.kind,
            self.entry_id,
            self.owner_name,
            self.claim_value.normalize(),
            self.copies,
            self.rate.normalize(),
            self.exchange_rate.normalize(),
            self.own_duty.normalize(),
            self.past_total.normalize(),
            self.running_total.normalize(),
            self.invoice_date,
            self.note,
            self.recorded_by,
            self.created_at.timestamp_micros(),
        ));
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_entry() -> LedgerEntry {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        LedgerEntry {
            id: 7,
            kind: OwnerKind::Company,
            owner_id: 3,
            created_at,
            claim_value: Decimal::new(100_000, 0),
            copies: 2,
            rate: default_rate(),
            exchange_rate: Decimal::ONE,
            invoice_date: None,
            note: None,
            recorded_by: "system".to_string(),
            own_duty: Decimal::new(300, 0),
            past_total: Decimal::ZERO,
            running_total: Decimal::new(300, 0),
            version: 1,
            sync_pending: true,
            updated_at: created_at,
        }
    }

    #[test]
    fn test_reporting_date_prefers_invoice_date() {
        let mut entry = sample_entry();
        assert_eq!(entry.reporting_date(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());

        entry.invoice_date = NaiveDate::from_ymd_opt(2023, 12, 31);
        assert_eq!(entry.reporting_date(), NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
    }

    #[test]
    fn test_patch_applies_only_given_fields() {
        let mut entry = sample_entry();
        let patch = EntryPatch {
            copies: Some(5),
            note: Some(Some("re-issued".to_string())),
            ..Default::default()
        };

        assert!(patch.changes_duty_inputs());
        patch.apply(&mut entry);

        assert_eq!(entry.copies, 5);
        assert_eq!(entry.claim_value, Decimal::new(100_000, 0));
        assert_eq!(entry.note.as_deref(), Some("re-issued"));

        let note_only = EntryPatch {
            note: Some(None),
            ..Default::default()
        };
        assert!(!note_only.changes_duty_inputs());
        assert!(!note_only.is_empty());
        assert!(EntryPatch::default().is_empty());
    }

    #[test]
    fn test_correlation_key_is_stable_text() {
        let entry = sample_entry();
        assert_eq!(entry.correlation_key().to_string(), "company-claim:7");
        assert_eq!(entry.snapshot("Acme").correlation_key(), entry.correlation_key());
    }

    #[test]
    fn test_fingerprint_ignores_decimal_scale_but_not_values() {
        let entry = sample_entry();
        let a = entry.snapshot("Acme");

        let mut rescaled = a.clone();
        rescaled.own_duty = Decimal::new(30000, 2); // 300.00
        assert_eq!(a.fingerprint(), rescaled.fingerprint());

        let mut changed = a.clone();
        changed.past_total = Decimal::new(1, 2);
        assert_ne!(a.fingerprint(), changed.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
