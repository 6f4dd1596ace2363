// 🔁 Recalculation Engine - settle an owner's cumulative totals after any mutation
//
// Full O(n) walk in ledger order (created_at, then id):
//   past_total[i]    = Σ own_duty[j] for j < i
//   running_total[i] = own_duty[i] + past_total[i]
//
// Only rows whose totals moved (or that still wait for sync) are written, all in
// one transaction. The engine never talks to the external system: it returns
// the snapshots of those rows and the caller hands them to sync. A row stays
// sync_pending until the external system confirms its version, so every pass
// re-emits rows whose earlier sync was lost or abandoned.

use crate::db::{self, LedgerStore, TotalsUpdate};
use crate::entities::{EntryId, EntrySnapshot, LedgerEntry, OwnerId, OwnerKind};
use crate::error::{LedgerError, LedgerResult};
use crate::lock::{ConcurrencyGuard, Finish};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// ============================================================================
// PURE WALK
// ============================================================================

/// Compute the totals each entry should carry. Returns only the entries that
/// need a write: totals differ from what is stored, or the row is sync_pending.
pub fn compute_totals(entries: &[LedgerEntry]) -> LedgerResult<Vec<TotalsUpdate>> {
    let mut ordered: Vec<&LedgerEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.ledger_order());

    let mut accumulated = Decimal::ZERO;
    let mut updates = Vec::new();

    for entry in ordered {
        let past_total = accumulated;
        let running_total = past_total
            .checked_add(entry.own_duty)
            .ok_or_else(|| LedgerError::Corrupt {
                id: entry.id,
                detail: "cumulative total overflows".to_string(),
            })?;

        let totals_changed = entry.past_total != past_total || entry.running_total != running_total;
        if totals_changed || entry.sync_pending {
            updates.push(TotalsUpdate {
                id: entry.id,
                expected_version: entry.version,
                past_total,
                running_total,
                totals_changed,
            });
        }

        accumulated = running_total;
    }

    Ok(updates)
}

/// Check the cumulative invariant over an owner's entries
pub fn totals_consistent(entries: &[LedgerEntry]) -> bool {
    compute_totals(entries)
        .map(|updates| updates.iter().all(|u| !u.totals_changed))
        .unwrap_or(false)
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RecalcOutcome {
    /// Totals settled. `written` holds the final snapshot of every row written
    /// or still waiting for sync.
    Completed { passes: u32, written: Vec<EntrySnapshot> },

    /// Another pass holds the owner's lock; it was asked to run again
    Dropped,
}

impl RecalcOutcome {
    pub fn written(&self) -> &[EntrySnapshot] {
        match self {
            RecalcOutcome::Completed { written, .. } => written,
            RecalcOutcome::Dropped => &[],
        }
    }
}

struct PassResult {
    written: Vec<EntrySnapshot>,
    conflicts: usize,
}

impl PassResult {
    fn empty() -> Self {
        PassResult {
            written: Vec::new(),
            conflicts: 0,
        }
    }
}

#[derive(Clone)]
pub struct RecalcEngine {
    store: LedgerStore,
    guard: ConcurrencyGuard,
}

impl RecalcEngine {
    pub fn new(store: LedgerStore, guard: ConcurrencyGuard) -> Self {
        RecalcEngine { store, guard }
    }

    /// Recalculate one owner. Blocking (SQLite); run it off the async executor.
    pub fn recalculate(&self, kind: OwnerKind, owner_id: OwnerId) -> LedgerResult<RecalcOutcome> {
        let Some(mut lock) = self.guard.try_lock(kind, owner_id)? else {
            return Ok(RecalcOutcome::Dropped);
        };

        let mut written: BTreeMap<EntryId, EntrySnapshot> = BTreeMap::new();
        let mut passes = 0u32;

        loop {
            passes += 1;
            let pass = self.run_pass(kind, owner_id)?;

            for snapshot in pass.written {
                written.insert(snapshot.entry_id, snapshot);
            }

            if pass.conflicts > 0 {
                warn!(%kind, owner_id, conflicts = pass.conflicts, "rows changed during pass, repeating");
                continue;
            }

            match lock.finish()? {
                Finish::Released => break,
                Finish::RerunRequested => {
                    debug!(lock = %lock.key(), "rerun requested by a dropped trigger");
                }
            }
        }

        let written: Vec<EntrySnapshot> = written.into_values().collect();
        info!(%kind, owner_id, passes, written = written.len(), "recalculation complete");

        Ok(RecalcOutcome::Completed { passes, written })
    }

    fn run_pass(&self, kind: OwnerKind, owner_id: OwnerId) -> LedgerResult<PassResult> {
        self.store.with_conn(|conn| {
            let owner = db::get_owner(conn, owner_id)?
                .filter(|o| o.kind == kind)
                .ok_or(LedgerError::OwnerOfKindNotFound { kind, id: owner_id })?;

            let entries = db::entries_for_owner(conn, kind, owner_id)?;
            if entries.is_empty() {
                return Ok(PassResult::empty());
            }

            let updates = compute_totals(&entries)?;
            let outcome = db::apply_totals_batch(conn, &updates)?;

            let by_id: BTreeMap<EntryId, &LedgerEntry> = entries.iter().map(|e| (e.id, e)).collect();
            let settled: BTreeMap<EntryId, &TotalsUpdate> = updates.iter().map(|u| (u.id, u)).collect();

            let mut written = Vec::with_capacity(outcome.written.len());
            let mut moved = Vec::new();
            for (id, version) in &outcome.written {
                if let (Some(entry), Some(update)) = (by_id.get(id), settled.get(id)) {
                    let mut entry = (*entry).clone();
                    entry.past_total = update.past_total;
                    entry.running_total = update.running_total;
                    entry.version = *version;
                    written.push(entry.snapshot(&owner.name));
                    if update.totals_changed {
                        moved.push(*id);
                    }
                }
            }

            if !moved.is_empty() {
                let event = db::Event::new(
                    "totals_recalculated",
                    &format!("{}_owner", kind.as_str()),
                    &owner_id.to_string(),
                    json!({
                        "entries": entries.len(),
                        "written": moved,
                    }),
                    "recalculation",
                );
                db::insert_event(conn, &event)?;
            }

            debug!(%kind, owner_id, entries = entries.len(), written = written.len(), "pass applied");

            Ok(PassResult {
                written,
                conflicts: outcome.conflicts.len(),
            })
        })
    }
}
