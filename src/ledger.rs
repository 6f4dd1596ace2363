// 📒 Ledger Service - the claim workflow's entry point
//
// Mutations are synchronous and cheap: validate, compute own duty, persist,
// record an audit event, enqueue background work. Cumulative totals and the
// external mirror catch up on the worker pool.

use crate::db::{self, Event, LedgerStore};
use crate::duty;
use crate::entities::{ClaimInput, EntryId, EntryPatch, LedgerEntry, Owner, OwnerId, OwnerKind};
use crate::error::{LedgerError, LedgerResult, ValidationError};
use crate::queue::{Job, TaskQueue};
use crate::sync::SyncTask;
use serde_json::json;
use tracing::info;

#[derive(Clone)]
pub struct LedgerService {
    store: LedgerStore,
    queue: TaskQueue,
}

impl LedgerService {
    pub fn new(store: LedgerStore, queue: TaskQueue) -> Self {
        LedgerService { store, queue }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    // ========================================================================
    // OWNERS
    // ========================================================================

    /// Find an owner by name (case-insensitive) or create it
    pub fn get_or_create_owner(&self, kind: OwnerKind, name: &str) -> LedgerResult<Owner> {
        if Owner::normalize_name(name).is_empty() {
            return Err(ValidationError::new("name", "owner name must not be empty").into());
        }

        self.store.with_conn(|conn| {
            if let Some(owner) = db::find_owner_by_name(conn, kind, name)? {
                return Ok(owner);
            }
            let owner = db::insert_owner(conn, kind, name)?;
            info!(%kind, owner_id = owner.id, name = %owner.name, "owner created");
            Ok(owner)
        })
    }

    pub fn owners(&self, kind: OwnerKind) -> LedgerResult<Vec<Owner>> {
        self.store.with_conn(|conn| db::list_owners(conn, kind))
    }

    // ========================================================================
    // ENTRIES
    // ========================================================================

    /// Record a new claim. Returned totals are provisional (past_total = 0)
    /// until the owner's recalculation has run.
    pub fn create_entry(&self, owner_id: OwnerId, claim: ClaimInput) -> LedgerResult<LedgerEntry> {
        let own_duty = duty::duty_for_claim(&claim)?;

        let entry = self.store.with_conn(|conn| {
            let owner = db::get_owner(conn, owner_id)?.ok_or(LedgerError::OwnerNotFound { id: owner_id })?;
            let entry = db::insert_entry(conn, &owner, &claim, own_duty)?;

            let event = Event::for_entry(
                "entry_created",
                entry.kind,
                entry.id,
                json!({
                    "owner_id": owner.id,
                    "claim_value": entry.claim_value.to_string(),
                    "copies": entry.copies,
                    "rate": entry.rate.to_string(),
                    "exchange_rate": entry.exchange_rate.to_string(),
                    "own_duty": entry.own_duty.to_string(),
                    "created_at": db::format_time(&entry.created_at),
                }),
                &entry.recorded_by,
            );
            db::insert_event(conn, &event)?;
            Ok(entry)
        })?;

        info!(kind = %entry.kind, owner_id, entry_id = entry.id, own_duty = %entry.own_duty, "entry created");
        self.queue.enqueue(Job::Recalculate {
            kind: entry.kind,
            owner_id: entry.owner_id,
        })?;

        Ok(entry)
    }

    /// Change claim inputs. Own duty is recomputed now, totals by the
    /// recalculation that follows. `actor` is recorded on the audit event.
    pub fn update_entry(&self, id: EntryId, patch: EntryPatch, actor: &str) -> LedgerResult<LedgerEntry> {
        let entry = self.store.with_conn(|conn| {
            let mut entry = db::get_entry(conn, id)?.ok_or(LedgerError::EntryNotFound(id))?;
            if patch.is_empty() {
                return Ok(entry);
            }

            let before = entry.clone();
            patch.apply(&mut entry);
            if patch.changes_duty_inputs() {
                entry.own_duty = duty::duty_for_entry(&entry)?;
            }

            let stored = db::update_entry_inputs(conn, &entry)?;

            let event = Event::for_entry(
                "entry_updated",
                stored.kind,
                stored.id,
                json!({
                    "patch": patch,
                    "own_duty_before": before.own_duty.to_string(),
                    "own_duty_after": stored.own_duty.to_string(),
                    "version": stored.version,
                }),
                actor,
            );
            db::insert_event(conn, &event)?;
            Ok(stored)
        })?;

        if !patch.is_empty() {
            info!(kind = %entry.kind, entry_id = id, version = entry.version, "entry updated");
            self.queue.enqueue(Job::Recalculate {
                kind: entry.kind,
                owner_id: entry.owner_id,
            })?;
        }

        Ok(entry)
    }

    /// Remove an entry. Later entries of the owner move down by its duty.
    pub fn delete_entry(&self, id: EntryId, actor: &str) -> LedgerResult<()> {
        let entry = self.store.with_conn(|conn| {
            let entry = db::get_entry(conn, id)?.ok_or(LedgerError::EntryNotFound(id))?;
            db::delete_entry(conn, id)?;

            let event = Event::for_entry(
                "entry_deleted",
                entry.kind,
                entry.id,
                json!({
                    "owner_id": entry.owner_id,
                    "own_duty": entry.own_duty.to_string(),
                    "version": entry.version,
                }),
                actor,
            );
            db::insert_event(conn, &event)?;
            Ok(entry)
        })?;

        info!(kind = %entry.kind, owner_id = entry.owner_id, entry_id = id, "entry deleted");
        self.queue.enqueue(Job::Sync(SyncTask::Delete(entry.correlation_key())))?;
        self.queue.enqueue(Job::Recalculate {
            kind: entry.kind,
            owner_id: entry.owner_id,
        })?;

        Ok(())
    }

    pub fn get_entry(&self, id: EntryId) -> LedgerResult<LedgerEntry> {
        self.store
            .with_conn(|conn| db::get_entry(conn, id))?
            .ok_or(LedgerError::EntryNotFound(id))
    }

    /// Ask for a full recalculation of one owner (manual repair)
    pub fn request_recalculation(&self, kind: OwnerKind, owner_id: OwnerId) -> LedgerResult<()> {
        self.queue.enqueue(Job::Recalculate { kind, owner_id })
    }

    /// Audit trail of one entry, oldest first
    pub fn history(&self, kind: OwnerKind, id: EntryId) -> LedgerResult<Vec<Event>> {
        self.store
            .with_conn(|conn| db::get_events_for_entity(conn, &db::entry_entity_type(kind), &id.to_string()))
    }
}
