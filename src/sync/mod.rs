// 🔄 Sync Dispatcher - push ledger state to the external accounting system
//
// At-least-once, idempotent, order-tolerant:
// - every call addresses the external record by correlation key, never by an
//   id the external system assigned
// - upsert = update by key, and on "not found" create with the key attached
// - delete treats "not found" as success
//
// Guards against stale or resurrecting writes:
// - entry gone locally           → skip
// - snapshot older than local row or last synced version → skip
// - fingerprint unchanged        → skip
// - entry vanished while we created it → delete it again
//
// A successful (or already satisfied) upsert clears the row's sync_pending for
// exactly the version it pushed. Store access runs on the blocking pool.

pub mod erpnext;
pub mod memory;

use crate::db::{self, LedgerStore, SyncRecord};
use crate::entities::{CorrelationKey, EntrySnapshot};
use crate::error::LedgerResult;
use crate::queue::JobError;
use chrono::Utc;
use rusqlite::Connection;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub use erpnext::{ErpNextClient, ErpNextConfig};
pub use memory::InMemoryExternal;

// ============================================================================
// TASKS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SyncTask {
    /// Full snapshot of the entry as written by the recalculation engine
    Upsert(EntrySnapshot),

    Delete(CorrelationKey),
}

impl SyncTask {
    pub fn key(&self) -> CorrelationKey {
        match self {
            SyncTask::Upsert(snapshot) => snapshot.correlation_key(),
            SyncTask::Delete(key) => *key,
        }
    }
}

// ============================================================================
// EXTERNAL SYSTEM
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("external system returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("external system rejected the request: {0}")]
    Rejected(String),
}

#[async_trait::async_trait]
pub trait ExternalLedger: Send + Sync {
    async fn update(&self, key: &CorrelationKey, snapshot: &EntrySnapshot) -> Result<UpdateOutcome, ExternalError>;

    async fn create(&self, key: &CorrelationKey, snapshot: &EntrySnapshot) -> Result<(), ExternalError>;

    async fn delete(&self, key: &CorrelationKey) -> Result<DeleteOutcome, ExternalError>;
}

// ============================================================================
// WORKER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EntryGone,
    Superseded,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Updated,
    Created,
    /// Created, then removed again because the entry was deleted meanwhile
    CreatedThenRemoved,
    Deleted,
    AlreadyAbsent,
    Skipped(SkipReason),
}

#[derive(Clone)]
pub struct SyncWorker {
    store: LedgerStore,
    external: Arc<dyn ExternalLedger>,
}

impl SyncWorker {
    pub fn new(store: LedgerStore, external: Arc<dyn ExternalLedger>) -> Self {
        SyncWorker { store, external }
    }

    pub async fn run(&self, task: &SyncTask) -> Result<SyncOutcome, JobError> {
        match task {
            SyncTask::Upsert(snapshot) => self.upsert(snapshot).await,
            SyncTask::Delete(key) => self.delete(key).await,
        }
    }

    /// Run a store closure on the blocking pool
    async fn with_store<T, F>(&self, f: F) -> Result<T, JobError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> LedgerResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| JobError::Transient(format!("store task failed: {}", e)))??;
        Ok(result)
    }

    async fn upsert(&self, snapshot: &EntrySnapshot) -> Result<SyncOutcome, JobError> {
        let key = snapshot.correlation_key();
        let fingerprint = snapshot.fingerprint();
        let (entry_id, version) = (snapshot.entry_id, snapshot.version);

        if let Some(reason) = self.skip_reason(snapshot, key, &fingerprint).await? {
            if reason == SkipReason::Unchanged {
                // External side already holds this content
                self.with_store(move |conn| db::mark_synced(conn, entry_id, version)).await?;
            }
            debug!(%key, version, ?reason, "sync skipped");
            return Ok(SyncOutcome::Skipped(reason));
        }

        let outcome = match self.external.update(&key, snapshot).await? {
            UpdateOutcome::Updated => SyncOutcome::Updated,
            UpdateOutcome::NotFound => {
                self.external.create(&key, snapshot).await?;

                // A delete may have run between our existence check and the create
                let still_there = self.with_store(move |conn| db::entry_exists(conn, entry_id)).await?;
                if !still_there {
                    self.external.delete(&key).await?;
                    self.with_store(move |conn| db::delete_sync_record(conn, &key)).await?;
                    info!(%key, "entry deleted during sync, external record removed");
                    return Ok(SyncOutcome::CreatedThenRemoved);
                }
                SyncOutcome::Created
            }
        };

        let record = SyncRecord {
            key,
            synced_version: snapshot.version,
            fingerprint,
            outcome: format!("{:?}", outcome).to_lowercase(),
            synced_at: db::storage_time(Utc::now()),
        };
        let confirmed = self
            .with_store(move |conn| {
                db::upsert_sync_record(conn, &record)?;
                db::mark_synced(conn, entry_id, version)
            })
            .await?;

        info!(%key, version, ?outcome, confirmed, "entry synced");
        Ok(outcome)
    }

    async fn skip_reason(
        &self,
        snapshot: &EntrySnapshot,
        key: CorrelationKey,
        fingerprint: &str,
    ) -> Result<Option<SkipReason>, JobError> {
        let (local, record) = self
            .with_store(move |conn| Ok((db::get_entry(conn, key.entry_id)?, db::get_sync_record(conn, &key)?)))
            .await?;

        let Some(local) = local.filter(|e| e.kind == key.kind) else {
            return Ok(Some(SkipReason::EntryGone));
        };

        // Every version bump leads to its own sync task, so a newer task exists
        if local.version > snapshot.version {
            return Ok(Some(SkipReason::Superseded));
        }

        if let Some(record) = record {
            if record.synced_version > snapshot.version {
                return Ok(Some(SkipReason::Superseded));
            }
            if record.fingerprint == fingerprint {
                return Ok(Some(SkipReason::Unchanged));
            }
        }

        Ok(None)
    }

    async fn delete(&self, key: &CorrelationKey) -> Result<SyncOutcome, JobError> {
        let outcome = match self.external.delete(key).await? {
            DeleteOutcome::Deleted => SyncOutcome::Deleted,
            DeleteOutcome::NotFound => SyncOutcome::AlreadyAbsent,
        };

        let key = *key;
        self.with_store(move |conn| db::delete_sync_record(conn, &key)).await?;
        info!(%key, ?outcome, "external record deleted");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ClaimInput, LedgerEntry, OwnerKind};
    use rust_decimal::Decimal;

    fn setup() -> (LedgerStore, Arc<InMemoryExternal>, SyncWorker) {
        let store = LedgerStore::open_in_memory().unwrap();
        let external = Arc::new(InMemoryExternal::new());
        let worker = SyncWorker::new(store.clone(), external.clone());
        (store, external, worker)
    }

    fn insert(store: &LedgerStore, duty: i64) -> LedgerEntry {
        store
            .with_conn(|conn| {
                let owner = match db::find_owner_by_name(conn, OwnerKind::Company, "Acme")? {
                    Some(owner) => owner,
                    None => db::insert_owner(conn, OwnerKind::Company, "Acme")?,
                };
                db::insert_entry(conn, &owner, &ClaimInput::new(Decimal::ONE, 1), Decimal::from(duty))
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_upsert_falls_back_to_create_then_updates() {
        let (store, external, worker) = setup();
        let entry = insert(&store, 100);
        let snapshot = entry.snapshot("Acme");

        let outcome = worker.run(&SyncTask::Upsert(snapshot.clone())).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Created);
        assert_eq!(external.get(&entry.correlation_key()).unwrap(), snapshot);

        // Same content again: nothing to push
        let again = worker.run(&SyncTask::Upsert(snapshot.clone())).await.unwrap();
        assert_eq!(again, SyncOutcome::Skipped(SkipReason::Unchanged));

        // New content at the same version goes through update
        let mut changed = snapshot.clone();
        changed.note = Some("amended".to_string());
        let outcome = worker.run(&SyncTask::Upsert(changed)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Updated);
        assert_eq!(external.len(), 1);
    }

    fn pending(store: &LedgerStore, id: i64) -> bool {
        store.with_conn(|conn| db::get_entry(conn, id)).unwrap().unwrap().sync_pending
    }

    #[tokio::test]
    async fn test_confirmed_sync_clears_pending_for_that_version_only() {
        let (store, external, worker) = setup();
        let mut entry = insert(&store, 100);
        let old = entry.snapshot("Acme");
        assert!(pending(&store, entry.id));

        worker.run(&SyncTask::Upsert(old.clone())).await.unwrap();
        assert!(!pending(&store, entry.id));

        entry.own_duty = Decimal::from(250);
        let stored = store.with_conn(|conn| db::update_entry_inputs(conn, &entry)).unwrap();
        assert!(stored.sync_pending);

        // Older snapshot does not confirm the newer row
        let outcome = worker.run(&SyncTask::Upsert(old)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Superseded));
        assert!(pending(&store, entry.id));

        worker.run(&SyncTask::Upsert(stored.snapshot("Acme"))).await.unwrap();
        assert!(!pending(&store, entry.id));
        assert_eq!(external.get(&entry.correlation_key()).unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_unchanged_skip_still_confirms_the_row() {
        let (store, external, worker) = setup();
        let entry = insert(&store, 100);
        let snapshot = entry.snapshot("Acme");
        worker.run(&SyncTask::Upsert(snapshot.clone())).await.unwrap();

        // Pushed earlier but the confirmation was lost
        store
            .with_conn(|conn| {
                conn.execute("UPDATE ledger_entries SET sync_pending = 1 WHERE id = ?1", [entry.id])?;
                Ok(())
            })
            .unwrap();

        let calls = external.calls();
        let outcome = worker.run(&SyncTask::Upsert(snapshot)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Unchanged));
        assert_eq!(external.calls(), calls);
        assert!(!pending(&store, entry.id));
    }

    #[tokio::test]
    async fn test_upsert_for_deleted_entry_is_skipped() {
        let (store, external, worker) = setup();
        let entry = insert(&store, 100);
        store.with_conn(|conn| db::delete_entry(conn, entry.id)).unwrap();

        let outcome = worker.run(&SyncTask::Upsert(entry.snapshot("Acme"))).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::EntryGone));
        assert!(external.is_empty());
    }

    #[tokio::test]
    async fn test_stale_snapshot_does_not_overwrite_newer_state() {
        let (store, external, worker) = setup();
        let mut entry = insert(&store, 100);
        let old = entry.snapshot("Acme");

        entry.own_duty = Decimal::from(250);
        let stored = store.with_conn(|conn| db::update_entry_inputs(conn, &entry)).unwrap();
        let new = stored.snapshot("Acme");

        // Newer task lands first
        worker.run(&SyncTask::Upsert(new.clone())).await.unwrap();
        let outcome = worker.run(&SyncTask::Upsert(old)).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Superseded));
        assert_eq!(external.get(&stored.correlation_key()).unwrap().own_duty, Decimal::from(250));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (store, external, worker) = setup();
        let entry = insert(&store, 100);
        let key = entry.correlation_key();
        worker.run(&SyncTask::Upsert(entry.snapshot("Acme"))).await.unwrap();

        store.with_conn(|conn| db::delete_entry(conn, entry.id)).unwrap();
        assert_eq!(worker.run(&SyncTask::Delete(key)).await.unwrap(), SyncOutcome::Deleted);
        assert_eq!(worker.run(&SyncTask::Delete(key)).await.unwrap(), SyncOutcome::AlreadyAbsent);

        assert!(external.is_empty());
        assert!(store.with_conn(|conn| db::get_sync_record(conn, &key)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_external_failure_is_transient() {
        let (store, external, worker) = setup();
        let entry = insert(&store, 100);
        external.fail_next(1);

        let err = worker.run(&SyncTask::Upsert(entry.snapshot("Acme"))).await.unwrap_err();
        assert!(err.is_retryable());

        // Next attempt goes through
        let outcome = worker.run(&SyncTask::Upsert(entry.snapshot("Acme"))).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Created);
    }

    #[tokio::test]
    async fn test_sync_tasks_are_keyed_by_local_identity() {
        let (store, _, _) = setup();
        let entry = insert(&store, 1);
        let upsert = SyncTask::Upsert(entry.snapshot("Acme"));
        let delete = SyncTask::Delete(entry.correlation_key());
        assert_eq!(upsert.key(), delete.key());
        assert_eq!(delete.key().kind, OwnerKind::Company);
    }
}
