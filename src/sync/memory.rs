// In-memory external ledger: dry runs and tests.
// Records are keyed by correlation key; an older snapshot never replaces a newer one.

use super::{DeleteOutcome, ExternalError, ExternalLedger, UpdateOutcome};
use crate::entities::{CorrelationKey, EntrySnapshot};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub struct InMemoryExternal {
    records: Mutex<BTreeMap<CorrelationKey, EntrySnapshot>>,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
}

impl InMemoryExternal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a transport error
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, key: &CorrelationKey) -> Option<EntrySnapshot> {
        self.records().get(key).cloned()
    }

    pub fn all(&self) -> Vec<EntrySnapshot> {
        self.records().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Calls received, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<CorrelationKey, EntrySnapshot>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_fault(&self) -> Result<(), ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ExternalError::Transport("injected failure".to_string()));
        }
        Ok(())
    }

    fn store_newest(&self, key: &CorrelationKey, snapshot: &EntrySnapshot) {
        let mut records = self.records();
        let keep_existing = records
            .get(key)
            .map(|existing| existing.version > snapshot.version)
            .unwrap_or(false);
        if !keep_existing {
            records.insert(*key, snapshot.clone());
        }
    }
}

#[async_trait::async_trait]
impl ExternalLedger for InMemoryExternal {
    async fn update(&self, key: &CorrelationKey, snapshot: &EntrySnapshot) -> Result<UpdateOutcome, ExternalError> {
        self.check_fault()?;
        if !self.records().contains_key(key) {
            return Ok(UpdateOutcome::NotFound);
        }
        self.store_newest(key, snapshot);
        Ok(UpdateOutcome::Updated)
    }

    async fn create(&self, key: &CorrelationKey, snapshot: &EntrySnapshot) -> Result<(), ExternalError> {
        self.check_fault()?;
        self.store_newest(key, snapshot);
        Ok(())
    }

    async fn delete(&self, key: &CorrelationKey) -> Result<DeleteOutcome, ExternalError> {
        self.check_fault()?;
        match self.records().remove(key) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }
}
