// 🔒 Concurrency Guard - one recalculation pass per owner at a time
//
// Non-blocking named lock keyed by (owner kind, owner id):
// - Free   → acquired, caller runs a pass
// - Held   → caller's trigger is dropped, a rerun mark is left on the lock
// - Finish → holder atomically releases, or sees the mark and runs one more pass
//
// The TTL only matters when a holder dies without releasing; an expired lock
// can be taken over by the next caller.

use crate::db::LedgerStore;
use crate::entities::{OwnerId, OwnerKind};
use crate::error::LedgerResult;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub kind: OwnerKind,
    pub owner_id: OwnerId,
}

impl LockKey {
    pub fn new(kind: OwnerKind, owner_id: OwnerId) -> Self {
        LockKey { kind, owner_id }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recalc:{}:{}", self.kind, self.owner_id)
    }
}

/// Result of finishing a pass while holding the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Lock released, nobody asked for another pass
    Released,

    /// A trigger arrived during the pass; lock is still held, run again
    RerunRequested,
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

pub trait LockBackend: Send + Sync {
    /// Take the lock if free (or expired). When it is held by someone else,
    /// leave a rerun mark and return false.
    fn try_acquire(&self, key: &LockKey, token: &str, ttl: Duration) -> LedgerResult<bool>;

    /// Release, unless a rerun mark is set: then clear the mark, refresh the
    /// TTL and keep holding.
    fn finish(&self, key: &LockKey, token: &str, ttl: Duration) -> LedgerResult<Finish>;

    /// Unconditional release (error paths)
    fn release(&self, key: &LockKey, token: &str) -> LedgerResult<()>;
}

// ============================================================================
// IN-PROCESS BACKEND
// ============================================================================

struct HeldLock {
    token: String,
    expires_at: Instant,
    rerun: bool,
}

#[derive(Default)]
pub struct MemoryLockBackend {
    held: Mutex<HashMap<LockKey, HeldLock>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<LockKey, HeldLock>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LockBackend for MemoryLockBackend {
    fn try_acquire(&self, key: &LockKey, token: &str, ttl: Duration) -> LedgerResult<bool> {
        let now = Instant::now();
        let mut table = self.table();

        if let Some(held) = table.get_mut(key) {
            if held.expires_at > now {
                held.rerun = true;
                return Ok(false);
            }
            warn!(lock = %key, "taking over expired recalculation lock");
        }

        table.insert(
            *key,
            HeldLock {
                token: token.to_string(),
                expires_at: now + ttl,
                rerun: false,
            },
        );
        Ok(true)
    }

    fn finish(&self, key: &LockKey, token: &str, ttl: Duration) -> LedgerResult<Finish> {
        let mut table = self.table();

        let rerun = match table.get_mut(key) {
            Some(held) if held.token == token => {
                let rerun = held.rerun;
                if rerun {
                    held.rerun = false;
                    held.expires_at = Instant::now() + ttl;
                }
                rerun
            }
            _ => {
                warn!(lock = %key, "recalculation lock was lost before finishing");
                return Ok(Finish::Released);
            }
        };

        if rerun {
            Ok(Finish::RerunRequested)
        } else {
            table.remove(key);
            Ok(Finish::Released)
        }
    }

    fn release(&self, key: &LockKey, token: &str) -> LedgerResult<()> {
        let mut table = self.table();
        if table.get(key).map(|h| h.token == token).unwrap_or(false) {
            table.remove(key);
        }
        Ok(())
    }
}

// ============================================================================
// SQLITE BACKEND (shared across processes using the same database file)
// ============================================================================

pub struct SqliteLockBackend {
    store: LedgerStore,
}

impl SqliteLockBackend {
    pub fn new(store: LedgerStore) -> Self {
        SqliteLockBackend { store }
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl LockBackend for SqliteLockBackend {
    fn try_acquire(&self, key: &LockKey, token: &str, ttl: Duration) -> LedgerResult<bool> {
        let lock_key = key.to_string();

        self.store.with_conn(|conn| {
            let now = Utc::now().timestamp_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let expired = tx.execute(
                "DELETE FROM recalc_locks WHERE lock_key = ?1 AND expires_at_ms <= ?2",
                params![lock_key, now],
            )?;
            if expired > 0 {
                warn!(lock = %lock_key, "taking over expired recalculation lock");
            }

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO recalc_locks (lock_key, token, expires_at_ms, rerun)
                 VALUES (?1, ?2, ?3, 0)",
                params![lock_key, token, now.saturating_add(ttl_ms(ttl))],
            )?;

            if inserted == 0 {
                tx.execute(
                    "UPDATE recalc_locks SET rerun = 1 WHERE lock_key = ?1",
                    params![lock_key],
                )?;
            }

            tx.commit()?;
            Ok(inserted == 1)
        })
    }

    fn finish(&self, key: &LockKey, token: &str, ttl: Duration) -> LedgerResult<Finish> {
        let lock_key = key.to_string();

        self.store.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let rerun: Option<i64> = tx
                .query_row(
                    "SELECT rerun FROM recalc_locks WHERE lock_key = ?1 AND token = ?2",
                    params![lock_key, token],
                    |row| row.get(0),
                )
                .optional()?;

            let finish = match rerun {
                Some(1) => {
                    let now = Utc::now().timestamp_millis();
                    tx.execute(
                        "UPDATE recalc_locks SET rerun = 0, expires_at_ms = ?1
                         WHERE lock_key = ?2 AND token = ?3",
                        params![now.saturating_add(ttl_ms(ttl)), lock_key, token],
                    )?;
                    Finish::RerunRequested
                }
                Some(_) => {
                    tx.execute(
                        "DELETE FROM recalc_locks WHERE lock_key = ?1 AND token = ?2",
                        params![lock_key, token],
                    )?;
                    Finish::Released
                }
                None => {
                    warn!(lock = %lock_key, "recalculation lock was lost before finishing");
                    Finish::Released
                }
            };

            tx.commit()?;
            Ok(finish)
        })
    }

    fn release(&self, key: &LockKey, token: &str) -> LedgerResult<()> {
        let lock_key = key.to_string();
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM recalc_locks WHERE lock_key = ?1 AND token = ?2",
                params![lock_key, token],
            )?;
            Ok(())
        })
    }
}

// ============================================================================
// GUARD
// ============================================================================

#[derive(Clone)]
pub struct ConcurrencyGuard {
    backend: Arc<dyn LockBackend>,
    ttl: Duration,
}

impl ConcurrencyGuard {
    pub fn new(backend: Arc<dyn LockBackend>, ttl: Duration) -> Self {
        ConcurrencyGuard { backend, ttl }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLockBackend::new()), DEFAULT_LOCK_TTL)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Non-blocking acquire. None means another pass is running for this
    /// owner; it has been asked to run again.
    pub fn try_lock(&self, kind: OwnerKind, owner_id: OwnerId) -> LedgerResult<Option<LockGuard>> {
        let key = LockKey::new(kind, owner_id);
        let token = uuid::Uuid::new_v4().to_string();

        if self.backend.try_acquire(&key, &token, self.ttl)? {
            debug!(lock = %key, "recalculation lock acquired");
            Ok(Some(LockGuard {
                backend: Arc::clone(&self.backend),
                key,
                token,
                ttl: self.ttl,
                held: true,
            }))
        } else {
            debug!(lock = %key, "recalculation lock busy, trigger dropped");
            Ok(None)
        }
    }
}

/// Held lock. Dropping it releases the lock.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    key: LockKey,
    token: String,
    ttl: Duration,
    held: bool,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn finish(&mut self) -> LedgerResult<Finish> {
        if !self.held {
            return Ok(Finish::Released);
        }

        let finish = self.backend.finish(&self.key, &self.token, self.ttl)?;
        if finish == Finish::Released {
            self.held = false;
        }
        Ok(finish)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = self.backend.release(&self.key, &self.token) {
                warn!(lock = %self.key, error = %e, "failed to release recalculation lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guards() -> Vec<ConcurrencyGuard> {
        let store = LedgerStore::open_in_memory().unwrap();
        vec![
            ConcurrencyGuard::in_memory(),
            ConcurrencyGuard::new(Arc::new(SqliteLockBackend::new(store)), DEFAULT_LOCK_TTL),
        ]
    }

    #[test]
    fn test_second_acquire_is_dropped_and_requests_rerun() {
        for guard in guards() {
            let mut held = guard.try_lock(OwnerKind::Company, 1).unwrap().unwrap();
            assert!(guard.try_lock(OwnerKind::Company, 1).unwrap().is_none());

            // The dropped trigger turns into one more pass for the holder
            assert_eq!(held.finish().unwrap(), Finish::RerunRequested);
            assert_eq!(held.finish().unwrap(), Finish::Released);

            assert!(guard.try_lock(OwnerKind::Company, 1).unwrap().is_some());
        }
    }

    #[test]
    fn test_owners_and_kinds_lock_independently() {
        for guard in guards() {
            let _a = guard.try_lock(OwnerKind::Company, 1).unwrap().unwrap();
            assert!(guard.try_lock(OwnerKind::Company, 2).unwrap().is_some());
            assert!(guard.try_lock(OwnerKind::Sector, 1).unwrap().is_some());
        }
    }

    #[test]
    fn test_drop_releases_on_every_exit_path() {
        for guard in guards() {
            let result: Result<(), &str> = (|| {
                let _held = guard.try_lock(OwnerKind::Sector, 9).unwrap().unwrap();
                Err("pass failed")
            })();
            assert!(result.is_err());

            assert!(guard.try_lock(OwnerKind::Sector, 9).unwrap().is_some());
        }
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let backend: Arc<dyn LockBackend> = Arc::new(MemoryLockBackend::new());
        let guard = ConcurrencyGuard::new(Arc::clone(&backend), Duration::from_millis(0));

        let mut stale = guard.try_lock(OwnerKind::Company, 4).unwrap().unwrap();
        let mut fresh = guard.try_lock(OwnerKind::Company, 4).unwrap().unwrap();

        // The crashed holder no longer owns the lock; finishing it is harmless
        assert_eq!(stale.finish().unwrap(), Finish::Released);
        assert_eq!(fresh.finish().unwrap(), Finish::Released);
    }

    #[test]
    fn test_sqlite_lock_visible_to_other_handles_on_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");

        let first = ConcurrencyGuard::new(
            Arc::new(SqliteLockBackend::new(LedgerStore::open(&path).unwrap())),
            DEFAULT_LOCK_TTL,
        );
        let second = ConcurrencyGuard::new(
            Arc::new(SqliteLockBackend::new(LedgerStore::open(&path).unwrap())),
            DEFAULT_LOCK_TTL,
        );

        let held = first.try_lock(OwnerKind::Company, 1).unwrap().unwrap();
        assert!(second.try_lock(OwnerKind::Company, 1).unwrap().is_none());
        drop(held);
        assert!(second.try_lock(OwnerKind::Company, 1).unwrap().is_some());
    }
}
