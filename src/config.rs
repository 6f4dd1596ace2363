// ⚙️ Configuration
//
// Flags override environment variables (a `.env` file is loaded first by the
// binary). Without an ERP URL, sync goes to the in-memory mirror.

use crate::db::LedgerStore;
use crate::lock::{ConcurrencyGuard, LockBackend, MemoryLockBackend, SqliteLockBackend, DEFAULT_LOCK_TTL};
use crate::queue::RetryPolicy;
use crate::sync::{ErpNextClient, ErpNextConfig, ExternalError, ExternalLedger, InMemoryExternal};
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LockBackendKind {
    /// Locks live in this process only
    Memory,
    /// Locks live in the database, shared with other processes
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub lock_ttl: Duration,
    pub lock_backend: LockBackendKind,
    pub erp: Option<ErpNextConfig>,
    pub retired_engineers: u32,
    pub actor: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: PathBuf::from("stamp_ledger.db"),
            workers: 4,
            retry: RetryPolicy::default(),
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_backend: LockBackendKind::Sqlite,
            erp: None,
            retired_engineers: 0,
            actor: "system".to_string(),
        }
    }
}

impl Settings {
    pub fn concurrency_guard(&self, store: &LedgerStore) -> ConcurrencyGuard {
        let backend: Arc<dyn LockBackend> = match self.lock_backend {
            LockBackendKind::Memory => Arc::new(MemoryLockBackend::new()),
            LockBackendKind::Sqlite => Arc::new(SqliteLockBackend::new(store.clone())),
        };
        ConcurrencyGuard::new(backend, self.lock_ttl)
    }

    pub fn external_ledger(&self) -> Result<Arc<dyn ExternalLedger>, ExternalError> {
        match &self.erp {
            Some(config) => Ok(Arc::new(ErpNextClient::new(config.clone())?)),
            None => Ok(Arc::new(InMemoryExternal::new())),
        }
    }
}

// ============================================================================
// CLI / ENVIRONMENT
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to the SQLite database
    #[arg(long, env = "STAMP_LEDGER_DB", default_value = "stamp_ledger.db")]
    pub db_path: PathBuf,

    /// Background workers
    #[arg(long, env = "STAMP_LEDGER_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Attempts per background job before giving up
    #[arg(long, env = "STAMP_LEDGER_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// First retry delay in milliseconds (doubles per attempt)
    #[arg(long, env = "STAMP_LEDGER_BACKOFF_MS", default_value_t = 500)]
    pub backoff_ms: u64,

    /// Retry delay cap in milliseconds
    #[arg(long, env = "STAMP_LEDGER_MAX_BACKOFF_MS", default_value_t = 30_000)]
    pub max_backoff_ms: u64,

    /// Recalculation lock TTL in seconds
    #[arg(long, env = "STAMP_LEDGER_LOCK_TTL_SECS", default_value_t = 300)]
    pub lock_ttl_secs: u64,

    #[arg(long, env = "STAMP_LEDGER_LOCK_BACKEND", value_enum, default_value_t = LockBackendKind::Sqlite)]
    pub lock_backend: LockBackendKind,

    /// ERPNext base URL; sync uses an in-memory mirror when unset
    #[arg(long, env = "ERPNEXT_URL")]
    pub erp_url: Option<String>,

    #[arg(long, env = "ERPNEXT_API_KEY", default_value = "")]
    pub erp_api_key: String,

    #[arg(long, env = "ERPNEXT_API_SECRET", default_value = "", hide_env_values = true)]
    pub erp_api_secret: String,

    /// ERP request timeout in seconds
    #[arg(long, env = "ERPNEXT_TIMEOUT_SECS", default_value_t = 10)]
    pub erp_timeout_secs: u64,

    /// Number of retired engineers sharing the pension
    #[arg(long, env = "STAMP_LEDGER_RETIRED_ENGINEERS", default_value_t = 0)]
    pub retired_engineers: u32,

    /// Actor name recorded on new entries and audit events
    #[arg(long, env = "STAMP_LEDGER_ACTOR", default_value = "system")]
    pub actor: String,
}

impl ConfigArgs {
    pub fn into_settings(self) -> Settings {
        let erp = self
            .erp_url
            .filter(|url| !url.trim().is_empty())
            .map(|url| {
                let mut config = ErpNextConfig::new(&url, &self.erp_api_key, &self.erp_api_secret);
                config.timeout = Duration::from_secs(self.erp_timeout_secs);
                config
            });

        Settings {
            database_path: self.db_path,
            workers: self.workers.max(1),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                initial_backoff: Duration::from_millis(self.backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
            },
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            lock_backend: self.lock_backend,
            erp,
            retired_engineers: self.retired_engineers,
            actor: self.actor,
        }
    }
}
