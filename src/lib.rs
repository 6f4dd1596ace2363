// Stamp Ledger - Core Library
// Duty calculation, cumulative per-owner ledger, ERP sync and reporting.
// Exposes all modules for use in the CLI and tests.

pub mod alert;
pub mod config;
pub mod db;
pub mod duty;
pub mod entities;
pub mod error;
pub mod export;
pub mod ledger;
pub mod lock;
pub mod queue;
pub mod recalc;
pub mod report;
pub mod runtime;
pub mod sync;

// Re-export commonly used types
pub use alert::{Alert, Alerter, RecordingAlerter, TracingAlerter};
pub use config::{ConfigArgs, LockBackendKind, Settings};
pub use db::{
    get_events_for_entity, insert_event, setup_database, Event, LedgerStore, SyncRecord,
};
pub use duty::own_duty;
pub use entities::{
    ClaimInput, CorrelationKey, EntryId, EntryPatch, EntrySnapshot, LedgerEntry, Owner, OwnerId,
    OwnerKind,
};
pub use error::{LedgerError, LedgerResult, ValidationError};
pub use ledger::LedgerService;
pub use lock::{ConcurrencyGuard, LockBackend, MemoryLockBackend, SqliteLockBackend};
pub use queue::{Job, JobError, RetryPolicy, TaskQueue};
pub use recalc::{compute_totals, totals_consistent, RecalcEngine, RecalcOutcome};
pub use report::{EntryFilter, FilterFacets, OwnerTotal, Reporter, YearPoint};
pub use runtime::{LedgerRuntime, RuntimeBuilder};
pub use sync::{
    ErpNextClient, ErpNextConfig, ExternalError, ExternalLedger, InMemoryExternal, SyncOutcome,
    SyncTask, SyncWorker,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
