// 🚀 Runtime - wires store, queue, worker pool, engines and service together
//
//   LedgerService ──enqueue──▶ TaskQueue ──▶ workers ──▶ LedgerJobHandler
//                                                        ├─ Recalculate → RecalcEngine (blocking pool)
//                                                        │                 └─ written rows → Sync jobs
//                                                        └─ Sync        → SyncWorker → ExternalLedger
//
// Must be started inside a Tokio runtime.

use crate::alert::{Alert, Alerter, TracingAlerter};
use crate::config::Settings;
use crate::db::LedgerStore;
use crate::entities::OwnerKind;
use crate::error::LedgerResult;
use crate::ledger::LedgerService;
use crate::lock::ConcurrencyGuard;
use crate::queue::{spawn_workers, Job, JobError, JobHandler, RetryPolicy, TaskQueue};
use crate::recalc::RecalcEngine;
use crate::report::Reporter;
use crate::sync::{ExternalLedger, InMemoryExternal, SyncTask, SyncWorker};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

// ============================================================================
// JOB HANDLER
// ============================================================================

struct LedgerJobHandler {
    engine: RecalcEngine,
    sync: SyncWorker,
    queue: TaskQueue,
    alerter: Arc<dyn Alerter>,
}

#[async_trait::async_trait]
impl JobHandler for LedgerJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match job {
            Job::Recalculate { kind, owner_id } => {
                let engine = self.engine.clone();
                let (kind, owner_id) = (*kind, *owner_id);

                let outcome = tokio::task::spawn_blocking(move || engine.recalculate(kind, owner_id))
                    .await
                    .map_err(|e| JobError::Transient(format!("recalculation task failed: {}", e)))??;

                for snapshot in outcome.written() {
                    self.queue.enqueue(Job::Sync(SyncTask::Upsert(snapshot.clone())))?;
                }
                Ok(())
            }
            Job::Sync(task) => self.sync.run(task).await.map(|_| ()),
        }
    }

    fn on_final_failure(&self, job: &Job, attempts: u32, err: &JobError) {
        match job {
            Job::Sync(task) => {
                let key = task.key();
                let operation = match task {
                    SyncTask::Upsert(_) => "upsert",
                    SyncTask::Delete(_) => "delete",
                };
                self.alerter.alert(Alert {
                    kind: key.kind,
                    entry_id: key.entry_id,
                    operation: operation.to_string(),
                    error: err.to_string(),
                    attempts,
                    raised_at: Utc::now(),
                });
            }
            Job::Recalculate { kind, owner_id } => {
                error!(%kind, owner_id, attempts, error = %err, "recalculation abandoned");
            }
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct RuntimeBuilder {
    store: LedgerStore,
    external: Option<Arc<dyn ExternalLedger>>,
    alerter: Option<Arc<dyn Alerter>>,
    guard: Option<ConcurrencyGuard>,
    retry: RetryPolicy,
    workers: usize,
}

impl RuntimeBuilder {
    pub fn external(mut self, external: Arc<dyn ExternalLedger>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = Some(alerter);
        self
    }

    pub fn guard(mut self, guard: ConcurrencyGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn start(self) -> LedgerRuntime {
        let external = self
            .external
            .unwrap_or_else(|| Arc::new(InMemoryExternal::new()));
        let alerter = self.alerter.unwrap_or_else(|| Arc::new(TracingAlerter));
        let guard = self.guard.unwrap_or_else(ConcurrencyGuard::in_memory);

        let (queue, rx) = TaskQueue::new();
        let handler = Arc::new(LedgerJobHandler {
            engine: RecalcEngine::new(self.store.clone(), guard),
            sync: SyncWorker::new(self.store.clone(), external),
            queue: queue.clone(),
            alerter,
        });

        let workers = spawn_workers(rx, queue.clone(), handler, self.retry, self.workers);
        info!(workers = workers.len(), "ledger runtime started");

        LedgerRuntime {
            service: LedgerService::new(self.store.clone(), queue.clone()),
            reporter: Reporter::new(self.store.clone()),
            store: self.store,
            queue,
            workers,
        }
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

pub struct LedgerRuntime {
    service: LedgerService,
    reporter: Reporter,
    store: LedgerStore,
    queue: TaskQueue,
    workers: Vec<JoinHandle<()>>,
}

impl LedgerRuntime {
    pub fn builder(store: LedgerStore) -> RuntimeBuilder {
        RuntimeBuilder {
            store,
            external: None,
            alerter: None,
            guard: None,
            retry: RetryPolicy::default(),
            workers: 4,
        }
    }

    /// Open the configured database and start the worker pool
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let store = LedgerStore::open(&settings.database_path)
            .with_context(|| format!("Failed to open database {}", settings.database_path.display()))?;
        let external = settings
            .external_ledger()
            .context("Failed to build ERP client")?;

        Ok(Self::builder(store.clone())
            .external(external)
            .guard(settings.concurrency_guard(&store))
            .retry_policy(settings.retry)
            .workers(settings.workers)
            .start())
    }

    pub fn service(&self) -> &LedgerService {
        &self.service
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn request_recalculation_all(&self, kind: OwnerKind) -> LedgerResult<usize> {
        let owners = self.service.owners(kind)?;
        for owner in &owners {
            self.service.request_recalculation(kind, owner.id)?;
        }
        Ok(owners.len())
    }

    /// Wait until every queued consequence (recalculation, sync, retries) has settled
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub async fn shutdown(self) {
        self.queue.wait_idle().await;
        for worker in &self.workers {
            worker.abort();
        }
        info!("ledger runtime stopped");
    }
}
