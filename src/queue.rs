// 📬 Task Queue - background jobs consumed by a worker pool
//
// Mutations enqueue and return immediately. Workers share one receiver and
// run jobs concurrently; a failed job is re-enqueued after an exponential
// backoff until its attempts run out, then the handler's final-failure hook
// fires (sync jobs raise an alert there).
//
// The queue counts in-flight jobs (queued, running or waiting to retry) so
// callers can wait until every consequence of their mutations has settled.

use crate::entities::{OwnerId, OwnerKind};
use crate::error::{LedgerError, LedgerResult};
use crate::sync::{ExternalError, SyncTask};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

// ============================================================================
// JOBS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Recalculate { kind: OwnerKind, owner_id: OwnerId },
    Sync(SyncTask),
}

impl Job {
    pub fn label(&self) -> &'static str {
        match self {
            Job::Recalculate { .. } => "recalculate",
            Job::Sync(SyncTask::Upsert(_)) => "sync_upsert",
            Job::Sync(SyncTask::Delete(_)) => "sync_delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub job: Job,

    /// Attempts already made (0 on first delivery)
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Worth retrying (I/O, busy database, external system down)
    #[error("transient: {0}")]
    Transient(String),

    /// Will fail the same way every time
    #[error("permanent: {0}")]
    Permanent(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }
}

impl From<LedgerError> for JobError {
    fn from(err: LedgerError) -> Self {
        if err.is_permanent() {
            JobError::Permanent(err.to_string())
        } else {
            JobError::Transient(err.to_string())
        }
    }
}

impl From<ExternalError> for JobError {
    fn from(err: ExternalError) -> Self {
        JobError::Transient(err.to_string())
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt + 1` (doubling, capped)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn should_retry(&self, attempts_made: u32, err: &JobError) -> bool {
        err.is_retryable() && attempts_made < self.max_attempts
    }
}

// ============================================================================
// HANDLER
// ============================================================================

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;

    /// Called once when a job is given up on
    fn on_final_failure(&self, job: &Job, attempts: u32, err: &JobError);
}

// ============================================================================
// QUEUE
// ============================================================================

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TaskQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = TaskQueue {
            tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        };
        (queue, rx)
    }

    pub fn enqueue(&self, job: Job) -> LedgerResult<()> {
        debug!(job = job.label(), "job enqueued");
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Envelope { job, attempt: 0 }).is_err() {
            self.complete();
            return Err(LedgerError::QueueClosed);
        }
        Ok(())
    }

    /// Put a job back for another attempt. It stays counted as in flight.
    fn requeue(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            warn!("queue closed, dropping retried job");
            self.complete();
        }
    }

    fn complete(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no job is queued, running or waiting for a retry
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// WORKER POOL
// ============================================================================

pub fn spawn_workers(
    rx: mpsc::UnboundedReceiver<Envelope>,
    queue: TaskQueue,
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
    worker_count: usize,
) -> Vec<JoinHandle<()>> {
    let shared_rx = Arc::new(Mutex::new(rx));
    let workers = worker_count.max(1);

    (0..workers)
        .map(|i| {
            let rx = Arc::clone(&shared_rx);
            let queue = queue.clone();
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                loop {
                    let envelope_opt = { rx.lock().await.recv().await };
                    let Some(envelope) = envelope_opt else {
                        break;
                    };
                    process(i, envelope, &queue, handler.as_ref(), policy).await;
                }
                debug!(worker = i, "worker stopped");
            })
        })
        .collect()
}

async fn process(
    worker: usize,
    mut envelope: Envelope,
    queue: &TaskQueue,
    handler: &dyn JobHandler,
    policy: RetryPolicy,
) {
    let result = handler.handle(&envelope.job).await;
    envelope.attempt += 1;

    match result {
        Ok(()) => queue.complete(),
        Err(err) if policy.should_retry(envelope.attempt, &err) => {
            let delay = policy.backoff(envelope.attempt - 1);
            warn!(
                worker,
                job = envelope.job.label(),
                attempt = envelope.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "job failed, retrying"
            );

            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.requeue(envelope);
            });
        }
        Err(err) => {
            error!(
                worker,
                job = envelope.job.label(),
                attempts = envelope.attempt,
                error = %err,
                "job failed permanently"
            );
            handler.on_final_failure(&envelope.job, envelope.attempt, &err);
            queue.complete();
        }
    }
}
