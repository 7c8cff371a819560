//! Fixed-size worker pool, one group of workers per job kind.
//!
//! Each worker is a long-lived Tokio task that claims the oldest waiting
//! job of its kind, runs the registered [`JobHandler`], and records the
//! outcome. A worker runs at most one job at a time, so the number of
//! active jobs of a kind never exceeds that kind's worker count.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vox_core::error::CoreError;
use vox_core::job_log::JobLogSink;
use vox_core::types::{JobKind, JobState};
use vox_db::models::job::Job;
use vox_db::repositories::JobRepo;
use vox_events::{JobEvent, ProgressEventBus};

use crate::error::WorkerError;
use crate::handler::{HandlerError, JobContext, JobHandler, ProgressReporter};
use crate::queue::JobQueue;

/// Failure reason recorded for jobs left active by a previous process.
pub const ORPHANED_JOB_REASON: &str = "worker lost: service restarted while job was active";

/// Default polling interval used when no enqueue signal arrives.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of tries for a job's terminal write.
const DEFAULT_TERMINAL_WRITE_ATTEMPTS: u32 = 5;

/// Delay before the first retry of a terminal write; doubles per retry.
const DEFAULT_TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(250);

/// Pool sizing and retention settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub prep_workers: usize,
    pub train_workers: usize,
    /// How long an idle worker sleeps before re-checking its queue.
    pub poll_interval: Duration,
    /// Completed jobs kept per kind.
    pub keep_completed: u32,
    /// Failed jobs kept per kind.
    pub keep_failed: u32,
    /// Tries for recording a job's outcome before giving up.
    pub terminal_write_attempts: u32,
    /// Initial delay between those tries.
    pub terminal_write_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            prep_workers: 1,
            train_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            keep_completed: 50,
            keep_failed: 100,
            terminal_write_attempts: DEFAULT_TERMINAL_WRITE_ATTEMPTS,
            terminal_write_backoff: DEFAULT_TERMINAL_WRITE_BACKOFF,
        }
    }
}

impl WorkerPoolConfig {
    pub fn workers_for(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::Prep => self.prep_workers,
            JobKind::Train => self.train_workers,
        }
    }

    fn keep_for(&self, state: JobState) -> Option<u32> {
        match state {
            JobState::Completed => Some(self.keep_completed),
            JobState::Failed => Some(self.keep_failed),
            JobState::Waiting | JobState::Active => None,
        }
    }
}

/// Builder for the worker pool. Register one handler per kind, then
/// [`start`](WorkerPool::start) it.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    bus: Arc<ProgressEventBus>,
    logs: Arc<JobLogSink>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<JobQueue>,
        bus: Arc<ProgressEventBus>,
        logs: Arc<JobLogSink>,
    ) -> Self {
        Self {
            config,
            queue,
            bus,
            logs,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a kind, replacing any previous one.
    pub fn with_handler(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Recover orphaned jobs and spawn the workers.
    ///
    /// Any job still `active` in the store belongs to a process that is no
    /// longer running; it is failed before the first claim. Kinds without
    /// a registered handler get no workers and their jobs stay `waiting`.
    pub async fn start(self, cancel: CancellationToken) -> Result<WorkerPoolHandle, WorkerError> {
        let orphaned = JobRepo::fail_orphaned(self.queue.pool(), ORPHANED_JOB_REASON).await?;
        if !orphaned.is_empty() {
            tracing::warn!(count = orphaned.len(), "Failed jobs orphaned by a previous run");
        }
        for job_id in orphaned {
            self.bus.publish(JobEvent::failed(job_id, ORPHANED_JOB_REASON));
        }

        let shared = Arc::new(Shared {
            config: self.config,
            queue: self.queue,
            bus: self.bus,
            logs: self.logs,
        });

        let mut tasks = Vec::new();
        for kind in JobKind::ALL {
            let count = shared.config.workers_for(kind);
            let Some(handler) = self.handlers.get(&kind) else {
                if count > 0 {
                    tracing::warn!(kind = %kind, "No handler registered, jobs of this kind will not run");
                }
                continue;
            };

            for n in 0..count {
                let worker = Worker {
                    id: format!("{kind}-{n}"),
                    kind,
                    handler: Arc::clone(handler),
                    shared: Arc::clone(&shared),
                };
                tasks.push(tokio::spawn(worker.run(cancel.clone())));
            }
        }

        tracing::info!(
            workers = tasks.len(),
            prep_workers = shared.config.prep_workers,
            train_workers = shared.config.train_workers,
            poll_interval_ms = shared.config.poll_interval.as_millis() as u64,
            "Worker pool started",
        );

        Ok(WorkerPoolHandle { cancel, tasks })
    }
}

/// Handle to a running pool.
pub struct WorkerPoolHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Number of worker tasks spawned.
    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop claiming new jobs and wait for in-flight jobs to finish.
    ///
    /// Workers still running after `timeout` are aborted, which kills
    /// their child processes; those jobs stay `active` and are failed as
    /// orphans on the next start. Returns `true` if every worker exited
    /// within the timeout.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let aborts: Vec<_> = self.tasks.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(timeout, futures::future::join_all(self.tasks)).await {
            Ok(_) => {
                tracing::info!("Worker pool stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "Worker pool did not stop in time, aborting in-flight jobs",
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

struct Shared {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    bus: Arc<ProgressEventBus>,
    logs: Arc<JobLogSink>,
}

struct Worker {
    id: String,
    kind: JobKind,
    handler: Arc<dyn JobHandler>,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        tracing::debug!(worker_id = %self.id, "Worker started");

        while !cancel.is_cancelled() {
            match self.shared.queue.dequeue(self.kind, &self.id).await {
                Ok(Some(job)) => {
                    self.execute(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Failed to claim job");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shared.queue.wait_for_work(self.kind) => {}
                _ = tokio::time::sleep(self.shared.config.poll_interval) => {}
            }
        }

        tracing::debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn execute(&self, job: Job) {
        let ctx = JobContext {
            job_id: job.id.clone(),
            kind: job.kind,
            payload: job.payload,
            attempt: job.attempts_made,
            request_id: job.request_id,
            logs: Arc::clone(&self.shared.logs),
        };
        let reporter = ProgressReporter::new(
            job.id,
            self.shared.queue.pool().clone(),
            Arc::clone(&self.shared.bus),
        );

        tracing::info!(
            job_id = %ctx.job_id,
            kind = %ctx.kind,
            worker_id = %self.id,
            attempt = ctx.attempt,
            request_id = ctx.request_id.as_deref().unwrap_or("-"),
            "Job started",
        );

        let outcome = AssertUnwindSafe(self.handler.run(&ctx, &reporter))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

        let state = match outcome {
            Ok(result) => self.record_completed(&ctx, result).await,
            Err(e) => self.record_failed(&ctx, &e.to_string()).await,
        };

        self.shared.logs.release(&ctx.job_id);
        if let Some(state) = state {
            self.prune(state).await;
        }
    }

    async fn record_completed(&self, ctx: &JobContext, result: serde_json::Value) -> Option<JobState> {
        let pool = self.shared.queue.pool();
        let written = self
            .write_terminal(ctx, || JobRepo::complete(pool, &ctx.job_id, &result))
            .await;

        match written {
            Ok(true) => {
                tracing::info!(job_id = %ctx.job_id, kind = %ctx.kind, "Job completed");
                self.shared.bus.publish(JobEvent::completed(ctx.job_id.clone(), result));
                Some(JobState::Completed)
            }
            Ok(false) => {
                self.report_conflict(ctx);
                None
            }
            Err(e) => {
                tracing::error!(job_id = %ctx.job_id, error = %e, "Failed to record job completion");
                let reason = format!("failed to record job result: {e}");
                self.record_failed(ctx, &reason).await
            }
        }
    }

    async fn record_failed(&self, ctx: &JobContext, reason: &str) -> Option<JobState> {
        let pool = self.shared.queue.pool();
        let written = self
            .write_terminal(ctx, || JobRepo::fail(pool, &ctx.job_id, reason))
            .await;

        match written {
            Ok(true) => {
                tracing::warn!(job_id = %ctx.job_id, kind = %ctx.kind, reason, "Job failed");
                self.shared.bus.publish(JobEvent::failed(ctx.job_id.clone(), reason));
                Some(JobState::Failed)
            }
            Ok(false) => {
                self.report_conflict(ctx);
                None
            }
            Err(e) => {
                // The record stays active until orphan recovery on the next
                // start; observers still get a final event.
                tracing::error!(
                    job_id = %ctx.job_id,
                    error = %e,
                    "Failed to record job failure, job left active",
                );
                self.shared.bus.publish(JobEvent::failed(ctx.job_id.clone(), reason));
                None
            }
        }
    }

    async fn write_terminal<F, Fut>(&self, ctx: &JobContext, write: F) -> Result<bool, sqlx::Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, sqlx::Error>>,
    {
        let config = &self.shared.config;
        retry_write(
            &ctx.job_id,
            config.terminal_write_attempts,
            config.terminal_write_backoff,
            write,
        )
        .await
    }

    /// The job left `active` while this worker still held it.
    fn report_conflict(&self, ctx: &JobContext) {
        let err = CoreError::ClaimConflict(format!(
            "job {} is no longer active on worker {}",
            ctx.job_id, self.id
        ));
        tracing::error!(job_id = %ctx.job_id, error = %err, "Terminal write lost");
    }

    async fn prune(&self, state: JobState) {
        let Some(keep) = self.shared.config.keep_for(state) else {
            return;
        };
        match JobRepo::prune_terminal(self.shared.queue.pool(), self.kind, state, keep).await {
            Ok(0) => {}
            Ok(deleted) => {
                tracing::debug!(kind = %self.kind, state = %state, deleted, "Pruned old jobs");
            }
            Err(e) => {
                tracing::warn!(kind = %self.kind, error = %e, "Failed to prune old jobs");
            }
        }
    }
}

/// Run a store write up to `attempts` times, doubling `backoff` between
/// tries. Returns the first success or the last error.
async fn retry_write<T, E, F, Fut>(
    job_id: &str,
    attempts: u32,
    backoff: Duration,
    mut write: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match write().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                tracing::warn!(job_id, attempt, error = %e, "Job store write failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn retention_applies_to_terminal_states_only() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.keep_for(JobState::Completed), Some(50));
        assert_eq!(config.keep_for(JobState::Failed), Some(100));
        assert_eq!(config.keep_for(JobState::Active), None);
        assert_eq!(config.keep_for(JobState::Waiting), None);
    }

    #[tokio::test(start_paused = true)]
    async fn store_write_is_retried_until_it_succeeds() {
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let outcome: Result<bool, &str> = retry_write("job-1", 5, Duration::from_millis(100), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("database is locked")
                } else {
                    Ok(true)
                }
            }
        })
        .await;

        assert_eq!(outcome, Ok(true));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms then 200ms of backoff.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn store_write_gives_up_after_the_last_attempt() {
        let calls = AtomicUsize::new(0);
        let outcome: Result<bool, &str> = retry_write("job-1", 3, Duration::from_millis(10), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("disk I/O error") }
        })
        .await;

        assert_eq!(outcome, Err("disk I/O error"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bad state"));
        assert_eq!(panic_message(boxed.as_ref()), "bad state");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
