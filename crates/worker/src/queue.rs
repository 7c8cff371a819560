//! Durable per-kind FIFO queue on top of the job record store.
//!
//! A job is "pending" while its record is `waiting`; dequeueing is the
//! store's atomic claim. Enqueue also wakes one idle worker of the kind so
//! new work does not wait for the next poll tick.

use tokio::sync::Notify;
use vox_core::payload::JobPayload;
use vox_core::types::{new_job_id, JobId, JobKind};
use vox_db::models::job::{Job, NewJob};
use vox_db::repositories::JobRepo;
use vox_db::DbPool;

use crate::error::WorkerError;

/// Submission and claim entry points for the per-kind queues.
pub struct JobQueue {
    pool: DbPool,
    prep_signal: Notify,
    train_signal: Notify,
}

impl JobQueue {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            prep_signal: Notify::new(),
            train_signal: Notify::new(),
        }
    }

    /// The underlying job store.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Validate a payload and append a new `waiting` job to its kind's queue.
    ///
    /// Returns as soon as the record is stored; execution happens later on a
    /// worker. Invalid payloads are rejected here and never inserted.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        request_id: Option<String>,
    ) -> Result<JobId, WorkerError> {
        let payload = JobPayload::parse(kind, payload)?;
        let input = NewJob {
            id: new_job_id(),
            kind,
            payload: payload.to_value()?,
            request_id,
        };

        let job = JobRepo::insert(&self.pool, &input).await?;
        self.signal(kind).notify_one();

        tracing::info!(job_id = %job.id, kind = %kind, "Job enqueued");
        Ok(job.id)
    }

    /// Atomically claim the oldest waiting job of a kind, if any.
    pub async fn dequeue(&self, kind: JobKind, worker_id: &str) -> Result<Option<Job>, WorkerError> {
        Ok(JobRepo::claim_next(&self.pool, kind, worker_id).await?)
    }

    /// Resolve when a job of this kind has been enqueued since the last
    /// wake-up. Stored permits make a notification sent while no worker was
    /// waiting still count.
    pub async fn wait_for_work(&self, kind: JobKind) {
        self.signal(kind).notified().await;
    }

    /// Number of jobs waiting in a kind's queue.
    pub async fn depth(&self, kind: JobKind) -> Result<i64, WorkerError> {
        Ok(JobRepo::count_waiting(&self.pool, kind).await?)
    }

    fn signal(&self, kind: JobKind) -> &Notify {
        match kind {
            JobKind::Prep => &self.prep_signal,
            JobKind::Train => &self.train_signal,
        }
    }
}
