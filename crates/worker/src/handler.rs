//! The handler protocol between a worker and the code that does a job's work.
//!
//! A [`JobHandler`] runs to completion and either returns a result value or
//! fails. While running it may report progress any number of times through
//! the [`ProgressReporter`]; out-of-range or decreasing values are clamped
//! or ignored, never turned into errors.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use vox_core::job_log::{JobLogError, JobLogSink};
use vox_core::progress::next_progress;
use vox_core::types::{JobId, JobKind};
use vox_db::repositories::JobRepo;
use vox_db::DbPool;
use vox_events::{JobEvent, ProgressEventBus};

/// Everything a handler knows about the job it is executing.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub kind: JobKind,
    /// The validated submission payload.
    pub payload: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: i64,
    /// Request id of the submission, when one was recorded.
    pub request_id: Option<String>,
    /// Sink for the job's process output.
    pub logs: Arc<JobLogSink>,
}

/// Ways a handler can fail. The `Display` text becomes the job's
/// `failureReason`.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{kind} process {status}{}", tail_suffix(.output_tail))]
    Exited {
        kind: JobKind,
        /// `exited with code N` or `was terminated by a signal`.
        status: String,
        /// Last lines of the job log at exit.
        output_tail: String,
    },

    #[error("invalid {kind} payload: {message}")]
    InvalidPayload { kind: JobKind, message: String },

    #[error("process output error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Log(#[from] JobLogError),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

fn tail_suffix(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\n{tail}")
    }
}

/// Work performed for one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job. The returned value is stored as the job's result.
    async fn run(
        &self,
        ctx: &JobContext,
        progress: &ProgressReporter,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Progress callback handed to a handler for the duration of one attempt.
///
/// Each accepted value is written to the job store first and then published
/// on the event bus, under a lock, so observers see values in
/// non-decreasing order.
pub struct ProgressReporter {
    job_id: JobId,
    pool: DbPool,
    bus: Arc<ProgressEventBus>,
    last: Mutex<Option<f64>>,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<JobId>, pool: DbPool, bus: Arc<ProgressEventBus>) -> Self {
        Self {
            job_id: job_id.into(),
            pool,
            bus,
            last: Mutex::new(None),
        }
    }

    /// Report a progress value in `0..=100`.
    ///
    /// Returns the value that was recorded, or `None` when it was ignored
    /// (not higher than the current progress, not finite, or the job is no
    /// longer active). Store errors are logged, never propagated.
    pub async fn report(&self, value: f64) -> Option<f64> {
        let mut last = self.last.lock().await;
        let next = next_progress(*last, value)?;

        match JobRepo::update_progress(&self.pool, &self.job_id, next).await {
            Ok(true) => {
                *last = Some(next);
                self.bus.publish(JobEvent::progress(self.job_id.clone(), next));
                tracing::debug!(job_id = %self.job_id, progress = next, "Job progress");
                Some(next)
            }
            Ok(false) => {
                tracing::debug!(
                    job_id = %self.job_id,
                    progress = next,
                    "Progress ignored, job not active or already further along",
                );
                None
            }
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to record job progress");
                None
            }
        }
    }

    /// Highest value recorded so far by this reporter.
    pub async fn current(&self) -> Option<f64> {
        *self.last.lock().await
    }
}
