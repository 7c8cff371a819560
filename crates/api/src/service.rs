//! The job API: submission, status queries, live progress, and log access.
//!
//! HTTP handlers are thin wrappers around [`JobService`]. Nothing here waits
//! on job execution; submission returns as soon as the job is queued.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use vox_core::error::CoreError;
use vox_core::job_log::{JobLogError, JobLogSink, LogChunk};
use vox_core::metrics::{parse_training_metrics, TrainingMetrics, METRICS_TAIL_BYTES};
use vox_core::types::{JobId, JobKind, JobState};
use vox_db::models::job::{Job, JobListQuery, JobSnapshot};
use vox_db::repositories::JobRepo;
use vox_events::{JobEvent, ProgressEventBus, Subscription};
use vox_worker::JobQueue;

use crate::error::AppResult;

/// Lines returned by a log tail request that does not specify a count.
pub const DEFAULT_TAIL_LINES: usize = 200;

/// Upper bound on lines returned by one log tail request.
pub const MAX_TAIL_LINES: usize = 5000;

/// Jobs waiting to be claimed, per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaitingCounts {
    pub prep: i64,
    pub train: i64,
}

pub struct JobService {
    queue: Arc<JobQueue>,
    bus: Arc<ProgressEventBus>,
    logs: Arc<JobLogSink>,
}

impl JobService {
    pub fn new(queue: Arc<JobQueue>, bus: Arc<ProgressEventBus>, logs: Arc<JobLogSink>) -> Self {
        Self { queue, bus, logs }
    }

    /// Validate and enqueue a job. Returns its id.
    pub async fn submit(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        request_id: Option<String>,
    ) -> AppResult<JobId> {
        Ok(self.queue.enqueue(kind, payload, request_id).await?)
    }

    pub async fn get_status(&self, job_id: &str) -> AppResult<JobSnapshot> {
        Ok(self.find(job_id).await?.into())
    }

    /// List jobs, newest first.
    pub async fn list(&self, params: &JobListQuery) -> AppResult<Vec<JobSnapshot>> {
        let jobs = JobRepo::list(self.queue.pool(), params).await?;
        Ok(jobs.into_iter().map(JobSnapshot::from).collect())
    }

    pub async fn waiting_counts(&self) -> AppResult<WaitingCounts> {
        Ok(WaitingCounts {
            prep: self.queue.depth(JobKind::Prep).await?,
            train: self.queue.depth(JobKind::Train).await?,
        })
    }

    /// Number of jobs someone is currently streaming progress for.
    pub fn watched_jobs(&self) -> usize {
        self.bus.watched_jobs()
    }

    /// Open a progress stream for a job.
    ///
    /// The subscription is registered before the job state is read, so no
    /// event published after that read can be missed. A job that is already
    /// terminal yields exactly one synthesized final event.
    pub async fn stream_progress(&self, job_id: &str) -> AppResult<ProgressStream> {
        let subscription = self.bus.subscribe(job_id);
        let job = self.find(job_id).await?;

        let stream = match final_event(&job) {
            Some(event) => ProgressStream::Finished(Some(event)),
            None => ProgressStream::Live(subscription),
        };
        Ok(stream)
    }

    /// Last `lines` lines of a job's log.
    pub async fn get_log_tail(&self, job_id: &str, lines: usize) -> AppResult<String> {
        Ok(self.logs.read_tail(job_id, lines.min(MAX_TAIL_LINES)).await?)
    }

    /// Bytes appended to a job's log at or after `offset`.
    pub async fn get_log_range(&self, job_id: &str, offset: u64) -> AppResult<LogChunk> {
        Ok(self.logs.read_range(job_id, offset).await?)
    }

    /// Latest step and loss values from the end of a job's log.
    ///
    /// A job that has not written any output yet has empty metrics.
    pub async fn training_metrics(&self, job_id: &str) -> AppResult<TrainingMetrics> {
        self.find(job_id).await?;
        match self.logs.read_tail_bytes(job_id, METRICS_TAIL_BYTES).await {
            Ok(tail) => Ok(parse_training_metrics(&tail)),
            Err(JobLogError::NotFound(_)) => Ok(TrainingMetrics::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, job_id: &str) -> AppResult<Job> {
        JobRepo::find_by_id(self.queue.pool(), job_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound {
                    entity: "Job",
                    id: job_id.to_string(),
                }
                .into()
            })
    }
}

/// The event a late observer of a finished job receives.
fn final_event(job: &Job) -> Option<JobEvent> {
    match job.state {
        JobState::Completed => Some(JobEvent::completed(
            job.id.clone(),
            job.result.clone().unwrap_or(serde_json::Value::Null),
        )),
        JobState::Failed => Some(JobEvent::failed(
            job.id.clone(),
            job.failure_reason.clone().unwrap_or_default(),
        )),
        JobState::Waiting | JobState::Active => None,
    }
}

/// Events for one job, ending after the terminal event.
///
/// Dropping the stream releases the underlying subscription.
pub enum ProgressStream {
    Live(Subscription),
    Finished(Option<JobEvent>),
}

impl Stream for ProgressStream {
    type Item = JobEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobEvent>> {
        match self.get_mut() {
            ProgressStream::Live(subscription) => Pin::new(subscription).poll_next(cx),
            ProgressStream::Finished(event) => Poll::Ready(event.take()),
        }
    }
}
