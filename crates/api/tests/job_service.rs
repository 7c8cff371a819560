//! Job API behaviour against a running worker pool.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use vox_api::error::AppError;
use vox_api::service::ProgressStream;
use vox_core::error::CoreError;
use vox_core::types::{JobKind, JobState};
use vox_events::JobEvent;
use vox_worker::{
    HandlerError, JobContext, JobHandler, ProgressReporter, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle,
};

/// Waits for the test to open the gate, then reports a fixed sequence.
struct GatedHandler {
    gate: Arc<Notify>,
    steps: Vec<f64>,
    fail_with: Option<&'static str>,
}

#[async_trait]
impl JobHandler for GatedHandler {
    async fn run(
        &self,
        _ctx: &JobContext,
        progress: &ProgressReporter,
    ) -> Result<serde_json::Value, HandlerError> {
        self.gate.notified().await;
        for step in &self.steps {
            progress.report(*step).await;
        }
        match self.fail_with {
            Some(reason) => Err(HandlerError::Failed(reason.to_string())),
            None => Ok(json!({ "outputPath": "runs/r1" })),
        }
    }
}

async fn collect(stream: ProgressStream) -> Vec<JobEvent> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("stream should end after the terminal event")
}

async fn start_pool(t: &common::TestApp, handler: GatedHandler) -> WorkerPoolHandle {
    let config = WorkerPoolConfig {
        prep_workers: 0,
        train_workers: 1,
        poll_interval: Duration::from_millis(25),
        ..Default::default()
    };
    WorkerPool::new(config, t.queue.clone(), t.bus.clone(), t.logs.clone())
        .with_handler(JobKind::Train, Arc::new(handler))
        .start(CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn observers_share_the_sequence_and_late_observer_gets_final_event() {
    let t = common::build_test_app().await;
    let gate = Arc::new(Notify::new());
    let workers = start_pool(
        &t,
        GatedHandler {
            gate: gate.clone(),
            steps: vec![10.0, 40.0, 25.0, 80.0],
            fail_with: None,
        },
    )
    .await;

    let id = t
        .jobs
        .submit(JobKind::Train, json!({ "configPath": "c.json" }), None)
        .await
        .unwrap();

    let first = t.jobs.stream_progress(&id).await.unwrap();
    let second = t.jobs.stream_progress(&id).await.unwrap();
    assert!(matches!(first, ProgressStream::Live(_)));
    assert_eq!(t.bus.subscriber_count(&id), 2);

    gate.notify_one();
    let (a, b) = tokio::join!(collect(first), collect(second));

    assert_eq!(a, b, "both observers see the same events in the same order");
    let progress: Vec<f64> = a.iter().filter(|e| !e.is_terminal()).filter_map(|e| e.progress).collect();
    assert_eq!(progress, vec![10.0, 40.0, 80.0]);
    let last = a.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.result, Some(json!({ "outputPath": "runs/r1" })));

    let status = t.jobs.get_status(&id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.progress, Some(100.0));

    let late = t.jobs.stream_progress(&id).await.unwrap();
    assert!(matches!(late, ProgressStream::Finished(Some(_))));
    let events = collect(late).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].completed);
    assert_eq!(events[0].job_id, id);
    assert_eq!(t.bus.watched_jobs(), 0);

    assert!(workers.shutdown(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn failed_job_is_reported_to_observers_and_status() {
    let t = common::build_test_app().await;
    let gate = Arc::new(Notify::new());
    let workers = start_pool(
        &t,
        GatedHandler {
            gate: gate.clone(),
            steps: vec![5.0],
            fail_with: Some("train process exited with code 1"),
        },
    )
    .await;

    let id = t
        .jobs
        .submit(JobKind::Train, json!({ "configPath": "c.json" }), None)
        .await
        .unwrap();
    let stream = t.jobs.stream_progress(&id).await.unwrap();
    gate.notify_one();

    let events = collect(stream).await;
    let last = events.last().unwrap();
    assert!(last.failed);
    assert_eq!(last.reason.as_deref(), Some("train process exited with code 1"));

    let status = t.jobs.get_status(&id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts_made, 1);
    assert_eq!(status.failure_reason.as_deref(), Some("train process exited with code 1"));

    let late = collect(t.jobs.stream_progress(&id).await.unwrap()).await;
    assert_eq!(late.len(), 1);
    assert!(late[0].failed);

    assert!(workers.shutdown(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let t = common::build_test_app().await;

    assert_matches!(
        t.jobs.get_status("missing").await,
        Err(AppError::Core(CoreError::NotFound { entity: "Job", .. }))
    );
    assert!(matches!(
        t.jobs.stream_progress("missing").await,
        Err(AppError::Core(CoreError::NotFound { .. }))
    ));
    assert_matches!(t.jobs.training_metrics("missing").await, Err(AppError::Core(_)));
    assert_matches!(t.jobs.get_log_tail("missing", 10).await, Err(AppError::Log(_)));
    assert_eq!(t.bus.watched_jobs(), 0);
}

#[tokio::test]
async fn submit_returns_before_execution_and_job_is_observable() {
    let t = common::build_test_app().await;
    let id = t
        .jobs
        .submit(JobKind::Train, json!({ "configPath": "c.json" }), Some("req-1".into()))
        .await
        .unwrap();

    // No pool is running, so the job stays queued.
    let status = t.jobs.get_status(&id).await.unwrap();
    assert_eq!(status.state, JobState::Waiting);
    assert_eq!(status.progress, None);

    assert_matches!(
        t.jobs.submit(JobKind::Train, json!({}), None).await,
        Err(AppError::Core(CoreError::InvalidPayload(_)))
    );
}
