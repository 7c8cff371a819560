#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use vox_api::config::ServerConfig;
use vox_api::router::build_app_router;
use vox_api::service::JobService;
use vox_api::state::AppState;
use vox_core::job_log::JobLogSink;
use vox_events::ProgressEventBus;
use vox_worker::JobQueue;

/// Everything a test needs to drive the API and poke at its collaborators.
pub struct TestApp {
    pub app: Router,
    pub queue: Arc<JobQueue>,
    pub bus: Arc<ProgressEventBus>,
    pub logs: Arc<JobLogSink>,
    pub jobs: Arc<JobService>,
    _dir: tempfile::TempDir,
}

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        database_url: "sqlite::memory:".to_string(),
    }
}

/// Build the full application router over an in-memory job store. No worker
/// pool is started; tests drive job state directly.
pub async fn build_test_app() -> TestApp {
    let pool = vox_db::create_in_memory_pool().await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let queue = Arc::new(JobQueue::new(pool.clone()));
    let bus = Arc::new(ProgressEventBus::default());
    let logs = Arc::new(JobLogSink::new(dir.path().join("logs")));
    let jobs = Arc::new(JobService::new(
        Arc::clone(&queue),
        Arc::clone(&bus),
        Arc::clone(&logs),
    ));

    let config = test_config();
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        jobs: Arc::clone(&jobs),
        shutdown: CancellationToken::new(),
    };

    TestApp {
        app: build_app_router(state, &config),
        queue,
        bus,
        logs,
        jobs,
        _dir: dir,
    }
}

pub async fn get(app: &Router, uri: &str) -> Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn get_with_header(app: &Router, uri: &str, name: &str, value: &str) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .header(name, value)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> Response {
    post_raw(app, uri, body.to_string()).await
}

pub async fn post_raw(app: &Router, uri: &str, body: String) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_text(response: Response) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
