use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::service::WaitingCounts;
use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the job store does not answer.
    pub status: &'static str,
    pub version: &'static str,
    pub db_healthy: bool,
    /// Jobs waiting for a worker, per kind. Omitted when the store is down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting: Option<WaitingCounts>,
    /// Jobs with at least one open progress stream.
    pub watched_jobs: usize,
}

/// GET /health -- job store reachability and queue backlog.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let waiting = match vox_db::health_check(&state.pool).await {
        Ok(()) => state.jobs.waiting_counts().await.ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Job store health check failed");
            None
        }
    };
    let db_healthy = waiting.is_some();

    Json(HealthResponse {
        status: if db_healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        db_healthy,
        waiting,
        watched_jobs: state.jobs.watched_jobs(),
    })
}

/// Mount health check routes (root level, not under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
