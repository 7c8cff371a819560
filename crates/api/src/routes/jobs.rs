//! Route definitions for the jobs resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;

/// Routes mounted under `/api/v1`.
///
/// ```text
/// GET    /jobs                   -> list_jobs
/// POST   /jobs/prep              -> submit_prep
/// POST   /jobs/train             -> submit_train
/// GET    /jobs/{id}              -> get_job
/// GET    /jobs/{id}/progress     -> stream_progress (SSE)
/// GET    /jobs/{id}/logs         -> get_log_tail
/// GET    /jobs/{id}/logs/range   -> get_log_range
/// GET    /jobs/{id}/metrics      -> get_metrics
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/prep", post(jobs::submit_prep))
        .route("/jobs/train", post(jobs::submit_train))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/progress", get(jobs::stream_progress))
        .route("/jobs/{id}/logs", get(jobs::get_log_tail))
        .route("/jobs/{id}/logs/range", get(jobs::get_log_range))
        .route("/jobs/{id}/metrics", get(jobs::get_metrics))
}
