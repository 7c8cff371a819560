//! Handlers for the jobs resource.
//!
//! Thin wrappers around [`JobService`](crate::service::JobService): extract,
//! delegate, wrap the result in the response envelope.

use std::convert::Infallible;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use vox_core::types::{JobId, JobKind};
use vox_db::models::job::JobListQuery;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::service::DEFAULT_TAIL_LINES;
use crate::state::AppState;

/// Header carrying the offset to use for the next incremental log read.
pub const LOG_NEXT_OFFSET_HEADER: HeaderName = HeaderName::from_static("x-log-next-offset");

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Deserialize)]
pub struct LogTailParams {
    pub lines: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LogRangeParams {
    pub offset: Option<u64>,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/prep
pub async fn submit_prep(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    submit(state, JobKind::Prep, &headers, payload).await
}

/// POST /api/v1/jobs/train
pub async fn submit_train(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    submit(state, JobKind::Train, &headers, payload).await
}

/// Returns 201 with the new job id; the job starts `waiting`.
async fn submit(
    state: AppState,
    kind: JobKind,
    headers: &HeaderMap,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> AppResult<(StatusCode, Json<DataResponse<SubmitResponse>>)> {
    let Json(payload) = payload?;
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let job_id = state.jobs.submit(kind, payload, request_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: SubmitResponse { job_id },
        }),
    ))
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// Supports optional `kind`, `state`, `limit`, and `offset` query parameters.
pub async fn list_jobs(
    State(state): State<AppState>,
    params: Result<Query<JobListQuery>, QueryRejection>,
) -> AppResult<impl IntoResponse> {
    let Query(params) = params?;
    let jobs = state.jobs.list(&params).await?;
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let snapshot = state.jobs.get_status(&job_id).await?;
    Ok(Json(DataResponse { data: snapshot }))
}

/// GET /api/v1/jobs/{id}/metrics
pub async fn get_metrics(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let metrics = state.jobs.training_metrics(&job_id).await?;
    Ok(Json(DataResponse { data: metrics }))
}

// ---------------------------------------------------------------------------
// Progress stream
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}/progress
///
/// Server-sent events named `progress`, `completed`, or `failed`, each
/// carrying the JSON event. The stream closes after the terminal event,
/// when the client disconnects, or when the server shuts down.
pub async fn stream_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let events = state.jobs.stream_progress(&job_id).await?;
    tracing::debug!(job_id = %job_id, "Progress stream opened");

    let stream = events
        .take_until(state.shutdown.clone().cancelled_owned())
        .filter_map(|event| async move {
            match Event::default().event(event.event_name()).json_data(&event) {
                Ok(sse) => Some(Ok::<_, Infallible>(sse)),
                Err(e) => {
                    tracing::warn!(job_id = %event.job_id, error = %e, "Failed to encode progress event");
                    None
                }
            }
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}/logs?lines=N
///
/// Plain-text tail of the job log, 200 lines unless `lines` is given.
pub async fn get_log_tail(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    params: Result<Query<LogTailParams>, QueryRejection>,
) -> AppResult<impl IntoResponse> {
    let Query(params) = params?;
    let lines = params.lines.unwrap_or(DEFAULT_TAIL_LINES);
    let tail = state.jobs.get_log_tail(&job_id, lines).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], tail))
}

/// GET /api/v1/jobs/{id}/logs/range?offset=N
///
/// Raw bytes appended since `offset` (default 0), at most
/// [`MAX_RANGE_BYTES`](vox_core::job_log::MAX_RANGE_BYTES) per response. The
/// `x-log-next-offset` header holds the offset for the next poll.
pub async fn get_log_range(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    params: Result<Query<LogRangeParams>, QueryRejection>,
) -> AppResult<impl IntoResponse> {
    let Query(params) = params?;
    let chunk = state.jobs.get_log_range(&job_id, params.offset.unwrap_or(0)).await?;

    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        ),
        (LOG_NEXT_OFFSET_HEADER, HeaderValue::from(chunk.next_offset)),
    ];
    Ok((headers, chunk.data))
}
