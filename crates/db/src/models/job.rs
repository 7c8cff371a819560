//! Job record models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use vox_core::error::CoreError;
use vox_core::types::{JobId, JobKind, JobState, Timestamp};

/// A raw row from the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub seq: i64,
    pub id: String,
    pub kind: String,
    pub state: String,
    pub payload: String,
    pub progress: Option<f64>,
    pub attempts_made: i64,
    pub result: Option<String>,
    pub failure_reason: Option<String>,
    pub request_id: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

/// A decoded job record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub payload: serde_json::Value,
    pub progress: Option<f64>,
    pub attempts_made: i64,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub request_id: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            CoreError::Internal(format!("Corrupt {what} on job {}: {e}", row.id))
        };

        let kind = row.kind.parse::<JobKind>().map_err(|e| corrupt("kind", &e))?;
        let state = row.state.parse::<JobState>().map_err(|e| corrupt("state", &e))?;
        let payload: serde_json::Value = serde_json::from_str(&row.payload).map_err(|e| corrupt("payload", &e))?;
        let result: Option<serde_json::Value> = row
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("result", &e))?;

        Ok(Job {
            id: row.id,
            kind,
            state,
            payload,
            progress: row.progress,
            attempts_made: row.attempts_made,
            result,
            failure_reason: row.failure_reason,
            request_id: row.request_id,
            worker_id: row.worker_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            claimed_at: row.claimed_at,
            finished_at: row.finished_at,
        })
    }
}

/// The externally visible view of a job returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub attempts_made: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl From<Job> for JobSnapshot {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            state: job.state,
            progress: job.progress,
            attempts_made: job.attempts_made,
            result: job.result,
            failure_reason: job.failure_reason,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Input for inserting a new waiting job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub request_id: Option<String>,
}

/// Query parameters for listing jobs.
#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    /// Filter by kind.
    pub kind: Option<JobKind>,
    /// Filter by state.
    pub state: Option<JobState>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}
