//! Repository for the `jobs` table.
//!
//! Every mutation after submission is a single conditional `UPDATE`
//! guarded on `state = 'active'`, so a terminal state can never be
//! overwritten and progress can never move backwards.

use chrono::Utc;
use sqlx::SqlitePool;
use vox_core::types::{JobKind, JobState};

use crate::models::job::{Job, JobListQuery, JobRow, NewJob};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    seq, id, kind, state, payload, progress, attempts_made, \
    result, failure_reason, request_id, worker_id, \
    created_at, updated_at, claimed_at, finished_at";

/// Maximum page size for job listing.
const MAX_LIMIT: i64 = 100;

/// Default page size for job listing.
const DEFAULT_LIMIT: i64 = 50;

/// Provides the job record operations used by the queue, the workers, and
/// the job API.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new job in `waiting` state.
    pub async fn insert(pool: &SqlitePool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let now = db_now();
        let query = format!(
            "INSERT INTO jobs (id, kind, state, payload, request_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(&input.id)
            .bind(input.kind.as_str())
            .bind(JobState::Waiting.as_str())
            .bind(input.payload.to_string())
            .bind(&input.request_id)
            .bind(&now)
            .bind(&now)
            .fetch_one(pool)
            .await?;
        decode(row)
    }

    /// Atomically claim the oldest waiting job of a kind.
    ///
    /// The select and the state change happen in one statement, and SQLite
    /// serializes writers, so a job can be claimed by at most one worker.
    /// Increments `attempts_made`.
    pub async fn claim_next(
        pool: &SqlitePool,
        kind: JobKind,
        worker_id: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let now = db_now();
        let query = format!(
            "UPDATE jobs \
             SET state = ?, attempts_made = attempts_made + 1, worker_id = ?, \
                 claimed_at = ?, updated_at = ? \
             WHERE seq = ( \
                 SELECT seq FROM jobs \
                 WHERE kind = ? AND state = ? \
                 ORDER BY seq ASC \
                 LIMIT 1 \
             ) AND state = ? \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(JobState::Active.as_str())
            .bind(worker_id)
            .bind(&now)
            .bind(&now)
            .bind(kind.as_str())
            .bind(JobState::Waiting.as_str())
            .bind(JobState::Waiting.as_str())
            .fetch_optional(pool)
            .await?;
        row.map(decode).transpose()
    }

    /// Raise an active job's progress.
    ///
    /// Returns `false` (and changes nothing) when the job is not active or
    /// the new value does not exceed the stored one.
    pub async fn update_progress(
        pool: &SqlitePool,
        job_id: &str,
        progress: f64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET progress = ?, updated_at = ? \
             WHERE id = ? AND state = ? AND (progress IS NULL OR progress < ?)",
        )
        .bind(progress)
        .bind(db_now())
        .bind(job_id)
        .bind(JobState::Active.as_str())
        .bind(progress)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark an active job completed with its result. Sets progress to 100.
    ///
    /// Returns `false` if the job was not active.
    pub async fn complete(
        pool: &SqlitePool,
        job_id: &str,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let now = db_now();
        let outcome = sqlx::query(
            "UPDATE jobs \
             SET state = ?, result = ?, progress = 100, updated_at = ?, finished_at = ? \
             WHERE id = ? AND state = ?",
        )
        .bind(JobState::Completed.as_str())
        .bind(result.to_string())
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .bind(JobState::Active.as_str())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Mark an active job failed with a reason.
    ///
    /// No automatic retry is performed. Returns `false` if the job was not
    /// active.
    pub async fn fail(pool: &SqlitePool, job_id: &str, reason: &str) -> Result<bool, sqlx::Error> {
        let now = db_now();
        let outcome = sqlx::query(
            "UPDATE jobs \
             SET state = ?, failure_reason = ?, updated_at = ?, finished_at = ? \
             WHERE id = ? AND state = ?",
        )
        .bind(JobState::Failed.as_str())
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .bind(JobState::Active.as_str())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Fail every job still marked active, returning their ids.
    ///
    /// Called once at startup: an active job with no live worker was
    /// orphaned by a previous process.
    pub async fn fail_orphaned(pool: &SqlitePool, reason: &str) -> Result<Vec<String>, sqlx::Error> {
        let now = db_now();
        sqlx::query_scalar::<_, String>(
            "UPDATE jobs \
             SET state = ?, failure_reason = ?, updated_at = ?, finished_at = ? \
             WHERE state = ? \
             RETURNING id",
        )
        .bind(JobState::Failed.as_str())
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(JobState::Active.as_str())
        .fetch_all(pool)
        .await
    }

    /// Find a job by its id.
    pub async fn find_by_id(pool: &SqlitePool, job_id: &str) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id)
            .fetch_optional(pool)
            .await?;
        row.map(decode).transpose()
    }

    /// List jobs, newest first, with optional kind/state filters.
    pub async fn list(pool: &SqlitePool, params: &JobListQuery) -> Result<Vec<Job>, sqlx::Error> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = params.offset.unwrap_or(0).max(0);

        let mut conditions: Vec<&str> = Vec::new();
        if params.kind.is_some() {
            conditions.push("kind = ?");
        }
        if params.state.is_some() {
            conditions.push("state = ?");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {COLUMNS} FROM jobs {where_clause} ORDER BY seq DESC LIMIT ? OFFSET ?"
        );
        let mut q = sqlx::query_as::<_, JobRow>(&query);
        if let Some(kind) = params.kind {
            q = q.bind(kind.as_str());
        }
        if let Some(state) = params.state {
            q = q.bind(state.as_str());
        }
        let rows = q.bind(limit).bind(offset).fetch_all(pool).await?;
        rows.into_iter().map(decode).collect()
    }

    /// Number of jobs waiting in a kind's queue.
    pub async fn count_waiting(pool: &SqlitePool, kind: JobKind) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE kind = ? AND state = ?")
            .bind(kind.as_str())
            .bind(JobState::Waiting.as_str())
            .fetch_one(pool)
            .await
    }

    /// Delete all but the `keep` most recently finished jobs of a kind in
    /// the given terminal state. Returns the number of rows deleted.
    ///
    /// Non-terminal states are never pruned.
    pub async fn prune_terminal(
        pool: &SqlitePool,
        kind: JobKind,
        state: JobState,
        keep: u32,
    ) -> Result<u64, sqlx::Error> {
        if !state.is_terminal() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM jobs \
             WHERE kind = ? AND state = ? AND seq NOT IN ( \
                 SELECT seq FROM jobs \
                 WHERE kind = ? AND state = ? \
                 ORDER BY finished_at DESC, seq DESC \
                 LIMIT ? \
             )",
        )
        .bind(kind.as_str())
        .bind(state.as_str())
        .bind(kind.as_str())
        .bind(state.as_str())
        .bind(i64::from(keep))
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Current time as fixed-width RFC 3339 text, so lexical order matches
/// chronological order in `ORDER BY`.
fn db_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn decode(row: JobRow) -> Result<Job, sqlx::Error> {
    Job::try_from(row).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}
