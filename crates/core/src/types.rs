//! Shared identifiers and lifecycle enums for jobs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Jobs are identified by an opaque string (a UUID v4 in practice).
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh, globally unique job id.
pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// The category of a job. Each kind has its own queue and handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Dataset preparation.
    Prep,
    /// Model training.
    Train,
}

impl JobKind {
    /// Every kind, in a stable order.
    pub const ALL: [JobKind; 2] = [JobKind::Prep, JobKind::Train];

    /// Storage / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Prep => "prep",
            JobKind::Train => "train",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prep" => Ok(JobKind::Prep),
            "train" => Ok(JobKind::Train),
            other => Err(CoreError::InvalidPayload(format!(
                "Unknown job kind: \"{other}\""
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state: `waiting -> active -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// Storage / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Completed and failed jobs never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(CoreError::InvalidPayload(format!(
                "Unknown job state: \"{other}\""
            ))),
        }
    }
}
