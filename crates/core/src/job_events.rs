//! Event names used when relaying job lifecycle updates to observers.

/// Progress update during job execution.
pub const EVENT_JOB_PROGRESS: &str = "progress";

/// Job completed successfully.
pub const EVENT_JOB_COMPLETED: &str = "completed";

/// Job failed.
pub const EVENT_JOB_FAILED: &str = "failed";
