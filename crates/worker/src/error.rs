use vox_core::error::CoreError;

/// Errors surfaced by queue and pool operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A domain-level error (invalid payload, unknown job, claim conflict).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A job store error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
