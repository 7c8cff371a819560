use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::service::JobService;

/// Shared application state available to all Axum handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: vox_db::DbPool,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Job submission, status, progress, and log access.
    pub jobs: Arc<JobService>,
    /// Cancelled when the server begins shutting down; ends open progress
    /// streams so connections can drain.
    pub shutdown: CancellationToken,
}
