use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vox_api::config::{ServerConfig, WorkerSettings};
use vox_api::router::build_app_router;
use vox_api::service::JobService;
use vox_api::state::AppState;
use vox_core::job_log::JobLogSink;
use vox_core::types::JobKind;
use vox_events::ProgressEventBus;
use vox_worker::{JobQueue, PrepHandler, TrainHandler, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    let settings = WorkerSettings::from_env()?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Job store ---
    let pool = vox_db::create_pool(&config.database_url)
        .await
        .context("Failed to open job database")?;
    vox_db::health_check(&pool)
        .await
        .context("Job database health check failed")?;
    vox_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!(database_url = %config.database_url, "Job store ready");

    // --- Queue, bus, logs ---
    let queue = Arc::new(JobQueue::new(pool.clone()));
    let bus = Arc::new(ProgressEventBus::new(settings.event_buffer));
    let logs = Arc::new(JobLogSink::new(&settings.log_dir));

    // --- Worker pool ---
    let shutdown = CancellationToken::new();
    let workers = WorkerPool::new(
        settings.pool_config(),
        Arc::clone(&queue),
        Arc::clone(&bus),
        Arc::clone(&logs),
    )
    .with_handler(
        JobKind::Prep,
        Arc::new(PrepHandler::new(&settings.python, &settings.prep_script)),
    )
    .with_handler(
        JobKind::Train,
        Arc::new(TrainHandler::new(&settings.python, &settings.runs_dir)),
    )
    .start(shutdown.clone())
    .await
    .context("Failed to start worker pool")?;

    // --- App state ---
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        jobs: Arc::new(JobService::new(queue, bus, logs)),
        shutdown: shutdown.clone(),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let host = config
        .host
        .parse()
        .with_context(|| format!("Invalid HOST address {:?}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal.cancel();
        })
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, draining workers");
    let drained = workers
        .shutdown(Duration::from_secs(config.shutdown_timeout_secs))
        .await;
    tracing::info!(drained, "Graceful shutdown complete");
    Ok(())
}

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vox_api=debug,vox_worker=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
