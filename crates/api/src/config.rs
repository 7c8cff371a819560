use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderValue;
use vox_worker::WorkerPoolConfig;

/// A configuration value that could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("{key} has an invalid value {value:?}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long shutdown waits for in-flight jobs, in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// SQLite database URL (default: `sqlite://data/jobs.db`).
    pub database_url: String,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                  |
    /// |-------------------------|--------------------------|
    /// | `HOST`                  | `0.0.0.0`                |
    /// | `PORT`                  | `3000`                   |
    /// | `CORS_ORIGINS`          | `http://localhost:5173`  |
    /// | `REQUEST_TIMEOUT_SECS`  | `30`                     |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `30`                     |
    /// | `DATABASE_URL`          | `sqlite://data/jobs.db`  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let cors_raw = lookup("CORS_ORIGINS").unwrap_or_else(|| "http://localhost:5173".into());
        let cors_origins: Vec<String> = cors_raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for origin in &cors_origins {
            if let Err(e) = origin.parse::<HeaderValue>() {
                return Err(ConfigError {
                    key: "CORS_ORIGINS",
                    value: origin.clone(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "PORT", 3000)?,
            cors_origins,
            request_timeout_secs: parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 30)?,
            shutdown_timeout_secs: parse_or(&lookup, "SHUTDOWN_TIMEOUT_SECS", 30)?,
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://data/jobs.db".into()),
        })
    }
}

/// Worker pool, process, and log settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Directory holding per-job log files (`JOB_LOG_DIR`, default `logs/jobs`).
    pub log_dir: PathBuf,
    /// Python interpreter (`COQUI_PY`, default `python3`).
    pub python: String,
    /// Dataset preparation script (`PREP_SCRIPT`).
    pub prep_script: PathBuf,
    /// Root of training run outputs (`RUNS_DIR`, default `runs`).
    pub runs_dir: PathBuf,
    pub prep_workers: usize,
    pub train_workers: usize,
    pub keep_completed: u32,
    pub keep_failed: u32,
    pub poll_interval_ms: u64,
    /// Per-subscriber event buffer (`EVENT_BUFFER`, default 256).
    pub event_buffer: usize,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = WorkerPoolConfig::default();
        let path = |key: &str, default: &str| PathBuf::from(lookup(key).unwrap_or_else(|| default.into()));

        let settings = Self {
            log_dir: path("JOB_LOG_DIR", "logs/jobs"),
            python: lookup("COQUI_PY").unwrap_or_else(|| "python3".into()),
            prep_script: path("PREP_SCRIPT", "scripts/prep_xtts_data.py"),
            runs_dir: path("RUNS_DIR", "runs"),
            prep_workers: parse_or(&lookup, "PREP_WORKERS", defaults.prep_workers)?,
            train_workers: parse_or(&lookup, "TRAIN_WORKERS", defaults.train_workers)?,
            keep_completed: parse_or(&lookup, "KEEP_COMPLETED", defaults.keep_completed)?,
            keep_failed: parse_or(&lookup, "KEEP_FAILED", defaults.keep_failed)?,
            poll_interval_ms: parse_or(
                &lookup,
                "QUEUE_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?,
            event_buffer: parse_or(&lookup, "EVENT_BUFFER", vox_events::DEFAULT_SUBSCRIBER_BUFFER)?,
        };

        if settings.event_buffer == 0 {
            return Err(ConfigError {
                key: "EVENT_BUFFER",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if settings.poll_interval_ms == 0 {
            return Err(ConfigError {
                key: "QUEUE_POLL_INTERVAL_MS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(settings)
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            prep_workers: self.prep_workers,
            train_workers: self.train_workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
            ..WorkerPoolConfig::default()
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn server_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.cors_origins, vec!["http://localhost:5173"]);
        assert_eq!(config.database_url, "sqlite://data/jobs.db");
    }

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        let config = ServerConfig::from_lookup(lookup(&[(
            "CORS_ORIGINS",
            "http://a.test, http://b.test,,",
        )]))
        .unwrap();
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn invalid_port_fails() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert_eq!(err.key, "PORT");
    }

    #[test]
    fn worker_defaults_match_pool_defaults() {
        let settings = WorkerSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.python, "python3");
        assert_eq!(settings.log_dir, PathBuf::from("logs/jobs"));
        assert_eq!(settings.event_buffer, 256);

        let pool = settings.pool_config();
        assert_eq!(pool.prep_workers, 1);
        assert_eq!(pool.train_workers, 1);
        assert_eq!(pool.keep_completed, 50);
        assert_eq!(pool.keep_failed, 100);
        assert_eq!(pool.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn worker_overrides() {
        let settings = WorkerSettings::from_lookup(lookup(&[
            ("COQUI_PY", "/opt/coqui/bin/python"),
            ("TRAIN_WORKERS", "2"),
            ("KEEP_FAILED", "10"),
            ("QUEUE_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(settings.python, "/opt/coqui/bin/python");
        let pool = settings.pool_config();
        assert_eq!(pool.train_workers, 2);
        assert_eq!(pool.keep_failed, 10);
        assert_eq!(pool.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn zero_event_buffer_is_rejected() {
        let err = WorkerSettings::from_lookup(lookup(&[("EVENT_BUFFER", "0")])).unwrap_err();
        assert_eq!(err.key, "EVENT_BUFFER");
    }
}
