//! Domain building blocks shared by every crate in the job service:
//! identifiers and lifecycle enums, the error taxonomy, payload validation,
//! progress parsing, the per-job log sink, and training metric scraping.

pub mod error;
pub mod job_events;
pub mod job_log;
pub mod metrics;
pub mod payload;
pub mod progress;
pub mod types;
