//! Repository layer: one zero-sized struct per table with async associated
//! functions taking the pool.

pub mod job_repo;

pub use job_repo::JobRepo;
