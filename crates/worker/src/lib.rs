//! Job execution: the per-kind queue, the handler protocol, the external
//! process runner, and the worker pool that ties them together.

pub mod error;
pub mod handler;
pub mod handlers;
pub mod pool;
pub mod process;
pub mod queue;

pub use error::WorkerError;
pub use handler::{HandlerError, JobContext, JobHandler, ProgressReporter};
pub use handlers::{PrepHandler, TrainHandler};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use queue::JobQueue;
