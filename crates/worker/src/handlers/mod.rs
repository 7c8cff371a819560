//! Built-in handlers, one per job kind. Both shell out to a Python
//! interpreter and differ only in how they build the command line.

mod prep;
mod train;

pub use prep::{prep_command, PrepHandler};
pub use train::{train_command, TrainHandler};

use vox_core::payload::JobPayload;

use crate::handler::{HandlerError, JobContext};

/// Decode the stored payload of the job in `ctx`.
pub(crate) fn payload_of(ctx: &JobContext) -> Result<JobPayload, HandlerError> {
    JobPayload::parse(ctx.kind, ctx.payload.clone()).map_err(|e| HandlerError::InvalidPayload {
        kind: ctx.kind,
        message: e.to_string(),
    })
}
