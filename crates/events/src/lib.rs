//! In-process progress event bus.
//!
//! - [`JobEvent`]: a progress, completion, or failure notification for one job.
//! - [`ProgressEventBus`]: subscription registry keyed by job id.
//! - [`Subscription`]: an observer's handle; a [`futures::Stream`] of events
//!   that unsubscribes when dropped.

pub mod bus;

pub use bus::{JobEvent, ProgressEventBus, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
