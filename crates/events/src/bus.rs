//! Subscription registry that fans job events out to observers.
//!
//! [`ProgressEventBus`] keeps, per job id, the list of live subscribers.
//! Each subscriber owns a bounded channel for progress updates and a
//! one-shot slot for the job's final event, so publishing never waits on a
//! subscriber and a full buffer can never swallow the terminal event. It is
//! designed to be shared via `Arc<ProgressEventBus>`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{ready, Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use vox_core::job_events::{EVENT_JOB_COMPLETED, EVENT_JOB_FAILED, EVENT_JOB_PROGRESS};
use vox_core::types::JobId;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// A state change of one job, as relayed to observers.
///
/// Serializes to `{jobId, progress?, completed?, result?, failed?, reason?, ts}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub completed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Milliseconds since the Unix epoch.
    pub ts: i64,
}

impl JobEvent {
    fn base(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            progress: None,
            completed: false,
            result: None,
            failed: false,
            reason: None,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// A progress update.
    pub fn progress(job_id: impl Into<JobId>, progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::base(job_id)
        }
    }

    /// Successful completion with the handler's result.
    pub fn completed(job_id: impl Into<JobId>, result: serde_json::Value) -> Self {
        Self {
            progress: Some(100.0),
            completed: true,
            result: Some(result),
            ..Self::base(job_id)
        }
    }

    /// Failure with a human-readable reason.
    pub fn failed(job_id: impl Into<JobId>, reason: impl Into<String>) -> Self {
        Self {
            failed: true,
            reason: Some(reason.into()),
            ..Self::base(job_id)
        }
    }

    /// Whether this is the last event the job will ever produce.
    pub fn is_terminal(&self) -> bool {
        self.completed || self.failed
    }

    /// Event name for push transports.
    pub fn event_name(&self) -> &'static str {
        if self.completed {
            EVENT_JOB_COMPLETED
        } else if self.failed {
            EVENT_JOB_FAILED
        } else {
            EVENT_JOB_PROGRESS
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressEventBus
// ---------------------------------------------------------------------------

/// Default per-subscriber buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<JobEvent>,
    final_tx: oneshot::Sender<JobEvent>,
}

/// In-process publish/subscribe hub keyed by job id.
///
/// Delivery is best-effort: an event published while nobody watches the
/// job is lost, and a subscriber whose buffer is full misses that progress
/// update without affecting anyone else. The terminal event is always
/// delivered to every subscriber registered when it is published, after
/// the progress updates already buffered for it.
///
/// # Usage
///
/// ```rust
/// use std::sync::Arc;
/// use vox_events::{JobEvent, ProgressEventBus};
///
/// let bus = Arc::new(ProgressEventBus::default());
/// let _sub = bus.subscribe("job-1");
///
/// bus.publish(JobEvent::progress("job-1", 10.0));
/// ```
pub struct ProgressEventBus {
    subscribers: Mutex<HashMap<JobId, Vec<Subscriber>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl ProgressEventBus {
    /// Create a bus whose subscribers each buffer up to `buffer` events.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Start watching a job.
    ///
    /// The returned [`Subscription`] yields events for `job_id` in
    /// publication order, ends after the job's terminal event, and removes
    /// itself from the registry when dropped.
    pub fn subscribe(self: &Arc<Self>, job_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let (final_tx, final_rx) = oneshot::channel();

        self.registry()
            .entry(job_id.to_string())
            .or_default()
            .push(Subscriber { id, tx, final_tx });

        tracing::debug!(job_id, subscription_id = id, "Subscribed to job events");

        Subscription {
            id,
            job_id: job_id.to_string(),
            rx,
            final_rx: Some(final_rx),
            bus: Arc::downgrade(self),
        }
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, job_id: &str, subscription_id: u64) -> bool {
        let mut registry = self.registry();
        let Some(subs) = registry.get_mut(job_id) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != subscription_id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            registry.remove(job_id);
        }
        if removed {
            tracing::debug!(job_id, subscription_id, "Unsubscribed from job events");
        }
        removed
    }

    /// Deliver an event to every current subscriber of its job.
    ///
    /// Never blocks. Returns how many subscribers accepted the event.
    ///
    /// A terminal event goes through each subscriber's final-event slot and
    /// releases every subscription of the job; each stream yields it after
    /// its buffered progress updates and then ends.
    pub fn publish(&self, event: JobEvent) -> usize {
        let mut registry = self.registry();

        if event.is_terminal() {
            let Some(subs) = registry.remove(&event.job_id) else {
                tracing::trace!(job_id = %event.job_id, "No subscribers for job event");
                return 0;
            };
            return subs
                .into_iter()
                .map(|sub| sub.final_tx.send(event.clone()).is_ok())
                .filter(|&ok| ok)
                .count();
        }

        let Some(subs) = registry.get_mut(&event.job_id) else {
            tracing::trace!(job_id = %event.job_id, "No subscribers for job event");
            return 0;
        };

        let mut delivered = 0;
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(
                    job_id = %event.job_id,
                    subscription_id = sub.id,
                    "Subscriber buffer full, progress event dropped",
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if subs.is_empty() {
            registry.remove(&event.job_id);
        }
        delivered
    }

    /// Number of live subscriptions for a job.
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.registry().get(job_id).map_or(0, Vec::len)
    }

    /// Number of jobs with at least one subscriber.
    pub fn watched_jobs(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<JobId, Vec<Subscriber>>> {
        // A panic while holding the lock leaves the map itself intact.
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ProgressEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One observer's binding to a job's events.
pub struct Subscription {
    id: u64,
    job_id: JobId,
    rx: mpsc::Receiver<JobEvent>,
    /// Taken once the final event (or its absence) has been observed.
    final_rx: Option<oneshot::Receiver<JobEvent>>,
    bus: Weak<ProgressEventBus>,
}

impl Subscription {
    /// Registry id of this subscription.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The job being watched.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait for the next event. `None` once the job has finished (or the
    /// bus is gone) and all buffered events were received.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        futures::StreamExt::next(self).await
    }
}

impl Stream for Subscription {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Progress senders are released with the final event, so the
        // channel only closes once everything before it has been drained.
        if let Some(event) = ready!(self.rx.poll_recv(cx)) {
            return Poll::Ready(Some(event));
        }
        let Some(final_rx) = self.final_rx.as_mut() else {
            return Poll::Ready(None);
        };
        let event = ready!(Pin::new(final_rx).poll(cx)).ok();
        self.final_rx = None;
        Poll::Ready(event)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.job_id, self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
