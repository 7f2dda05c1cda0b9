//! # Fan-out of kernel events to subscribers.
//!
//! Every subscriber gets its own lane: a bounded queue drained by one worker task.
//! The kernel pushes into the lanes and never waits for a subscriber.
//!
//! ```text
//!   kernel listener ─► emit(&Event) ─► Arc<Event>
//!                                        ├─► lane "audit"  ─► worker ─► on_event()
//!                                        └─► lane "log"    ─► worker ─► on_event()
//! ```
//!
//! ## Rules
//! - Order is preserved within a lane, not across lanes.
//! - A full lane drops the event for that subscriber and counts the drop.
//! - A panicking `on_event` is logged; the worker keeps draining its lane.
//! - [`SubscriberSet::shutdown`] delivers everything still queued before returning.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::Subscribe;
use crate::coffin::resolve_panic;
use crate::events::Event;

struct Lane {
    subscriber: &'static str,
    queue: mpsc::Sender<Arc<Event>>,
    dropped: AtomicU64,
}

/// Subscribers of one kernel run, each behind its own bounded lane.
pub struct SubscriberSet {
    lanes: Vec<Lane>,
    workers: Vec<JoinHandle<()>>,
}

impl SubscriberSet {
    /// Opens one lane per subscriber and spawns its worker.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        let (lanes, workers) = subscribers
            .into_iter()
            .map(|sub| {
                let (queue, rx) = mpsc::channel(sub.queue_capacity().max(1));
                let lane = Lane {
                    subscriber: sub.name(),
                    queue,
                    dropped: AtomicU64::new(0),
                };
                (lane, tokio::spawn(drain(sub, rx)))
            })
            .unzip();
        Self { lanes, workers }
    }

    /// Queues `event` on every lane without waiting.
    pub fn emit(&self, event: &Event) {
        if self.lanes.is_empty() {
            return;
        }
        let event = Arc::new(event.clone());
        for lane in &self.lanes {
            let cause = match lane.queue.try_send(Arc::clone(&event)) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => "queue full",
                Err(TrySendError::Closed(_)) => "worker gone",
            };
            let dropped = lane.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                subscriber = lane.subscriber,
                seq = event.seq,
                kind = ?event.kind,
                dropped,
                "event not delivered: {cause}"
            );
        }
    }

    /// Events dropped so far, per subscriber name.
    pub fn dropped(&self) -> Vec<(&'static str, u64)> {
        self.lanes
            .iter()
            .map(|lane| (lane.subscriber, lane.dropped.load(Ordering::Relaxed)))
            .collect()
    }

    /// Closes every lane and waits until the workers delivered what was queued.
    pub async fn shutdown(self) {
        drop(self.lanes);
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "subscriber worker aborted");
            }
        }
    }

    /// True if there are no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.len()
    }
}

async fn drain(sub: Arc<dyn Subscribe>, mut rx: mpsc::Receiver<Arc<Event>>) {
    while let Some(event) = rx.recv().await {
        let delivery = AssertUnwindSafe(sub.on_event(&event)).catch_unwind();
        if let Err(payload) = delivery.await {
            tracing::warn!(
                subscriber = sub.name(),
                seq = event.seq,
                error = %resolve_panic(payload),
                "subscriber panicked"
            );
        }
    }
}
