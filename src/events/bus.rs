//! # Event bus for broadcasting kernel events.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`]: the kernel, its
//! stages and the module runner publish without blocking, and a single listener
//! inside the kernel forwards everything to the
//! [`SubscriberSet`](crate::subscribers::SubscriberSet).
//!
//! ```text
//! Publishers (many):                  Listener (one):
//!   Kernel       ──┐
//!   Stage[i]     ──┼──────► Bus ───────► subscriber listener ────► SubscriberSet
//!   run_module   ──┘  (broadcast chan)     (in Kernel::run)
//! ```
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never blocks.
//! - **Bounded capacity**: one ring buffer shared by all receivers; lagging
//!   receivers observe `RecvError::Lagged(n)` and skip `n` items.
//! - **No persistence**: events are dropped if nobody listens at send time.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for kernel events.
///
/// Cheap to clone (holds an `Arc`-backed sender).
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel::<Event>(capacity);
        Self { tx }
    }

    /// Publishes an event to all active receivers.
    ///
    /// If there are no receivers the event is dropped.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates a receiver that observes events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
