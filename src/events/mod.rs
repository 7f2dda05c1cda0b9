//! Kernel events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Kernel` (boot, stop, exit), stages (boot/teardown), the
//!   module runner (start, stop, failure).
//! - **Consumers**: the kernel's subscriber listener, which fans events out to
//!   the [`SubscriberSet`](crate::subscribers::SubscriberSet).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
