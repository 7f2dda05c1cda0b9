//! # Event subscribers.
//!
//! ```text
//! Kernel ── publish(Event) ──► Bus ──► listener ──► SubscriberSet::emit(&Event)
//!                                                       │
//!                                          ┌────────────┼────────────┐
//!                                          ▼            ▼            ▼
//!                                      LogWriter     Metrics      Custom
//! ```
//!
//! - [`Subscribe`] trait implemented by user handlers;
//! - [`SubscriberSet`] fan-out with per-subscriber bounded queues;
//! - [`LogWriter`] predefined subscriber writing through `tracing`.

mod log;
mod set;
mod subscribe;

pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
