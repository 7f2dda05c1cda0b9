//! # Supervised task groups.
//!
//! A [`Coffin`] tracks a set of tokio tasks, recovers their panics into errors,
//! exposes dying/dead signaling and reports the failures on [`Coffin::wait`].
//! Every kernel stage owns one coffin; modules may create their own (nested)
//! coffins for child tasks.
//!
//! ## Lifecycle of one epoch
//! ```text
//! go()/go_with() ──► started += 1 ──► tokio::spawn(catch_unwind(fut))
//!                                           │
//!                        Ok(())  ───────────┤
//!                        Err(e)  ──► record failure (launch order), kill()
//!                        panic   ──► resolve_panic() ──► record, kill()
//!                                           ▼
//!                                  terminated += 1
//!                                  terminated == started ──► token cancelled, dead
//! ```
//!
//! After an epoch is dead the next `go` starts a fresh epoch (new token, new
//! dead signal). Recorded failures are kept across epochs.

mod error;
mod group;
mod options;
mod panic;
mod tomb;

pub use error::{CoffinError, PanicError, SharedError, TaskFailure};
pub use group::Coffin;
pub use options::GoOptions;
pub use panic::resolve_panic;
pub use tomb::Tomb;
