//! # Logging subscriber.
//!
//! [`LogWriter`] forwards every kernel event to `tracing` with structured fields.
//! The kernel already logs its own lifecycle; use this subscriber when events
//! should also land under a dedicated target (`modvisor::events`).

use async_trait::async_trait;

use super::Subscribe;
use crate::events::{Event, EventKind};

/// Writes events through `tracing` under the `modvisor::events` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogWriter;

impl LogWriter {
    /// Creates the writer.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let module = e.module.as_deref().unwrap_or("");
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::ModuleFailed | EventKind::ShutdownForced => {
                tracing::error!(
                    target: "modvisor::events",
                    seq = e.seq,
                    kind = ?e.kind,
                    module,
                    stage = ?e.stage,
                    reason,
                    "kernel event"
                );
            }
            EventKind::KernelExited => {
                tracing::info!(
                    target: "modvisor::events",
                    seq = e.seq,
                    kind = ?e.kind,
                    exit_code = ?e.exit_code,
                    reason,
                    "kernel event"
                );
            }
            _ => {
                tracing::info!(
                    target: "modvisor::events",
                    seq = e.seq,
                    kind = ?e.kind,
                    module,
                    stage = ?e.stage,
                    reason,
                    "kernel event"
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
