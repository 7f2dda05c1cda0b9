//! # Lifecycle events emitted by the kernel.
//!
//! The [`EventKind`] enum classifies events in three groups:
//! - **Boot**: kernel starting, stages booting/booted, kernel running;
//! - **Modules**: a module starting, stopping or failing;
//! - **Shutdown**: stop requested, stages stopped, forced shutdown, exit.
//!
//! ## Ordering guarantees
//! Each event carries a process-wide sequence number (`seq`) that increases
//! monotonically. Use it to restore order when subscribers receive events late.
//!
//! ## Example
//! ```rust
//! use modvisor::events::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::ModuleFailed)
//!     .with_module("consumer")
//!     .with_stage(2048)
//!     .with_reason("connection refused");
//!
//! assert_eq!(ev.kind, EventKind::ModuleFailed);
//! assert_eq!(ev.module.as_deref(), Some("consumer"));
//! assert_eq!(ev.stage, Some(2048));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::core::ExitCode;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of kernel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Boot ===
    /// `Kernel::run` was called.
    KernelStarting,

    /// A stage spawns its modules.
    ///
    /// Sets: `stage`.
    StageBooting,

    /// Every health-checked module of the stage reported healthy.
    ///
    /// Sets: `stage`.
    StageBooted,

    /// Every stage booted.
    KernelRunning,

    // === Modules ===
    /// A module's `run` is about to be called.
    ///
    /// Sets: `module`, `stage`.
    ModuleStarting,

    /// A module returned without error (or observed cancellation).
    ///
    /// Sets: `module`, `stage`.
    ModuleStopped,

    /// A module returned an error or panicked.
    ///
    /// Sets: `module`, `stage`, `reason`.
    ModuleFailed,

    // === Shutdown ===
    /// The first stop trigger fired.
    ///
    /// Sets: `reason`.
    StopRequested,

    /// A stage finished its teardown.
    ///
    /// Sets: `stage`, `reason` (only if the stage reported a real error).
    StageStopped,

    /// Teardown exceeded the kill timeout.
    ///
    /// Sets: `reason` (blocking modules).
    ShutdownForced,

    /// The kernel invoked its exit handler.
    ///
    /// Sets: `exit_code`, `reason`.
    KernelExited,
}

/// Kernel event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Name of the module, if applicable.
    pub module: Option<Arc<str>>,
    /// Stage index, if applicable.
    pub stage: Option<i32>,
    /// Human-readable reason (errors, stop reasons).
    pub reason: Option<Arc<str>>,
    /// Exit code, only for [`EventKind::KernelExited`].
    pub exit_code: Option<ExitCode>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            module: None,
            stage: None,
            reason: None,
            exit_code: None,
        }
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a module name.
    #[inline]
    pub fn with_module(mut self, module: impl Into<Arc<str>>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Attaches a stage index.
    #[inline]
    pub fn with_stage(mut self, stage: i32) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Attaches an exit code.
    #[inline]
    pub fn with_exit_code(mut self, code: ExitCode) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// True for events reporting a failure.
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self.kind, EventKind::ModuleFailed | EventKind::ShutdownForced)
    }
}
