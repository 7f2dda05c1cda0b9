//! # Exit codes, exit handler and kernel state.

use std::fmt;
use std::sync::Arc;

/// Process exit codes used by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean shutdown.
    Ok = 0,
    /// A module failed, a stage failed to boot or the kernel panicked.
    Error = 1,
    /// No module was registered.
    NothingToRun = 10,
    /// Every registered module is a background module.
    NoForeground = 11,
    /// Shutdown exceeded the kill timeout.
    Forced = 12,
}

impl ExitCode {
    /// Numeric code handed to the process.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ExitCode::Ok => "ok",
            ExitCode::Error => "error",
            ExitCode::NothingToRun => "nothing_to_run",
            ExitCode::NoForeground => "no_foreground",
            ExitCode::Forced => "forced",
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.as_str())
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        // every variant fits into a u8
        std::process::ExitCode::from(code.code() as u8)
    }
}

/// Called exactly once with the final exit code.
///
/// The default handler terminates the process with `std::process::exit`.
pub type ExitHandler = Arc<dyn Fn(ExitCode) + Send + Sync + 'static>;

pub(crate) fn default_exit_handler() -> ExitHandler {
    Arc::new(|code: ExitCode| std::process::exit(code.code()))
}

/// Lifecycle state of a [`Kernel`](crate::Kernel).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelState {
    /// Built, `run` not called yet.
    Built,
    /// Stages are booting.
    Booting,
    /// Every stage booted.
    Running,
    /// A stop trigger fired; stages are being torn down.
    Stopping,
    /// The exit handler was invoked with this code.
    Terminated(ExitCode),
}
