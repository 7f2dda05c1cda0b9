//! Error types used by the modvisor kernel and its modules.
//!
//! This module defines the two main error enums:
//!
//! - [`KernelError`]: errors raised while building, booting or stopping the kernel.
//! - [`ModuleError`]: errors returned by individual module runs.
//!
//! Both types provide `as_label` for logging/metrics. Errors produced by the
//! supervised task group live next to it in [`crate::coffin`].

use std::time::Duration;

use thiserror::Error;

use crate::core::ExitCode;

/// Boxed error used to hand arbitrary user errors to the runtime.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// # Errors produced by the kernel.
///
/// Build errors (`NoModules`, `NoForegroundModules`, factory failures) abort
/// before any module runs. [`KernelError::Stopping`] is the sentinel used to kill
/// stage groups during shutdown and is never reported as a failure.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum KernelError {
    /// No module was registered.
    #[error("no modules to run")]
    NoModules,

    /// Every registered module is a background module.
    #[error("no foreground modules to run")]
    NoForegroundModules,

    /// A module factory returned an error.
    #[error("can not build module {name}: {source}")]
    ModuleFactory {
        /// Name the module was registered under.
        name: String,
        /// Error returned by the factory.
        source: BoxError,
    },

    /// A multi-module factory returned an error.
    #[error("can not build modules from multi factory: {source}")]
    MultiModuleFactory {
        /// Error returned by the factory.
        source: BoxError,
    },

    /// A middleware factory returned an error.
    #[error("can not create middleware: {source}")]
    MiddlewareFactory {
        /// Error returned by the factory.
        source: BoxError,
    },

    /// A factory panicked while building the kernel.
    #[error("factory {name} panicked: {source}")]
    FactoryPanicked {
        /// Name of the module, or `middleware` / `multi-module`.
        name: String,
        /// The recovered panic.
        source: BoxError,
    },

    /// A module with the same name already exists in the stage.
    #[error("failed to add new module {name}: module exists in stage {stage}")]
    DuplicateModule {
        /// Module name.
        name: String,
        /// Stage index.
        stage: i32,
    },

    /// The stage already started booting and does not accept modules anymore.
    #[error("failed to add new module {name}: stage {stage} is sealed")]
    StageSealed {
        /// Module name.
        name: String,
        /// Stage index.
        stage: i32,
    },

    /// Placeholder failure of a stage without modules.
    #[error("stage {stage} has no modules")]
    EmptyStage {
        /// Stage index.
        stage: i32,
    },

    /// Health-checked modules of a stage did not report healthy in time.
    #[error("stage {stage} not healthy after {timeout:?}; unhealthy modules: {unhealthy:?}")]
    StageUnhealthy {
        /// Stage index.
        stage: i32,
        /// Configured health-check timeout.
        timeout: Duration,
        /// Modules that were still unhealthy.
        unhealthy: Vec<String>,
    },

    /// Sentinel reason used to kill stage groups on shutdown.
    #[error("kernel is stopping")]
    Stopping,

    /// Shutdown did not finish within the kill timeout.
    #[error("kernel was not able to shutdown in {timeout:?}; blocking modules: {blocking:?}")]
    ShutdownTimeout {
        /// Configured kill timeout.
        timeout: Duration,
        /// Modules still flagged running.
        blocking: Vec<String>,
    },

    /// The kernel run handler panicked.
    #[error("failed to run kernel: {source}")]
    Panicked {
        /// The recovered panic.
        source: BoxError,
    },
}

impl KernelError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use modvisor::KernelError;
    ///
    /// assert_eq!(KernelError::NoModules.as_label(), "kernel_no_modules");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            KernelError::NoModules => "kernel_no_modules",
            KernelError::NoForegroundModules => "kernel_no_foreground_modules",
            KernelError::ModuleFactory { .. } => "kernel_module_factory",
            KernelError::MultiModuleFactory { .. } => "kernel_multi_module_factory",
            KernelError::MiddlewareFactory { .. } => "kernel_middleware_factory",
            KernelError::FactoryPanicked { .. } => "kernel_factory_panicked",
            KernelError::DuplicateModule { .. } => "kernel_duplicate_module",
            KernelError::StageSealed { .. } => "kernel_stage_sealed",
            KernelError::EmptyStage { .. } => "kernel_empty_stage",
            KernelError::StageUnhealthy { .. } => "kernel_stage_unhealthy",
            KernelError::Stopping => "kernel_stopping",
            KernelError::ShutdownTimeout { .. } => "kernel_shutdown_timeout",
            KernelError::Panicked { .. } => "kernel_panicked",
        }
    }

    /// Maps the error onto the process exit code a launcher should use.
    ///
    /// # Example
    /// ```
    /// use modvisor::{ExitCode, KernelError};
    ///
    /// assert_eq!(KernelError::NoModules.exit_code(), ExitCode::NothingToRun);
    /// assert_eq!(KernelError::NoForegroundModules.exit_code(), ExitCode::NoForeground);
    /// ```
    pub fn exit_code(&self) -> ExitCode {
        match self {
            KernelError::NoModules => ExitCode::NothingToRun,
            KernelError::NoForegroundModules => ExitCode::NoForeground,
            KernelError::ShutdownTimeout { .. } => ExitCode::Forced,
            KernelError::Stopping => ExitCode::Ok,
            _ => ExitCode::Error,
        }
    }

    /// True for errors that are expected during a regular shutdown and must not
    /// turn the exit code into a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, KernelError::Stopping | KernelError::EmptyStage { .. })
    }
}

/// # Errors produced by module runs.
///
/// [`ModuleError::Canceled`] is treated as a graceful exit: a module returning
/// it after its token was cancelled is reported as stopped, not failed.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ModuleError {
    /// Module execution failed.
    #[error("execution failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Module execution failed with an underlying error.
    #[error(transparent)]
    Source(#[from] BoxError),

    /// Module observed cancellation and returned.
    #[error("context cancelled")]
    Canceled,
}

impl ModuleError {
    /// Shorthand for [`ModuleError::Fail`].
    pub fn fail(error: impl Into<String>) -> Self {
        ModuleError::Fail {
            error: error.into(),
        }
    }

    /// Wraps any error type as [`ModuleError::Source`].
    pub fn from_error(error: impl Into<BoxError>) -> Self {
        ModuleError::Source(error.into())
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use modvisor::ModuleError;
    ///
    /// assert_eq!(ModuleError::fail("boom").as_label(), "module_failed");
    /// assert_eq!(ModuleError::Canceled.as_label(), "module_canceled");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ModuleError::Fail { .. } => "module_failed",
            ModuleError::Source(_) => "module_error",
            ModuleError::Canceled => "module_canceled",
        }
    }

    /// True if the module only reported that it observed cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ModuleError::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_errors_do_not_fail_shutdown() {
        assert!(KernelError::Stopping.is_benign());
        assert!(KernelError::EmptyStage { stage: 3 }.is_benign());
        assert!(!KernelError::NoModules.is_benign());
    }

    #[test]
    fn build_errors_map_to_dedicated_exit_codes() {
        assert_eq!(KernelError::NoModules.exit_code().code(), 10);
        assert_eq!(KernelError::NoForegroundModules.exit_code().code(), 11);
        let err = KernelError::ModuleFactory {
            name: "api".into(),
            source: "boom".into(),
        };
        assert_eq!(err.exit_code(), ExitCode::Error);
        assert_eq!(err.to_string(), "can not build module api: boom");
    }

    #[test]
    fn module_error_wraps_foreign_errors() {
        let io = std::io::Error::other("disk gone");
        let err = ModuleError::from_error(io);
        assert_eq!(err.to_string(), "disk gone");
        assert_eq!(err.as_label(), "module_error");
        assert!(!err.is_canceled());
    }
}
