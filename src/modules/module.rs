//! # Module contract and capabilities.
//!
//! A [`Module`] is a long-running unit of the application (an HTTP server, a
//! queue consumer, a metric writer). Optional capabilities are exposed through
//! the `as_*` accessors and probed once when the module is registered:
//!
//! - [`TypedModule`] essential / background classification;
//! - [`StagedModule`] boot stage (smaller boots earlier and stops later);
//! - [`HealthCheckedModule`] readiness reported during stage boot.
//!
//! A module without capabilities is a non-essential foreground module in the
//! application stage.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ModuleError;

/// Shared handle to a module.
pub type ModuleRef = Arc<dyn Module>;

/// # Long-running, cancelable unit supervised by the kernel.
///
/// Returning from [`run`](Module::run) means the module is done. Depending on its
/// kind this may stop the kernel. Once `ctx` is cancelled the module has until the
/// kernel's kill timeout to return before the process is terminated.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use modvisor::{Module, ModuleError, StagedModule, STAGE_SERVICE};
/// use tokio_util::sync::CancellationToken;
///
/// struct Api;
///
/// #[async_trait]
/// impl Module for Api {
///     async fn run(&self, ctx: CancellationToken) -> Result<(), ModuleError> {
///         ctx.cancelled().await;
///         Ok(())
///     }
///
///     fn as_staged(&self) -> Option<&dyn StagedModule> {
///         Some(self)
///     }
/// }
///
/// impl StagedModule for Api {
///     fn stage(&self) -> i32 {
///         STAGE_SERVICE
///     }
/// }
/// ```
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Runs the module until it is done or `ctx` is cancelled.
    async fn run(&self, ctx: CancellationToken) -> Result<(), ModuleError>;

    /// Essential / background classification, if the module declares one.
    fn as_typed(&self) -> Option<&dyn TypedModule> {
        None
    }

    /// Boot stage, if the module declares one.
    fn as_staged(&self) -> Option<&dyn StagedModule> {
        None
    }

    /// Health check, if the module provides one.
    fn as_health_checked(&self) -> Option<&dyn HealthCheckedModule> {
        None
    }
}

/// Declares how the module's exit affects the kernel.
///
/// - essential: its exit stops the kernel;
/// - background: it does not keep the kernel running on its own.
pub trait TypedModule: Send + Sync {
    /// True if the kernel must stop once this module returns.
    fn is_essential(&self) -> bool;

    /// True if the module must not keep the kernel alive.
    fn is_background(&self) -> bool;
}

/// Declares the stage a module boots in.
pub trait StagedModule: Send + Sync {
    /// Stage index, see [`STAGE_ESSENTIAL`](crate::STAGE_ESSENTIAL) and friends.
    fn stage(&self) -> i32;
}

/// Reports whether a module is ready.
///
/// A stage counts as booted only after all of its health-checked modules
/// report healthy.
#[async_trait]
pub trait HealthCheckedModule: Send + Sync {
    /// Returns `Ok(true)` once the module is able to serve.
    async fn is_healthy(&self) -> Result<bool, ModuleError>;
}
