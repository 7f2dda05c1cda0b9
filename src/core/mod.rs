//! Runtime core: kernel orchestration and lifecycle.
//!
//! The public entry points are [`KernelBuilder`] and [`Kernel`].
//!
//! Internal modules:
//! - [`kernel`]: boot, stop triggers, bounded shutdown, exit;
//! - [`builder`]: factory evaluation and build-time validation;
//! - [`stage`]: one boot group of modules backed by a coffin;
//! - [`middleware`]: handler chain around the kernel run;
//! - [`health`]: module health aggregation;
//! - [`shutdown`]: cross-platform termination signals;
//! - [`config`], [`exit`]: settings, exit codes, kernel state.

mod builder;
mod config;
mod exit;
mod health;
mod kernel;
mod middleware;
mod shutdown;
mod stage;

pub use builder::KernelBuilder;
pub use config::{HealthCheckConfig, KernelConfig};
pub use exit::{ExitCode, ExitHandler, KernelState};
pub use health::{HealthCheckResult, HealthChecker, HealthError, ModuleHealthCheckResult};
pub use kernel::Kernel;
pub use middleware::{
    Handler, HandlerFuture, Middleware, MiddlewareFactory, MiddlewareFn, MiddlewareRef, Position,
    simple_middleware,
};
