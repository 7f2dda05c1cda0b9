//! # modvisor
//!
//! **Modvisor** is a staged module kernel for long-running Rust services.
//!
//! An application registers its *modules* (HTTP servers, queue consumers,
//! metric writers, ...) with a [`KernelBuilder`]. The [`Kernel`] boots them stage
//! by stage, supervises them, stops everything as soon as one of the stop
//! triggers fires and guarantees the process exits within a bounded time.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   with_module / with_multi_module / with_middleware
//!            │
//!            ▼
//!   KernelBuilder::build() ── factories ──► ModuleState (config probed once)
//!            │
//!            ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Kernel                                                           │
//! │  - middleware chain around the run handler                        │
//! │  - stages ordered by index, each with its own Coffin              │
//! │  - foreground counter, stop-once, exit-once                       │
//! │  - Bus ─► SubscriberSet (events)                                  │
//! │  - HealthChecker (explicit handle, no global)                     │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!   Stage[0]           Stage[1024]        Stage[2048]
//!   essential          service            application
//!   (boots first,      ...                (boots last,
//!    stops last)                           stops first)
//!        │
//!        ▼
//!   Coffin: go_with(module.run) ─► catch_unwind ─► failures in launch order
//! ```
//!
//! ### Module kinds
//! | kind                   | exit stops the kernel | keeps the kernel alive |
//! |------------------------|-----------------------|------------------------|
//! | `foreground` (default) | when it is the last   | yes                    |
//! | `background`           | no                    | no                     |
//! | `essential`            | yes                   | yes                    |
//! | `essential-background` | yes                   | no                     |
//!
//! ### Exit codes
//! [`ExitCode`]: `Ok = 0`, `Error = 1`, `NothingToRun = 10`, `NoForeground = 11`,
//! `Forced = 12`.
//!
//! ## Features
//! | Area              | Description                                             | Key types / traits                              |
//! |-------------------|---------------------------------------------------------|-------------------------------------------------|
//! | **Modules**       | Long-running units with optional capabilities.          | [`Module`], [`ModuleFn`], [`ModuleKind`]        |
//! | **Kernel**        | Staged boot, stop triggers, bounded shutdown.           | [`Kernel`], [`KernelBuilder`], [`KernelConfig`] |
//! | **Task groups**   | Supervised tokio tasks with panic recovery.             | [`coffin::Coffin`], [`coffin::Tomb`]            |
//! | **Middlewares**   | Wrap the kernel run.                                    | [`Middleware`], [`MiddlewareFn`], [`Position`]  |
//! | **Health**        | Aggregate module health for endpoints and boot.         | [`HealthChecker`], [`HealthCheckResult`]        |
//! | **Events**        | Lifecycle events fanned out to subscribers.             | [`events::Event`], [`subscribers::Subscribe`]   |
//! | **Errors**        | Typed errors with stable labels.                        | [`KernelError`], [`ModuleError`]                |
//!
//! ## Example
//! ```rust,no_run
//! use modvisor::{Kernel, KernelConfig, ModuleError, ModuleFn, ModuleKind, ModuleRef};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let kernel = Kernel::builder(KernelConfig::default())
//!         .with_module("api", |_ctx| {
//!             Ok::<_, ModuleError>(
//!                 ModuleFn::arc(|ctx: CancellationToken| async move {
//!                     ctx.cancelled().await;
//!                     Ok::<_, ModuleError>(())
//!                 }) as ModuleRef,
//!             )
//!         })
//!         .with_module("metrics", |_ctx| {
//!             Ok::<_, ModuleError>(
//!                 ModuleFn::new(|ctx: CancellationToken| async move {
//!                     ctx.cancelled().await;
//!                     Ok::<_, ModuleError>(())
//!                 })
//!                 .with_kind(ModuleKind::EssentialBackground)
//!                 .into_ref(),
//!             )
//!         })
//!         .build()
//!         .unwrap_or_else(|err| std::process::exit(err.exit_code().code()));
//!
//!     // exits the process on SIGINT/SIGTERM once every module stopped
//!     kernel.run().await;
//! }
//! ```

pub mod coffin;
mod core;
mod error;
pub mod events;
mod modules;
pub mod subscribers;

// ---- Public re-exports ----

pub use core::{
    ExitCode, ExitHandler, Handler, HandlerFuture, HealthCheckConfig, HealthCheckResult,
    HealthChecker, HealthError, Kernel, KernelBuilder, KernelConfig, KernelState, Middleware,
    MiddlewareFactory, MiddlewareFn, MiddlewareRef, ModuleHealthCheckResult, Position,
    simple_middleware,
};
pub use error::{BoxError, KernelError, ModuleError};
pub use modules::{
    FactoryContext, HealthCheckedModule, Module, ModuleConfig, ModuleFactory, ModuleFn,
    ModuleKind, ModuleOptions, ModuleRef, ModuleState, MultiModuleFactory, STAGE_APPLICATION,
    STAGE_ESSENTIAL, STAGE_SERVICE, StagedModule, TypedModule,
};
