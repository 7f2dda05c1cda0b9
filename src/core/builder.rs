//! # Kernel builder.
//!
//! Collects module, multi-module and middleware factories plus options, then
//! [`build`](KernelBuilder::build)s them in a fixed order:
//!
//! 1. middlewares (in registration order, honoring [`Position`]);
//! 2. single modules;
//! 3. multi-module factories.
//!
//! Any factory error or panic aborts the build; so does an empty module set or a
//! set without foreground modules.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::config::KernelConfig;
use super::exit::{ExitCode, ExitHandler, default_exit_handler};
use super::health::HealthChecker;
use super::kernel::{Kernel, KernelParts};
use super::middleware::{self, MiddlewareFactory, MiddlewareRef, Position};
use super::stage::Stage;
use crate::coffin::resolve_panic;
use crate::error::{BoxError, KernelError};
use crate::events::Bus;
use crate::modules::{
    FactoryContext, ModuleConfig, ModuleFactory, ModuleOptions, ModuleRef, ModuleState,
    MultiModuleFactory,
};
use crate::subscribers::Subscribe;

struct ModuleSetup {
    name: String,
    options: ModuleOptions,
    factory: ModuleFactory,
}

/// Builder for a [`Kernel`].
///
/// ## Example
/// ```rust
/// use std::time::Duration;
/// use modvisor::{ExitCode, KernelBuilder, KernelConfig, ModuleError, ModuleFn, ModuleRef};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let kernel = KernelBuilder::new(KernelConfig::default())
///         .with_module("once", |_ctx| {
///             Ok::<_, ModuleError>(
///                 ModuleFn::arc(|_ctx: CancellationToken| async { Ok::<_, ModuleError>(()) })
///                     as ModuleRef,
///             )
///         })
///         .with_kill_timeout(Duration::from_secs(1))
///         .with_exit_handler(|_code| {})
///         .build()
///         .expect("kernel");
///
///     assert_eq!(kernel.run().await, ExitCode::Ok);
/// }
/// ```
pub struct KernelBuilder {
    cfg: KernelConfig,
    token: Option<CancellationToken>,
    modules: Vec<ModuleSetup>,
    multi: Vec<MultiModuleFactory>,
    middlewares: Vec<(MiddlewareFactory, Position)>,
    stages: Vec<i32>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    exit_handler: Option<ExitHandler>,
}

impl KernelBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: KernelConfig) -> Self {
        Self {
            cfg,
            token: None,
            modules: Vec::new(),
            multi: Vec::new(),
            middlewares: Vec::new(),
            stages: Vec::new(),
            subscribers: Vec::new(),
            exit_handler: None,
        }
    }

    /// Derives every kernel token from `token`: cancelling it cancels all modules.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Registers a module factory.
    pub fn with_module<F, E>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce(&FactoryContext) -> Result<ModuleRef, E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.with_module_options(name, ModuleOptions::default(), factory)
    }

    /// Registers a module factory with explicit kind/stage overrides.
    pub fn with_module_options<F, E>(
        mut self,
        name: impl Into<String>,
        options: ModuleOptions,
        factory: F,
    ) -> Self
    where
        F: FnOnce(&FactoryContext) -> Result<ModuleRef, E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.modules.push(ModuleSetup {
            name: name.into(),
            options,
            factory: Box::new(move |ctx: &FactoryContext| -> Result<ModuleRef, BoxError> {
                factory(ctx).map_err(Into::into)
            }),
        });
        self
    }

    /// Registers an already built module.
    pub fn with_module_instance(self, name: impl Into<String>, module: ModuleRef) -> Self {
        self.with_module(name, move |_ctx: &FactoryContext| Ok::<_, BoxError>(module))
    }

    /// Registers a factory producing a set of named module factories.
    pub fn with_multi_module<F, E>(mut self, factory: F) -> Self
    where
        F: FnOnce(&FactoryContext) -> Result<BTreeMap<String, ModuleFactory>, E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.multi.push(Box::new(
            move |ctx: &FactoryContext| -> Result<BTreeMap<String, ModuleFactory>, BoxError> {
                factory(ctx).map_err(Into::into)
            },
        ));
        self
    }

    /// Registers a middleware factory.
    pub fn with_middleware<F, E>(mut self, factory: F, position: Position) -> Self
    where
        F: FnOnce(&FactoryContext) -> Result<MiddlewareRef, E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.middlewares.push((
            Box::new(move |ctx: &FactoryContext| -> Result<MiddlewareRef, BoxError> {
                factory(ctx).map_err(Into::into)
            }),
            position,
        ));
        self
    }

    /// Declares a stage even if no module ends up in it.
    pub fn with_stage(mut self, index: i32) -> Self {
        self.stages.push(index);
        self
    }

    /// Sets event subscribers.
    ///
    /// Subscribers receive kernel events through dedicated workers with bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Overrides [`KernelConfig::kill_timeout`].
    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.kill_timeout = timeout;
        self
    }

    /// Replaces the default `std::process::exit` exit handler.
    pub fn with_exit_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(ExitCode) + Send + Sync + 'static,
    {
        self.exit_handler = Some(Arc::new(handler));
        self
    }

    /// Builds every middleware and module.
    ///
    /// # Errors
    /// - [`KernelError::MiddlewareFactory`], [`KernelError::ModuleFactory`],
    ///   [`KernelError::MultiModuleFactory`] if a factory fails;
    /// - [`KernelError::FactoryPanicked`] if a factory panics;
    /// - [`KernelError::DuplicateModule`] if a stage already has a module of that name;
    /// - [`KernelError::NoModules`] / [`KernelError::NoForegroundModules`].
    pub fn build(self) -> Result<Arc<Kernel>, KernelError> {
        let root = self.token.unwrap_or_default();
        let running = CancellationToken::new();
        let stopping = CancellationToken::new();
        let health = HealthChecker::new(
            self.cfg.health_check.timeout,
            running.clone(),
            stopping.clone(),
        );
        let ctx = FactoryContext::new(root.clone(), self.cfg.clone(), health.clone());

        let mut middlewares = Vec::with_capacity(self.middlewares.len());
        for (factory, position) in self.middlewares {
            let built = guarded("middleware", || factory(&ctx))?
                .map_err(|source| KernelError::MiddlewareFactory { source })?;
            middleware::insert(&mut middlewares, built, position);
        }

        let mut stages: BTreeMap<i32, Arc<Stage>> = self
            .stages
            .iter()
            .map(|&index| (index, Arc::new(Stage::new(index, &root))))
            .collect();

        for setup in self.modules {
            add_module(&mut stages, &root, &ctx, setup)?;
        }

        for factory in self.multi {
            let factories = guarded("multi-module", || factory(&ctx))?
                .map_err(|source| KernelError::MultiModuleFactory { source })?;
            for (name, factory) in factories {
                let setup = ModuleSetup {
                    name,
                    options: ModuleOptions::default(),
                    factory,
                };
                add_module(&mut stages, &root, &ctx, setup)?;
            }
        }

        let modules: Vec<Arc<ModuleState>> =
            stages.values().flat_map(|stage| stage.modules()).collect();
        if modules.is_empty() {
            return Err(KernelError::NoModules);
        }
        if modules.iter().all(|m| m.config().background) {
            return Err(KernelError::NoForegroundModules);
        }
        health.register(modules);

        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        Ok(Arc::new(Kernel::new(KernelParts {
            cfg: self.cfg,
            root,
            stages,
            middlewares,
            bus,
            subscribers: self.subscribers,
            health,
            running,
            stopping,
            exit_handler: self.exit_handler.unwrap_or_else(default_exit_handler),
        })))
    }
}

fn add_module(
    stages: &mut BTreeMap<i32, Arc<Stage>>,
    root: &CancellationToken,
    ctx: &FactoryContext,
    setup: ModuleSetup,
) -> Result<(), KernelError> {
    let ModuleSetup {
        name,
        options,
        factory,
    } = setup;

    let module = guarded(&name, || factory(ctx))?.map_err(|source| KernelError::ModuleFactory {
        name: name.clone(),
        source,
    })?;
    let config = ModuleConfig::probe(module.as_ref()).apply(&options);

    let stage = stages
        .entry(config.stage)
        .or_insert_with(|| Arc::new(Stage::new(config.stage, root)));
    stage.add(Arc::new(ModuleState::new(name, module, config)))
}

/// Runs a factory, turning a panic into [`KernelError::FactoryPanicked`].
fn guarded<T>(name: &str, f: impl FnOnce() -> T) -> Result<T, KernelError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| KernelError::FactoryPanicked {
        name: name.to_string(),
        source: resolve_panic(payload),
    })
}
