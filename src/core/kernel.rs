//! # Kernel: boots stages, supervises modules and drives a bounded shutdown.
//!
//! The [`Kernel`] owns the stages (ordered by index), the middleware chain, the
//! event bus with its [`SubscriberSet`] and the single-fire exit handler.
//!
//! ## High-level architecture
//! ```text
//! run():
//!   count foreground modules ─► subscriber listener (Bus ─► SubscriberSet)
//!   signal listener (SIGINT/SIGTERM ─► stop("signal ..."))
//!   middleware chain ─► run handler:
//!
//!     boot stages ascending:   Stage[0] ─► Stage[1024] ─► Stage[2048]
//!        (spawn modules into the stage coffin, wait until healthy)
//!        ├─ ok            ─► Running
//!        ├─ Stopping      ─► (stop already requested)
//!        └─ other error   ─► boot failed, stop("error during running all stages: ...")
//!
//!     wait: every stage token done ─► stop("context done")
//!           or stop requested
//!
//!     wait_stopped: teardown done        ─► exit code Ok / Error
//!                   kill_timeout elapsed ─► log blocking modules, Forced
//!
//!   exit(): KernelExited ─► flush subscribers ─► exit handler (once)
//!
//! stop(reason) (once):
//!   Stopping ─► teardown: Stage[2048] ─► Stage[1024] ─► Stage[0]
//!              (kill coffin with KernelError::Stopping, await modules)
//!            ─► stopped
//! ```
//!
//! ## Stop triggers
//! - an essential module returned;
//! - the last foreground module returned;
//! - SIGINT / SIGTERM;
//! - every stage's token is done;
//! - [`Kernel::stop`] called by the application.
//!
//! The first trigger wins; its reason is kept in [`Kernel::stop_reason`].

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::builder::KernelBuilder;
use super::config::KernelConfig;
use super::exit::{ExitCode, ExitHandler, KernelState};
use super::health::{HealthCheckResult, HealthChecker};
use super::middleware::{self, Handler, HandlerFuture, MiddlewareRef};
use super::shutdown;
use super::stage::Stage;
use crate::coffin::resolve_panic;
use crate::error::{KernelError, ModuleError};
use crate::events::{Bus, Event, EventKind};
use crate::modules::ModuleState;
use crate::subscribers::{Subscribe, SubscriberSet};

/// Upper bound for delivering the last events to subscribers before exiting.
const SUBSCRIBER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the builder hands over to a new kernel.
pub(crate) struct KernelParts {
    pub(crate) cfg: KernelConfig,
    pub(crate) root: CancellationToken,
    pub(crate) stages: BTreeMap<i32, Arc<Stage>>,
    pub(crate) middlewares: Vec<MiddlewareRef>,
    pub(crate) bus: Bus,
    pub(crate) subscribers: Vec<Arc<dyn Subscribe>>,
    pub(crate) health: HealthChecker,
    pub(crate) running: CancellationToken,
    pub(crate) stopping: CancellationToken,
    pub(crate) exit_handler: ExitHandler,
}

/// Staged module kernel.
///
/// Built with [`KernelBuilder`]; driven by [`Kernel::run`].
pub struct Kernel {
    cfg: KernelConfig,
    stages: BTreeMap<i32, Arc<Stage>>,
    middlewares: Vec<MiddlewareRef>,
    bus: Bus,
    subscribers: Mutex<Vec<Arc<dyn Subscribe>>>,
    health: HealthChecker,

    middleware_token: CancellationToken,
    running: CancellationToken,
    stopping: CancellationToken,
    stopped: CancellationToken,

    started: AtomicBool,
    foreground: AtomicI32,
    boot_failed: AtomicBool,
    state: Mutex<KernelState>,
    exit_code: Mutex<ExitCode>,
    stop_once: Once,
    stop_reason: Mutex<Option<String>>,
    stop_requested_at: Mutex<Option<Instant>>,
    exited: AtomicBool,
    exit_handler: ExitHandler,
    /// Runtime `run` executes on; lets `stop` spawn the teardown from foreign threads.
    runtime: Mutex<Option<Handle>>,
}

impl Kernel {
    /// Shorthand for [`KernelBuilder::new`].
    pub fn builder(cfg: KernelConfig) -> KernelBuilder {
        KernelBuilder::new(cfg)
    }

    pub(crate) fn new(parts: KernelParts) -> Self {
        Self {
            middleware_token: parts.root.child_token(),
            cfg: parts.cfg,
            stages: parts.stages,
            middlewares: parts.middlewares,
            bus: parts.bus,
            subscribers: Mutex::new(parts.subscribers),
            health: parts.health,
            running: parts.running,
            stopping: parts.stopping,
            stopped: CancellationToken::new(),
            started: AtomicBool::new(false),
            foreground: AtomicI32::new(0),
            boot_failed: AtomicBool::new(false),
            state: Mutex::new(KernelState::Built),
            exit_code: Mutex::new(ExitCode::Error),
            stop_once: Once::new(),
            stop_reason: Mutex::new(None),
            stop_requested_at: Mutex::new(None),
            exited: AtomicBool::new(false),
            exit_handler: parts.exit_handler,
            runtime: Mutex::new(None),
        }
    }

    /// Runs the kernel until it stopped, then invokes the exit handler.
    ///
    /// Returns the final exit code after the handler returned, which only
    /// happens with a custom handler. A second call returns the current code
    /// without running anything.
    pub async fn run(self: &Arc<Self>) -> ExitCode {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("kernel is already running");
            return self.exit_code();
        }
        self.transition(KernelState::Booting);
        *self.runtime.lock() = Some(Handle::current());

        let foreground = self
            .module_states()
            .iter()
            .filter(|m| !m.config().background)
            .count();
        self.foreground
            .store(i32::try_from(foreground).unwrap_or(i32::MAX), Ordering::SeqCst);

        let listener_done = CancellationToken::new();
        let listener = self.subscriber_listener(listener_done.clone());

        tracing::info!(
            stages = ?self.stages.keys().collect::<Vec<_>>(),
            modules = self.module_states().len(),
            foreground,
            "starting kernel"
        );
        self.bus.publish(Event::new(EventKind::KernelStarting));

        let signals = self.signal_listener();
        let handler = middleware::compose(&self.middlewares, self.run_handler_fn());
        let res = AssertUnwindSafe(handler(self.middleware_token.clone()))
            .catch_unwind()
            .await;
        if let Err(payload) = res {
            let err = KernelError::Panicked {
                source: resolve_panic(payload),
            };
            tracing::error!(error = %err, "kernel run panicked");
            self.set_exit_code(ExitCode::Error);
            self.stop(err.to_string());
        }
        signals.abort();

        let code = self.exit_code();
        self.exit(code, listener_done, listener).await;
        code
    }

    /// Requests the kernel to stop. Only the first call (of any trigger) counts.
    ///
    /// May be called from any thread once [`run`](Kernel::run) started; before
    /// that it must be called from within a tokio runtime, otherwise it is ignored.
    pub fn stop(self: &Arc<Self>, reason: impl Into<String>) {
        let reason = reason.into();
        let Some(runtime) = Handle::try_current()
            .ok()
            .or_else(|| self.runtime.lock().clone())
        else {
            tracing::error!(reason = %reason, "kernel stop ignored: no tokio runtime and kernel not running");
            return;
        };
        self.stop_once.call_once(|| {
            *self.stop_requested_at.lock() = Some(Instant::now());
            *self.stop_reason.lock() = Some(reason.clone());
            self.transition(KernelState::Stopping);

            tracing::info!(reason = %reason, "stopping kernel");
            self.bus
                .publish(Event::new(EventKind::StopRequested).with_reason(reason.as_str()));
            self.stopping.cancel();

            let kernel = Arc::clone(self);
            runtime.spawn(async move { kernel.teardown().await });
        });
    }

    /// Current lifecycle state.
    pub fn state(&self) -> KernelState {
        *self.state.lock()
    }

    /// Exit code the kernel would exit with right now.
    ///
    /// `Error` until shutdown completed.
    pub fn exit_code(&self) -> ExitCode {
        *self.exit_code.lock()
    }

    /// Reason of the first stop trigger.
    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.lock().clone()
    }

    /// Cancelled once every stage booted.
    pub fn running(&self) -> CancellationToken {
        self.running.clone()
    }

    /// Cancelled once the first stop trigger fired.
    pub fn stopping(&self) -> CancellationToken {
        self.stopping.clone()
    }

    /// Cancelled once every stage stopped.
    pub fn stopped(&self) -> CancellationToken {
        self.stopped.clone()
    }

    /// Handle for health endpoints.
    pub fn health_checker(&self) -> HealthChecker {
        self.health.clone()
    }

    /// Probes every module once.
    pub async fn health_check(&self) -> HealthCheckResult {
        self.health.check().await
    }

    /// Kernel configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.cfg
    }

    /// Every registered module, by stage then name.
    pub fn module_states(&self) -> Vec<Arc<ModuleState>> {
        self.stages.values().flat_map(|stage| stage.modules()).collect()
    }

    pub(crate) fn stopping_token(&self) -> &CancellationToken {
        &self.stopping
    }

    fn run_handler_fn(self: &Arc<Self>) -> Handler {
        let kernel = Arc::clone(self);
        Arc::new(move |_ctx: CancellationToken| -> HandlerFuture {
            let kernel = Arc::clone(&kernel);
            Box::pin(async move { kernel.run_handler().await })
        })
    }

    async fn run_handler(self: &Arc<Self>) {
        // a stop interrupts the boot so the kill timeout below bounds it
        let booted = tokio::select! {
            res = self.boot_stages() => res,
            _ = self.stopping.cancelled() => Err(KernelError::Stopping),
        };
        match booted {
            Ok(()) => {
                self.transition(KernelState::Running);
                self.running.cancel();
                tracing::info!("kernel up and running");
                self.bus.publish(Event::new(EventKind::KernelRunning));
            }
            Err(KernelError::Stopping) => {}
            Err(err) if self.stopping.is_cancelled() => {
                tracing::debug!(error = %err, "stage boot interrupted by stop");
            }
            Err(err) => {
                self.boot_failed.store(true, Ordering::SeqCst);
                tracing::error!(error = %err, "error during running all stages");
                self.stop(format!("error during running all stages: {err}"));
            }
        }

        let tokens: Vec<CancellationToken> = self.stages.values().map(|s| s.token()).collect();
        let all_done = join_all(tokens.iter().map(|t| t.cancelled()));
        tokio::select! {
            _ = all_done => self.stop("context done"),
            _ = self.stopping.cancelled() => {}
        }

        self.wait_stopped().await;
    }

    async fn boot_stages(self: &Arc<Self>) -> Result<(), KernelError> {
        for stage in self.stages.values() {
            if self.stopping.is_cancelled() {
                return Err(KernelError::Stopping);
            }
            let index = stage.index();
            tracing::debug!(stage = index, modules = stage.modules().len(), "booting stage");
            self.bus
                .publish(Event::new(EventKind::StageBooting).with_stage(index));

            stage.run(self).await?;

            tracing::debug!(stage = index, "stage booted");
            self.bus
                .publish(Event::new(EventKind::StageBooted).with_stage(index));
        }
        Ok(())
    }

    async fn wait_stopped(&self) {
        let requested = (*self.stop_requested_at.lock()).unwrap_or_else(Instant::now);
        let deadline = requested + self.cfg.kill_timeout;

        tokio::select! {
            _ = self.stopped.cancelled() => {
                let failed = self.boot_failed.load(Ordering::SeqCst)
                    || self.stages.values().any(|s| s.failure().is_some());
                self.set_exit_code(if failed { ExitCode::Error } else { ExitCode::Ok });
            }
            _ = tokio::time::sleep_until(deadline) => {
                let blocking: Vec<String> = self
                    .module_states()
                    .iter()
                    .filter(|m| m.is_running())
                    .map(|m| m.name().to_string())
                    .collect();
                let err = KernelError::ShutdownTimeout {
                    timeout: self.cfg.kill_timeout,
                    blocking,
                };
                tracing::error!(error = %err, "forcing kernel shutdown");
                self.bus
                    .publish(Event::new(EventKind::ShutdownForced).with_reason(err.to_string()));
                self.set_exit_code(ExitCode::Forced);
            }
        }
    }

    async fn teardown(self: Arc<Self>) {
        for stage in self.stages.values().rev() {
            let index = stage.index();
            stage.stop_wait().await;

            let mut ev = Event::new(EventKind::StageStopped).with_stage(index);
            match stage.failure() {
                Some(err) => {
                    tracing::warn!(stage = index, error = %err, "stage stopped with errors");
                    ev = ev.with_reason(err.to_string());
                }
                None => tracing::debug!(stage = index, "stage stopped"),
            }
            self.bus.publish(ev);
        }

        tracing::info!("all stages stopped");
        self.stopped.cancel();
        self.middleware_token.cancel();
    }

    /// Runs one module; called from the module's stage coffin.
    pub(crate) async fn run_module(
        self: Arc<Self>,
        state: Arc<ModuleState>,
        token: CancellationToken,
    ) -> Result<(), Arc<ModuleError>> {
        let name = state.name().to_string();
        let kind = state.kind();
        let stage = state.stage();

        tracing::info!(module = %name, kind = %kind, stage, "running module");
        self.bus.publish(
            Event::new(EventKind::ModuleStarting)
                .with_module(name.as_str())
                .with_stage(stage),
        );

        state.mark_running();
        let res = AssertUnwindSafe(state.module().run(token))
            .catch_unwind()
            .await;
        let err = match res {
            Ok(Ok(())) | Ok(Err(ModuleError::Canceled)) => None,
            Ok(Err(err)) => Some(Arc::new(err)),
            Err(payload) => Some(Arc::new(ModuleError::from_error(resolve_panic(payload)))),
        };

        match &err {
            None => {
                tracing::info!(module = %name, kind = %kind, stage, "stopped running module");
                self.bus.publish(
                    Event::new(EventKind::ModuleStopped)
                        .with_module(name.as_str())
                        .with_stage(stage),
                );
            }
            Some(err) => {
                tracing::error!(module = %name, kind = %kind, stage, error = %err, "error running module");
                self.bus.publish(
                    Event::new(EventKind::ModuleFailed)
                        .with_module(name.as_str())
                        .with_stage(stage)
                        .with_reason(err.to_string()),
                );
            }
        }
        state.mark_exited(err.clone());

        let cfg = state.config();
        if cfg.essential {
            self.stop(format!("the essential module [{name}] has stopped running"));
        } else if !cfg.background {
            let prev = self
                .foreground
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then(|| n - 1));
            if prev == Ok(1) {
                self.stop("no more foreground modules in running state");
            }
        }

        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn subscriber_listener(&self, done: CancellationToken) -> JoinHandle<()> {
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        let mut rx = self.bus.subscribe();

        tokio::spawn(async move {
            let set = SubscriberSet::new(subscribers);
            loop {
                tokio::select! {
                    biased;
                    ev = rx.recv() => match ev {
                        Ok(ev) => set.emit(&ev),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "subscriber listener lagged behind");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = done.cancelled() => {
                        while let Ok(ev) = rx.try_recv() {
                            set.emit(&ev);
                        }
                        break;
                    }
                }
            }
            set.shutdown().await;
        })
    }

    fn signal_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            match shutdown::wait_for_shutdown_signal().await {
                Ok(signal) => kernel.stop(format!("signal {signal}")),
                Err(err) => tracing::warn!(error = %err, "can not listen for termination signals"),
            }
        })
    }

    async fn exit(&self, code: ExitCode, listener_done: CancellationToken, listener: JoinHandle<()>) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }

        let reason = self.stop_reason().unwrap_or_default();
        tracing::info!(exit_code = code.code(), reason = %reason, "leaving kernel");
        self.bus.publish(
            Event::new(EventKind::KernelExited)
                .with_exit_code(code)
                .with_reason(reason),
        );
        *self.state.lock() = KernelState::Terminated(code);

        listener_done.cancel();
        if tokio::time::timeout(SUBSCRIBER_FLUSH_TIMEOUT, listener)
            .await
            .is_err()
        {
            tracing::warn!("subscribers did not drain before exit");
        }

        (self.exit_handler)(code);
    }

    fn set_exit_code(&self, code: ExitCode) {
        *self.exit_code.lock() = code;
    }

    /// Moves forward in the lifecycle; never goes back.
    fn transition(&self, next: KernelState) {
        let mut state = self.state.lock();
        let rank = |s: &KernelState| match s {
            KernelState::Built => 0,
            KernelState::Booting => 1,
            KernelState::Running => 2,
            KernelState::Stopping => 3,
            KernelState::Terminated(_) => 4,
        };
        if rank(&next) > rank(&*state) {
            *state = next;
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("state", &self.state())
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .field(
                "booted",
                &self
                    .stages
                    .values()
                    .filter(|s| s.is_booted())
                    .map(|s| s.index())
                    .collect::<Vec<_>>(),
            )
            .field("foreground", &self.foreground.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;

    use super::*;
    use crate::core::config::HealthCheckConfig;
    use crate::core::middleware::{Position, simple_middleware};
    use crate::error::BoxError;
    use crate::modules::{
        HealthCheckedModule, Module, ModuleFn, ModuleKind, ModuleOptions, ModuleRef,
        STAGE_APPLICATION, STAGE_ESSENTIAL, STAGE_SERVICE,
    };

    type Codes = Arc<Mutex<Vec<ExitCode>>>;

    fn cfg() -> KernelConfig {
        KernelConfig {
            kill_timeout: Duration::from_secs(1),
            health_check: HealthCheckConfig {
                timeout: Duration::from_secs(1),
                wait_interval: Duration::from_millis(10),
            },
            ..KernelConfig::default()
        }
    }

    fn builder(codes: &Codes) -> KernelBuilder {
        let codes = Arc::clone(codes);
        KernelBuilder::new(cfg()).with_exit_handler(move |code| codes.lock().push(code))
    }

    async fn run(kernel: &Arc<Kernel>) -> ExitCode {
        tokio::time::timeout(Duration::from_secs(5), kernel.run())
            .await
            .expect("kernel exits in time")
    }

    fn waiting() -> ModuleRef {
        ModuleFn::arc(|ctx: CancellationToken| async move {
            ctx.cancelled().await;
            Ok::<_, ModuleError>(())
        })
    }

    fn returning_after(ms: u64) -> ModuleRef {
        ModuleFn::arc(move |_ctx: CancellationToken| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, ModuleError>(())
        })
    }

    /// Runs until cancelled; reports healthy once it has been running for `delay`.
    struct Gated {
        ready: AtomicBool,
        delay: Duration,
    }

    impl Gated {
        fn after(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                ready: AtomicBool::new(false),
                delay,
            })
        }
    }

    #[async_trait]
    impl Module for Gated {
        async fn run(&self, ctx: CancellationToken) -> Result<(), ModuleError> {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.delay) => self.ready.store(true, Ordering::SeqCst),
            }
            ctx.cancelled().await;
            Ok(())
        }

        fn as_health_checked(&self) -> Option<&dyn HealthCheckedModule> {
            Some(self)
        }
    }

    #[async_trait]
    impl HealthCheckedModule for Gated {
        async fn is_healthy(&self) -> Result<bool, ModuleError> {
            Ok(self.ready.load(Ordering::SeqCst))
        }
    }

    /// Runs until cancelled; its health probe never answers.
    struct Unresponsive;

    #[async_trait]
    impl Module for Unresponsive {
        async fn run(&self, ctx: CancellationToken) -> Result<(), ModuleError> {
            ctx.cancelled().await;
            Ok(())
        }

        fn as_health_checked(&self) -> Option<&dyn HealthCheckedModule> {
            Some(self)
        }
    }

    #[async_trait]
    impl HealthCheckedModule for Unresponsive {
        async fn is_healthy(&self) -> Result<bool, ModuleError> {
            std::future::pending::<()>().await;
            Ok(true)
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().iter().map(|ev| ev.kind).collect()
        }

        fn stages_of(&self, kind: EventKind) -> Vec<i32> {
            self.events
                .lock()
                .iter()
                .filter(|ev| ev.kind == kind)
                .filter_map(|ev| ev.stage)
                .collect()
        }

        fn position(&self, kind: EventKind, module: &str) -> usize {
            self.events
                .lock()
                .iter()
                .position(|ev| ev.kind == kind && ev.module.as_deref() == Some(module))
                .expect("event recorded")
        }
    }

    #[async_trait]
    impl Subscribe for Recorder {
        async fn on_event(&self, event: &Event) {
            self.events.lock().push(event.clone());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn essential_module_stops_kernel() {
        let codes = Codes::default();
        let kernel = builder(&codes)
            .with_module_options(
                "db",
                ModuleOptions::new().kind(ModuleKind::Essential),
                |_ctx| Ok::<_, ModuleError>(returning_after(50)),
            )
            .with_module_instance("api", waiting())
            .build()
            .expect("build");

        assert_eq!(run(&kernel).await, ExitCode::Ok);
        assert_eq!(
            kernel.stop_reason().as_deref(),
            Some("the essential module [db] has stopped running")
        );
        assert_eq!(*codes.lock(), vec![ExitCode::Ok]);
        assert_eq!(kernel.state(), KernelState::Terminated(ExitCode::Ok));
        assert!(kernel.stopped().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn last_foreground_module_stops_kernel() {
        let codes = Codes::default();
        let kernel = builder(&codes)
            .with_module_instance("job", returning_after(20))
            .with_module_options(
                "metrics",
                ModuleOptions::new().kind(ModuleKind::Background),
                |_ctx| Ok::<_, ModuleError>(waiting()),
            )
            .build()
            .expect("build");

        assert_eq!(run(&kernel).await, ExitCode::Ok);
        assert_eq!(
            kernel.stop_reason().as_deref(),
            Some("no more foreground modules in running state")
        );
        let metrics = kernel
            .module_states()
            .into_iter()
            .find(|m| m.name() == "metrics")
            .expect("metrics module");
        assert!(metrics.has_exited());
        assert!(metrics.error().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stuck_module_forces_exit() {
        let codes = Codes::default();
        let stubborn = ModuleFn::arc(|_ctx: CancellationToken| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ModuleError>(())
        });
        let kill_timeout = Duration::from_millis(200);
        let kernel = builder(&codes)
            .with_module_instance("api", waiting())
            .with_module_options(
                "stubborn",
                ModuleOptions::new().kind(ModuleKind::Background),
                move |_ctx| Ok::<_, ModuleError>(stubborn as ModuleRef),
            )
            .with_kill_timeout(kill_timeout)
            .build()
            .expect("build");

        let handle = tokio::spawn({
            let kernel = Arc::clone(&kernel);
            async move { kernel.run().await }
        });
        let running = kernel.running();
        tokio::time::timeout(Duration::from_secs(2), running.cancelled())
            .await
            .expect("kernel runs");

        let stopped_at = Instant::now();
        kernel.stop("deploy");
        assert_eq!(handle.await.expect("join"), ExitCode::Forced);
        let elapsed = stopped_at.elapsed();
        assert!(elapsed >= kill_timeout, "forced too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "forced too late: {elapsed:?}");
        assert_eq!(*codes.lock(), vec![ExitCode::Forced]);
        assert!(!kernel.stopped().is_cancelled());
    }

    #[test]
    fn build_rejects_empty_kernel() {
        let err = KernelBuilder::new(cfg()).build().unwrap_err();
        assert!(matches!(err, KernelError::NoModules));
        assert_eq!(err.exit_code(), ExitCode::NothingToRun);
    }

    #[test]
    fn build_rejects_background_only_kernel() {
        let err = KernelBuilder::new(cfg())
            .with_module_options(
                "metrics",
                ModuleOptions::new().kind(ModuleKind::EssentialBackground),
                |_ctx| Ok::<_, ModuleError>(waiting()),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::NoForegroundModules));
        assert_eq!(err.exit_code(), ExitCode::NoForeground);
    }

    #[test]
    fn build_reports_factory_errors() {
        let err = KernelBuilder::new(cfg())
            .with_module("api", |_ctx| {
                Err::<ModuleRef, _>(ModuleError::fail("port in use"))
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::ModuleFactory { ref name, .. } if name == "api"));
        assert_eq!(
            err.to_string(),
            "can not build module api: execution failed: port in use"
        );

        let err = KernelBuilder::new(cfg())
            .with_module_instance("api", waiting())
            .with_multi_module(|_ctx| {
                Err::<BTreeMap<String, crate::modules::ModuleFactory>, BoxError>("no config".into())
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::MultiModuleFactory { .. }));

        let err = KernelBuilder::new(cfg())
            .with_module_instance("api", waiting())
            .with_middleware(
                |_ctx| Err::<MiddlewareRef, BoxError>("bad middleware".into()),
                Position::End,
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::MiddlewareFactory { .. }));
    }

    #[test]
    fn build_recovers_factory_panics() {
        let err = KernelBuilder::new(cfg())
            .with_module("api", |_ctx| -> Result<ModuleRef, ModuleError> {
                panic!("factory exploded")
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::FactoryPanicked { ref name, .. } if name == "api"));
        assert!(err.to_string().contains("factory exploded"));
    }

    #[test]
    fn build_rejects_duplicate_names_per_stage() {
        let err = KernelBuilder::new(cfg())
            .with_module_instance("api", waiting())
            .with_module_instance("api", waiting())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::DuplicateModule { stage: STAGE_APPLICATION, .. }
        ));

        // same name in another stage is fine
        let kernel = KernelBuilder::new(cfg())
            .with_module_instance("api", waiting())
            .with_module_options("api", ModuleOptions::new().stage(STAGE_SERVICE), |_ctx| {
                Ok::<_, ModuleError>(waiting())
            })
            .build()
            .expect("build");
        assert_eq!(kernel.module_states().len(), 2);
    }

    #[test]
    fn multi_module_factories_are_built_last() {
        let kernel = KernelBuilder::new(cfg())
            .with_multi_module(|_ctx| {
                let mut factories: BTreeMap<String, crate::modules::ModuleFactory> = BTreeMap::new();
                for name in ["consumer-a", "consumer-b"] {
                    factories.insert(
                        name.to_string(),
                        Box::new(|_ctx: &crate::modules::FactoryContext| {
                            Ok::<_, BoxError>(waiting())
                        }),
                    );
                }
                Ok::<_, BoxError>(factories)
            })
            .build()
            .expect("build");

        let names: Vec<String> = kernel
            .module_states()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec!["consumer-a", "consumer-b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn middlewares_wrap_run_in_position_order() {
        let codes = Codes::default();
        let calls: Arc<Mutex<Vec<String>>> = Arc::default();
        let recording = |label: &'static str| {
            let calls = Arc::clone(&calls);
            simple_middleware(move |ctx: CancellationToken, next: Handler| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.lock().push(format!("{label} pre"));
                    next(ctx).await;
                    calls.lock().push(format!("{label} post"));
                }
            })
        };

        let kernel = builder(&codes)
            .with_middleware(recording("a"), Position::End)
            .with_middleware(recording("b"), Position::End)
            .with_middleware(recording("c"), Position::Beginning)
            .with_module_instance("job", returning_after(10))
            .build()
            .expect("build");

        assert_eq!(run(&kernel).await, ExitCode::Ok);
        assert_eq!(
            *calls.lock(),
            vec!["c pre", "a pre", "b pre", "b post", "a post", "c post"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_stop_shuts_down_cleanly() {
        let codes = Codes::default();
        let kernel = builder(&codes)
            .with_module_instance("api", waiting())
            .build()
            .expect("build");

        let handle = tokio::spawn({
            let kernel = Arc::clone(&kernel);
            async move { kernel.run().await }
        });

        let running = kernel.running();
        tokio::time::timeout(Duration::from_secs(2), running.cancelled())
            .await
            .expect("kernel runs");
        assert_eq!(kernel.state(), KernelState::Running);

        kernel.stop("maintenance");
        kernel.stop("ignored");

        let code = handle.await.expect("join");
        assert_eq!(code, ExitCode::Ok);
        assert_eq!(kernel.stop_reason().as_deref(), Some("maintenance"));
        assert_eq!(*codes.lock(), vec![ExitCode::Ok]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_before_run_skips_boot() {
        let codes = Codes::default();
        let kernel = builder(&codes)
            .with_module_instance("api", waiting())
            .build()
            .expect("build");

        kernel.stop("early");
        assert_eq!(run(&kernel).await, ExitCode::Ok);
        assert!(!kernel.running().is_cancelled());
        assert!(kernel.module_states().iter().all(|m| !m.has_exited()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_run_returns_current_code() {
        let codes = Codes::default();
        let kernel = builder(&codes)
            .with_module_instance("job", returning_after(10))
            .build()
            .expect("build");

        assert_eq!(run(&kernel).await, ExitCode::Ok);
        assert_eq!(run(&kernel).await, ExitCode::Ok);
        assert_eq!(codes.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stages_boot_in_order_and_stop_in_reverse() {
        let codes = Codes::default();
        let recorder = Arc::new(Recorder::default());
        let db = Gated::after(Duration::from_millis(100));

        let kernel = builder(&codes)
            .with_subscribers(vec![Arc::clone(&recorder) as Arc<dyn Subscribe>])
            .with_module_options("db", ModuleOptions::new().stage(STAGE_ESSENTIAL), {
                let db = Arc::clone(&db);
                move |_ctx| Ok::<_, ModuleError>(db as ModuleRef)
            })
            .with_module_options("server", ModuleOptions::new().stage(STAGE_SERVICE), |_ctx| {
                Ok::<_, ModuleError>(waiting())
            })
            .with_module_instance("app", waiting())
            .build()
            .expect("build");

        let handle = tokio::spawn({
            let kernel = Arc::clone(&kernel);
            async move { kernel.run().await }
        });
        let running = kernel.running();
        tokio::time::timeout(Duration::from_secs(2), running.cancelled())
            .await
            .expect("kernel runs");
        assert!(db.ready.load(Ordering::SeqCst));
        assert!(kernel.health_check().await.is_healthy());

        kernel.stop("done");
        assert_eq!(handle.await.expect("join"), ExitCode::Ok);

        assert_eq!(
            recorder.stages_of(EventKind::StageBooted),
            vec![STAGE_ESSENTIAL, STAGE_SERVICE, STAGE_APPLICATION]
        );
        assert_eq!(
            recorder.stages_of(EventKind::StageStopped),
            vec![STAGE_APPLICATION, STAGE_SERVICE, STAGE_ESSENTIAL]
        );
        assert!(
            recorder.position(EventKind::ModuleStarting, "db")
                < recorder.position(EventKind::ModuleStarting, "server")
        );
        assert!(
            recorder.position(EventKind::ModuleStopped, "app")
                < recorder.position(EventKind::ModuleStopped, "db")
        );

        let kinds = recorder.kinds();
        assert_eq!(kinds.first(), Some(&EventKind::KernelStarting));
        assert_eq!(kinds.last(), Some(&EventKind::KernelExited));
        let exited = recorder.events.lock().last().cloned().expect("exit event");
        assert_eq!(exited.exit_code, Some(ExitCode::Ok));
        assert_eq!(exited.reason.as_deref(), Some("done"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unhealthy_stage_aborts_boot() {
        let codes = Codes::default();
        let mut config = cfg();
        config.health_check.timeout = Duration::from_millis(200);

        let kernel = KernelBuilder::new(config)
            .with_exit_handler({
                let codes = Arc::clone(&codes);
                move |code| codes.lock().push(code)
            })
            .with_module_options("db", ModuleOptions::new().stage(STAGE_ESSENTIAL), |_ctx| {
                Ok::<_, ModuleError>(Gated::after(Duration::from_secs(60)) as ModuleRef)
            })
            .with_module_instance("app", waiting())
            .build()
            .expect("build");

        assert_eq!(run(&kernel).await, ExitCode::Error);
        let reason = kernel.stop_reason().expect("reason");
        assert!(reason.starts_with("error during running all stages: stage 0 not healthy"));
        assert!(!kernel.running().is_cancelled());

        // the application stage never started
        let app = kernel
            .module_states()
            .into_iter()
            .find(|m| m.name() == "app")
            .expect("app module");
        assert!(!app.has_exited());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn module_panic_is_an_error() {
        let codes = Codes::default();
        let kernel = builder(&codes)
            .with_module_options(
                "boom",
                ModuleOptions::new().kind(ModuleKind::Essential),
                |_ctx| {
                    Ok::<_, ModuleError>(ModuleFn::arc(|ctx: CancellationToken| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        if !ctx.is_cancelled() {
                            panic!("module exploded");
                        }
                        Ok::<_, ModuleError>(())
                    }) as ModuleRef)
                },
            )
            .with_module_instance("api", waiting())
            .build()
            .expect("build");

        assert_eq!(run(&kernel).await, ExitCode::Error);
        let boom = kernel
            .module_states()
            .into_iter()
            .find(|m| m.name() == "boom")
            .expect("boom module");
        let err = boom.error().expect("recorded panic");
        assert!(err.to_string().contains("module exploded"));
        assert_eq!(*codes.lock(), vec![ExitCode::Error]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn module_error_does_not_cancel_siblings() {
        let codes = Codes::default();
        let kernel = builder(&codes)
            .with_module(
                "broken",
                |_ctx| {
                    Ok::<_, ModuleError>(ModuleFn::arc(|_ctx: CancellationToken| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err::<(), _>(ModuleError::fail("lost connection"))
                    }) as ModuleRef)
                },
            )
            .with_module_instance("api", waiting())
            .build()
            .expect("build");

        let handle = tokio::spawn({
            let kernel = Arc::clone(&kernel);
            async move { kernel.run().await }
        });

        let states = kernel.module_states();
        let broken = states.iter().find(|m| m.name() == "broken").expect("broken");
        let api = states.iter().find(|m| m.name() == "api").expect("api");
        tokio::time::timeout(Duration::from_secs(2), async {
            while !broken.has_exited() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("broken module exits");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(api.is_running());
        assert!(kernel.stop_reason().is_none());

        kernel.stop("test over");
        assert_eq!(handle.await.expect("join"), ExitCode::Error);
        assert!(api.error().is_none());
        assert_eq!(
            broken.error().map(|err| err.to_string()).as_deref(),
            Some("execution failed: lost connection")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_parent_token_stops_kernel() {
        let codes = Codes::default();
        let parent = CancellationToken::new();
        let kernel = builder(&codes)
            .with_token(parent.clone())
            .with_module_instance("api", waiting())
            .with_module_instance("worker", waiting())
            .build()
            .expect("build");

        let handle = tokio::spawn({
            let kernel = Arc::clone(&kernel);
            async move { kernel.run().await }
        });
        let running = kernel.running();
        tokio::time::timeout(Duration::from_secs(2), running.cancelled())
            .await
            .expect("kernel runs");

        parent.cancel();
        assert_eq!(handle.await.expect("join"), ExitCode::Ok);
        let reason = kernel.stop_reason().expect("reason");
        assert!(
            reason == "context done" || reason == "no more foreground modules in running state",
            "unexpected reason {reason}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn declared_empty_stage_is_not_an_error() {
        let codes = Codes::default();
        let kernel = builder(&codes)
            .with_stage(512)
            .with_module_instance("job", returning_after(20))
            .build()
            .expect("build");

        assert_eq!(run(&kernel).await, ExitCode::Ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_middleware_exits_with_error() {
        let codes = Codes::default();
        let kernel = builder(&codes)
            .with_middleware(
                simple_middleware(|ctx: CancellationToken, next: Handler| async move {
                    if !ctx.is_cancelled() {
                        panic!("middleware exploded");
                    }
                    next(ctx).await;
                }),
                Position::End,
            )
            .with_module_instance("api", waiting())
            .build()
            .expect("build");

        assert_eq!(run(&kernel).await, ExitCode::Error);
        let reason = kernel.stop_reason().expect("reason");
        assert!(reason.contains("middleware exploded"));
        assert_eq!(*codes.lock(), vec![ExitCode::Error]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_boot_is_bounded_by_kill_timeout() {
        let codes = Codes::default();
        let mut config = cfg();
        config.health_check.timeout = Duration::from_secs(3);
        config.kill_timeout = Duration::from_millis(300);

        let kernel = KernelBuilder::new(config)
            .with_exit_handler({
                let codes = Arc::clone(&codes);
                move |code| codes.lock().push(code)
            })
            .with_module_options("db", ModuleOptions::new().stage(STAGE_ESSENTIAL), |_ctx| {
                Ok::<_, ModuleError>(Arc::new(Unresponsive) as ModuleRef)
            })
            .with_module_instance("app", waiting())
            .build()
            .expect("build");

        let handle = tokio::spawn({
            let kernel = Arc::clone(&kernel);
            async move { kernel.run().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(kernel.state(), KernelState::Booting);

        let stopped_at = Instant::now();
        kernel.stop("signal SIGTERM");
        let code = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("exit bounded by kill timeout")
            .expect("join");

        assert_eq!(code, ExitCode::Ok);
        assert!(stopped_at.elapsed() < Duration::from_millis(300) + Duration::from_millis(500));
        assert_eq!(kernel.stop_reason().as_deref(), Some("signal SIGTERM"));
        assert!(!kernel.running().is_cancelled());
        assert_eq!(*codes.lock(), vec![ExitCode::Ok]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hanging_probes_share_one_health_deadline() {
        let codes = Codes::default();
        let mut config = cfg();
        config.health_check.timeout = Duration::from_millis(300);

        let kernel = KernelBuilder::new(config)
            .with_exit_handler({
                let codes = Arc::clone(&codes);
                move |code| codes.lock().push(code)
            })
            .with_module_options("db", ModuleOptions::new().stage(STAGE_ESSENTIAL), |_ctx| {
                Ok::<_, ModuleError>(Arc::new(Unresponsive) as ModuleRef)
            })
            .with_module_options("cache", ModuleOptions::new().stage(STAGE_ESSENTIAL), |_ctx| {
                Ok::<_, ModuleError>(Arc::new(Unresponsive) as ModuleRef)
            })
            .with_module_instance("app", waiting())
            .build()
            .expect("build");

        let started = Instant::now();
        assert_eq!(run(&kernel).await, ExitCode::Error);
        // probes run concurrently: two hanging probes cost one timeout, not two
        assert!(started.elapsed() < Duration::from_millis(550));
        let reason = kernel.stop_reason().expect("reason");
        assert!(reason.contains("stage 0 not healthy"), "{reason}");
        assert!(reason.contains("cache") && reason.contains("db"), "{reason}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_from_foreign_thread() {
        let codes = Codes::default();
        let kernel = builder(&codes)
            .with_module_instance("api", waiting())
            .build()
            .expect("build");

        let handle = tokio::spawn({
            let kernel = Arc::clone(&kernel);
            async move { kernel.run().await }
        });
        let running = kernel.running();
        tokio::time::timeout(Duration::from_secs(2), running.cancelled())
            .await
            .expect("kernel runs");

        let remote = Arc::clone(&kernel);
        std::thread::spawn(move || remote.stop("operator"))
            .join()
            .expect("stop from plain thread");

        assert_eq!(handle.await.expect("join"), ExitCode::Ok);
        assert_eq!(kernel.stop_reason().as_deref(), Some("operator"));
    }

    #[test]
    fn stop_without_runtime_before_run_is_ignored() {
        let kernel = KernelBuilder::new(cfg())
            .with_module_instance("api", waiting())
            .with_exit_handler(|_code| {})
            .build()
            .expect("build");

        kernel.stop("too early");
        assert!(kernel.stop_reason().is_none());
        assert!(!kernel.stopping().is_cancelled());
        assert_eq!(kernel.state(), KernelState::Built);
        assert!(format!("{kernel:?}").contains("booted: []"));
    }
}
