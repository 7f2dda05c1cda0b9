//! # Stage: one boot group of modules.
//!
//! Every stage owns a [`Coffin`] derived from the kernel's root token. Booting
//! spawns all modules of the stage concurrently into it and then waits until the
//! health-checked ones report healthy. Stopping kills the coffin with the
//! [`KernelError::Stopping`] sentinel and waits for every module to return.
//!
//! ```text
//!   Idle ──run()──► Started ──stop_wait()──► (coffin killed, terminated)
//!    │
//!    └──stop_wait()──► Stopped   (never booted; run() refuses with Stopping)
//! ```
//!
//! ## Rules
//! - The module map is sealed by the first `run()` / `stop_wait()`; `add()` fails afterwards.
//! - Module failures are isolated: they are recorded in the coffin without
//!   cancelling the other modules of the stage.
//! - A stage without modules runs one placeholder task failing with
//!   [`KernelError::EmptyStage`], so its coffin terminates instead of hanging.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::health::probe;
use super::kernel::Kernel;
use crate::coffin::{Coffin, CoffinError, GoOptions};
use crate::error::KernelError;
use crate::modules::ModuleState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Started,
    Stopped,
}

#[derive(Default)]
struct ModuleSet {
    map: BTreeMap<String, Arc<ModuleState>>,
    sealed: bool,
}

pub(crate) struct Stage {
    index: i32,
    coffin: Coffin,
    modules: RwLock<ModuleSet>,
    lifecycle: Mutex<Lifecycle>,
    booted: CancellationToken,
    terminated: CancellationToken,
    err: Mutex<Option<CoffinError>>,
}

impl Stage {
    pub(crate) fn new(index: i32, parent: &CancellationToken) -> Self {
        Self {
            index,
            coffin: Coffin::with_parent(parent),
            modules: RwLock::new(ModuleSet::default()),
            lifecycle: Mutex::new(Lifecycle::Idle),
            booted: CancellationToken::new(),
            terminated: CancellationToken::new(),
            err: Mutex::new(None),
        }
    }

    pub(crate) fn index(&self) -> i32 {
        self.index
    }

    pub(crate) fn add(&self, state: Arc<ModuleState>) -> Result<(), KernelError> {
        let mut set = self.modules.write();
        if set.sealed {
            return Err(KernelError::StageSealed {
                name: state.name().to_string(),
                stage: self.index,
            });
        }
        if set.map.contains_key(state.name()) {
            return Err(KernelError::DuplicateModule {
                name: state.name().to_string(),
                stage: self.index,
            });
        }
        set.map.insert(state.name().to_string(), state);
        Ok(())
    }

    /// Modules of the stage, ordered by name.
    pub(crate) fn modules(&self) -> Vec<Arc<ModuleState>> {
        self.modules.read().map.values().cloned().collect()
    }

    /// Token handed to the modules; cancelled once the stage dies.
    pub(crate) fn token(&self) -> CancellationToken {
        self.coffin.token()
    }

    pub(crate) fn is_booted(&self) -> bool {
        self.booted.is_cancelled()
    }

    /// Everything the stage coffin reported, once the stage has terminated.
    pub(crate) fn error(&self) -> Option<CoffinError> {
        self.err.lock().clone()
    }

    /// The stage error without shutdown noise, if any real failure happened.
    pub(crate) fn failure(&self) -> Option<CoffinError> {
        self.error()
            .filter(|err| !err.all::<KernelError, _>(KernelError::is_benign))
    }

    /// Spawns the modules and waits until the stage is healthy.
    ///
    /// Returns [`KernelError::Stopping`] if the kernel started stopping first.
    pub(crate) async fn run(self: &Arc<Self>, kernel: &Arc<Kernel>) -> Result<(), KernelError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Idle {
                return Err(KernelError::Stopping);
            }
            *lifecycle = Lifecycle::Started;
            self.modules.write().sealed = true;
        }

        let modules = self.modules();
        if modules.is_empty() {
            let stage = self.index;
            self.coffin.go_with(
                format!("stage-{stage}-placeholder"),
                GoOptions::new()
                    .isolated()
                    .error_context(format!("stage {stage}")),
                move |_| async move { Err::<(), KernelError>(KernelError::EmptyStage { stage }) },
            );
        }

        for state in &modules {
            let kernel = Arc::clone(kernel);
            let state = Arc::clone(state);
            let context = format!("error running {} module {}", state.kind(), state.name());
            self.coffin.go_with(
                state.name().to_string(),
                GoOptions::new().isolated().error_context(context),
                move |token| async move { kernel.run_module(state, token).await },
            );
        }

        let stage = Arc::clone(self);
        tokio::spawn(async move {
            let res = stage.coffin.wait().await;
            if let Err(err) = res {
                *stage.err.lock() = Some(err);
            }
            stage.terminated.cancel();
        });

        self.wait_healthy(kernel, &modules).await?;
        self.booted.cancel();
        Ok(())
    }

    async fn wait_healthy(
        &self,
        kernel: &Kernel,
        modules: &[Arc<ModuleState>],
    ) -> Result<(), KernelError> {
        let cfg = kernel.config();
        let timeout = cfg.health_check.timeout;
        let interval = cfg.wait_interval_clamped();
        let deadline = Instant::now() + timeout;
        let stopping = kernel.stopping_token();
        let unhealthy_err = |unhealthy: Vec<String>| KernelError::StageUnhealthy {
            stage: self.index,
            timeout,
            unhealthy,
        };

        loop {
            let pending: Vec<&Arc<ModuleState>> =
                modules.iter().filter(|m| !m.has_exited()).collect();
            let round = join_all(pending.iter().map(|state| probe(state, timeout)));
            let results = tokio::select! {
                results = round => results,
                _ = stopping.cancelled() => return Err(KernelError::Stopping),
                _ = tokio::time::sleep_until(deadline) => {
                    // probes still in flight count as unhealthy
                    let names = pending.iter().map(|m| m.name().to_string()).collect();
                    return Err(unhealthy_err(names));
                }
            };

            let unhealthy: Vec<String> = results
                .into_iter()
                .filter(|r| !r.healthy)
                .map(|r| r.name)
                .collect();
            if unhealthy.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(unhealthy_err(unhealthy));
            }

            tracing::debug!(stage = self.index, ?unhealthy, "waiting for modules to become healthy");
            tokio::select! {
                _ = stopping.cancelled() => return Err(KernelError::Stopping),
                _ = tokio::time::sleep_until(deadline.min(Instant::now() + interval)) => {}
            }
        }
    }

    /// Kills the stage and waits until every module returned.
    pub(crate) async fn stop_wait(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Idle {
                *lifecycle = Lifecycle::Stopped;
                self.modules.write().sealed = true;
                self.terminated.cancel();
                return;
            }
        }

        self.coffin.kill(Some(Box::new(KernelError::Stopping)));
        self.terminated.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleError;
    use crate::modules::{ModuleConfig, ModuleFn};

    fn state(name: &str) -> Arc<ModuleState> {
        let module = ModuleFn::arc(|ctx: CancellationToken| async move {
            ctx.cancelled().await;
            Ok::<_, ModuleError>(())
        });
        Arc::new(ModuleState::new(name.to_string(), module, ModuleConfig::default()))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let stage = Stage::new(7, &CancellationToken::new());
        stage.add(state("api")).expect("first add");
        let err = stage.add(state("api")).unwrap_err();
        assert!(matches!(err, KernelError::DuplicateModule { stage: 7, .. }));
        assert_eq!(
            err.to_string(),
            "failed to add new module api: module exists in stage 7"
        );
        assert_eq!(stage.modules().len(), 1);
    }

    #[tokio::test]
    async fn stopped_stage_is_sealed() {
        let stage = Stage::new(1, &CancellationToken::new());
        stage.add(state("api")).expect("add");
        stage.stop_wait().await;

        let err = stage.add(state("late")).unwrap_err();
        assert!(matches!(err, KernelError::StageSealed { stage: 1, .. }));
        assert!(stage.error().is_none());
        assert!(!stage.is_booted());
    }
}
