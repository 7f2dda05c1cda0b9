//! # Health aggregation.
//!
//! [`HealthChecker`] polls every module implementing
//! [`HealthCheckedModule`](crate::HealthCheckedModule); modules without the
//! capability count as healthy. It is an explicit handle: health endpoints get it
//! from [`Kernel::health_checker`](crate::Kernel::health_checker) or from the
//! [`FactoryContext`](crate::FactoryContext) while being built.
//!
//! ## Rules
//! - Every probe is bounded by `health_check.timeout`; a probe that times out,
//!   fails or panics marks the module unhealthy.
//! - Results are ordered by stage index, then module name.
//! - An unhealthy result observed while the kernel runs (and is not stopping) is
//!   logged as an error.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::coffin::resolve_panic;
use crate::error::ModuleError;
use crate::modules::ModuleState;

/// Health of one module.
#[derive(Clone, Debug)]
pub struct ModuleHealthCheckResult {
    /// Stage the module runs in.
    pub stage_index: i32,
    /// Module name.
    pub name: String,
    /// Whether the module reported healthy.
    pub healthy: bool,
    /// Error returned by (or raised while calling) the probe.
    pub err: Option<Arc<ModuleError>>,
}

/// Aggregated health of the kernel's modules.
#[derive(Clone, Debug, Default)]
pub struct HealthCheckResult {
    modules: Vec<ModuleHealthCheckResult>,
}

impl HealthCheckResult {
    pub(crate) fn new(mut modules: Vec<ModuleHealthCheckResult>) -> Self {
        modules.sort_by(|a, b| {
            a.stage_index
                .cmp(&b.stage_index)
                .then_with(|| a.name.cmp(&b.name))
        });
        Self { modules }
    }

    /// True if every module is healthy.
    pub fn is_healthy(&self) -> bool {
        self.modules.iter().all(|m| m.healthy)
    }

    /// Names of the unhealthy modules.
    pub fn unhealthy_names(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| !m.healthy)
            .map(|m| m.name.clone())
            .collect()
    }

    /// Every probe error joined into one error; `None` if no probe failed.
    pub fn err(&self) -> Option<HealthError> {
        let errors: Vec<(String, Arc<ModuleError>)> = self
            .modules
            .iter()
            .filter_map(|m| m.err.as_ref().map(|err| (m.name.clone(), Arc::clone(err))))
            .collect();
        if errors.is_empty() {
            None
        } else {
            Some(HealthError { errors })
        }
    }

    /// Per-module results.
    pub fn modules(&self) -> &[ModuleHealthCheckResult] {
        &self.modules
    }
}

/// Probe errors of a [`HealthCheckResult`].
#[derive(Debug, Clone)]
pub struct HealthError {
    errors: Vec<(String, Arc<ModuleError>)>,
}

impl HealthError {
    /// `(module name, error)` pairs.
    pub fn errors(&self) -> &[(String, Arc<ModuleError>)] {
        &self.errors
    }
}

impl fmt::Display for HealthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, err)) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "health check of module {name} failed: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for HealthError {}

struct Inner {
    modules: OnceLock<Vec<Arc<ModuleState>>>,
    timeout: Duration,
    running: CancellationToken,
    stopping: CancellationToken,
}

/// Cloneable handle that checks the health of every registered module.
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<Inner>,
}

impl HealthChecker {
    pub(crate) fn new(
        timeout: Duration,
        running: CancellationToken,
        stopping: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                modules: OnceLock::new(),
                timeout,
                running,
                stopping,
            }),
        }
    }

    pub(crate) fn register(&self, modules: Vec<Arc<ModuleState>>) {
        if self.inner.modules.set(modules).is_err() {
            tracing::warn!("health checker modules registered twice");
        }
    }

    /// Probes every module concurrently.
    ///
    /// Before the kernel is built the result is empty (and healthy).
    pub async fn check(&self) -> HealthCheckResult {
        let modules = self.inner.modules.get().map(Vec::as_slice).unwrap_or(&[]);
        let timeout = self.inner.timeout;
        let results = join_all(modules.iter().map(|m| probe(m, timeout))).await;
        let result = HealthCheckResult::new(results);

        if !result.is_healthy()
            && self.inner.running.is_cancelled()
            && !self.inner.stopping.is_cancelled()
        {
            match result.err() {
                Some(err) => tracing::error!(
                    unhealthy = ?result.unhealthy_names(),
                    error = %err,
                    "healthcheck failed"
                ),
                None => tracing::error!(
                    unhealthy = ?result.unhealthy_names(),
                    "healthcheck failed"
                ),
            }
        }
        result
    }
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("modules", &self.inner.modules.get().map_or(0, Vec::len))
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

/// Probes one module, bounded by `timeout`.
pub(crate) async fn probe(state: &ModuleState, timeout: Duration) -> ModuleHealthCheckResult {
    let mut result = ModuleHealthCheckResult {
        stage_index: state.stage(),
        name: state.name().to_string(),
        healthy: true,
        err: None,
    };
    let Some(checked) = state.module().as_health_checked() else {
        return result;
    };

    let probe = AssertUnwindSafe(checked.is_healthy()).catch_unwind();
    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(Ok(healthy))) => result.healthy = healthy,
        Ok(Ok(Err(err))) => {
            result.healthy = false;
            result.err = Some(Arc::new(err));
        }
        Ok(Err(payload)) => {
            result.healthy = false;
            result.err = Some(Arc::new(ModuleError::from_error(resolve_panic(payload))));
        }
        Err(_) => {
            result.healthy = false;
            result.err = Some(Arc::new(ModuleError::fail(format!(
                "health check timed out after {timeout:?}"
            ))));
        }
    }
    result
}
