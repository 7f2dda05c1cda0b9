//! # Module factories.
//!
//! Modules are registered as factories and built by
//! [`KernelBuilder::build`](crate::KernelBuilder::build) in this order:
//! middlewares, single modules, multi-module factories. A factory failing
//! (or panicking) fails the whole build; nothing runs.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use super::module::ModuleRef;
use crate::core::{HealthChecker, KernelConfig};
use crate::error::BoxError;

/// Builds one module.
pub type ModuleFactory =
    Box<dyn FnOnce(&FactoryContext) -> Result<ModuleRef, BoxError> + Send + 'static>;

/// Builds a dynamically sized set of module factories, keyed by module name.
pub type MultiModuleFactory = Box<
    dyn FnOnce(&FactoryContext) -> Result<BTreeMap<String, ModuleFactory>, BoxError>
        + Send
        + 'static,
>;

/// What a factory can see while the kernel is being built.
#[derive(Clone, Debug)]
pub struct FactoryContext {
    token: CancellationToken,
    config: KernelConfig,
    health: HealthChecker,
}

impl FactoryContext {
    pub(crate) fn new(token: CancellationToken, config: KernelConfig, health: HealthChecker) -> Self {
        Self {
            token,
            config,
            health,
        }
    }

    /// Root token of the kernel; cancelled when the kernel is torn down.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Kernel configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Handle for health endpoints. Results are meaningful once the kernel runs.
    pub fn health_checker(&self) -> HealthChecker {
        self.health.clone()
    }
}
