//! # Function-backed module (`ModuleFn`)
//!
//! [`ModuleFn`] wraps a closure `F: Fn(CancellationToken) -> Fut`. Each run
//! creates a fresh future; shared state goes through an explicit `Arc` inside the
//! closure.
//!
//! ## Example
//! ```rust
//! use modvisor::{ModuleFn, ModuleKind, ModuleRef, ModuleError, STAGE_SERVICE};
//! use tokio_util::sync::CancellationToken;
//!
//! let m: ModuleRef = ModuleFn::new(|ctx: CancellationToken| async move {
//!     ctx.cancelled().await;
//!     Ok::<_, ModuleError>(())
//! })
//! .with_kind(ModuleKind::Background)
//! .with_stage(STAGE_SERVICE)
//! .into_ref();
//! # let _ = m;
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::kind::ModuleKind;
use super::module::{Module, ModuleRef, StagedModule, TypedModule};
use crate::error::ModuleError;

/// Function-backed module implementation.
#[derive(Debug)]
pub struct ModuleFn<F> {
    f: F,
    kind: Option<ModuleKind>,
    stage: Option<i32>,
}

impl<F> ModuleFn<F> {
    /// Creates a module without declared capabilities.
    pub fn new(f: F) -> Self {
        Self {
            f,
            kind: None,
            stage: None,
        }
    }

    /// Creates the module and returns it as a shared handle.
    ///
    /// Use [`ModuleFn::new`] with the `with_*` builders to declare capabilities.
    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }

    /// Declares the module kind.
    pub fn with_kind(mut self, kind: ModuleKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Declares the boot stage.
    pub fn with_stage(mut self, stage: i32) -> Self {
        self.stage = Some(stage);
        self
    }
}

impl<F, Fut> ModuleFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ModuleError>> + Send + 'static,
{
    /// Returns the module as a shared handle (`Arc<dyn Module>`).
    pub fn into_ref(self) -> ModuleRef {
        Arc::new(self)
    }
}

#[async_trait]
impl<F, Fut> Module for ModuleFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static, // Fn, not FnMut
    Fut: Future<Output = Result<(), ModuleError>> + Send + 'static,
{
    async fn run(&self, ctx: CancellationToken) -> Result<(), ModuleError> {
        (self.f)(ctx).await
    }

    fn as_typed(&self) -> Option<&dyn TypedModule> {
        self.kind.as_ref().map(|kind| kind as &dyn TypedModule)
    }

    fn as_staged(&self) -> Option<&dyn StagedModule> {
        self.stage.map(|_| self as &dyn StagedModule)
    }
}

impl<F: Send + Sync> StagedModule for ModuleFn<F> {
    fn stage(&self) -> i32 {
        self.stage.unwrap_or(super::kind::STAGE_APPLICATION)
    }
}
