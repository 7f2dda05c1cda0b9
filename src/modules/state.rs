//! Runtime bookkeeping of one registered module.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::kind::{ModuleConfig, ModuleKind};
use super::module::ModuleRef;
use crate::error::ModuleError;

/// A built module together with its resolved config and run state.
pub struct ModuleState {
    name: String,
    module: ModuleRef,
    config: ModuleConfig,
    is_running: AtomicBool,
    exited: AtomicBool,
    err: Mutex<Option<Arc<ModuleError>>>,
}

impl ModuleState {
    pub(crate) fn new(name: String, module: ModuleRef, config: ModuleConfig) -> Self {
        Self {
            name,
            module,
            config,
            is_running: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            err: Mutex::new(None),
        }
    }

    /// Name the module was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The module itself.
    pub fn module(&self) -> &ModuleRef {
        &self.module
    }

    /// Resolved configuration.
    pub fn config(&self) -> ModuleConfig {
        self.config
    }

    /// Kind derived from the configuration.
    pub fn kind(&self) -> ModuleKind {
        self.config.kind()
    }

    /// Stage the module runs in.
    pub fn stage(&self) -> i32 {
        self.config.stage
    }

    /// True while `run` is executing.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// True once `run` returned (or panicked).
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Error the module's run ended with, if any.
    pub fn error(&self) -> Option<Arc<ModuleError>> {
        self.err.lock().clone()
    }

    pub(crate) fn mark_running(&self) {
        self.is_running.store(true, Ordering::Release);
    }

    pub(crate) fn mark_exited(&self, err: Option<Arc<ModuleError>>) {
        if err.is_some() {
            *self.err.lock() = err;
        }
        self.is_running.store(false, Ordering::Release);
        self.exited.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleState")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("is_running", &self.is_running())
            .field("exited", &self.has_exited())
            .finish()
    }
}
