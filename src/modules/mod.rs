//! # Module abstractions.
//!
//! - [`Module`] trait for long-running cancelable units, with the optional
//!   capabilities [`TypedModule`], [`StagedModule`] and [`HealthCheckedModule`];
//! - [`ModuleFn`] closure-backed module;
//! - [`ModuleKind`], [`ModuleOptions`], [`ModuleConfig`] classification;
//! - [`ModuleFactory`], [`MultiModuleFactory`], [`FactoryContext`] registration;
//! - [`ModuleState`] run bookkeeping kept by the kernel.

mod factory;
mod kind;
mod module;
mod module_fn;
mod state;

pub use factory::{FactoryContext, ModuleFactory, MultiModuleFactory};
pub use kind::{
    ModuleConfig, ModuleKind, ModuleOptions, STAGE_APPLICATION, STAGE_ESSENTIAL, STAGE_SERVICE,
};
pub use module::{HealthCheckedModule, Module, ModuleRef, StagedModule, TypedModule};
pub use module_fn::ModuleFn;
pub use state::ModuleState;
