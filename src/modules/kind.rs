//! # Module classification and resolved configuration.
//!
//! | kind                   | essential | background | stops kernel on exit | keeps kernel alive |
//! |------------------------|-----------|------------|----------------------|--------------------|
//! | `foreground`           | no        | no         | when it is the last  | yes                |
//! | `background`           | no        | yes        | no                   | no                 |
//! | `essential`            | yes       | no         | yes                  | yes                |
//! | `essential-background` | yes       | yes        | yes                  | no                 |
//!
//! [`ModuleConfig`] is resolved once at registration with the precedence
//! explicit [`ModuleOptions`] > module capabilities > defaults.

use std::fmt;

use super::module::{Module, TypedModule};

/// Boots first, stops last: metric writers and everything other modules feed.
pub const STAGE_ESSENTIAL: i32 = 0;
/// Services the application relies on, such as servers and producers.
pub const STAGE_SERVICE: i32 = 1024;
/// Application modules. Boots last, stops first.
pub const STAGE_APPLICATION: i32 = 2048;

/// Predefined module kinds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// Keeps the kernel alive; the last one to exit stops it.
    #[default]
    Foreground,
    /// Never affects kernel termination.
    Background,
    /// Stops the kernel as soon as it exits.
    Essential,
    /// Stops the kernel as soon as it exits, but does not keep it alive.
    EssentialBackground,
}

impl ModuleKind {
    /// Builds the kind from its two flags.
    pub fn from_flags(essential: bool, background: bool) -> Self {
        match (essential, background) {
            (false, false) => ModuleKind::Foreground,
            (false, true) => ModuleKind::Background,
            (true, false) => ModuleKind::Essential,
            (true, true) => ModuleKind::EssentialBackground,
        }
    }

    /// Label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Foreground => "foreground",
            ModuleKind::Background => "background",
            ModuleKind::Essential => "essential",
            ModuleKind::EssentialBackground => "essential-background",
        }
    }
}

impl TypedModule for ModuleKind {
    fn is_essential(&self) -> bool {
        matches!(self, ModuleKind::Essential | ModuleKind::EssentialBackground)
    }

    fn is_background(&self) -> bool {
        matches!(self, ModuleKind::Background | ModuleKind::EssentialBackground)
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-registration overrides of a module's declared capabilities.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModuleOptions {
    /// Overrides [`TypedModule`].
    pub kind: Option<ModuleKind>,
    /// Overrides [`StagedModule`](super::StagedModule).
    pub stage: Option<i32>,
}

impl ModuleOptions {
    /// No overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces the module kind.
    pub fn kind(mut self, kind: ModuleKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Forces the boot stage.
    pub fn stage(mut self, stage: i32) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// Resolved classification of a registered module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleConfig {
    /// The kernel stops when the module returns.
    pub essential: bool,
    /// The module does not keep the kernel alive.
    pub background: bool,
    /// Stage the module boots in.
    pub stage: i32,
}

impl Default for ModuleConfig {
    /// Non-essential foreground module in [`STAGE_APPLICATION`].
    fn default() -> Self {
        Self {
            essential: false,
            background: false,
            stage: STAGE_APPLICATION,
        }
    }
}

impl ModuleConfig {
    /// Reads the module's capabilities, falling back to the defaults.
    pub fn probe(module: &dyn Module) -> Self {
        let mut cfg = Self::default();
        if let Some(typed) = module.as_typed() {
            cfg.essential = typed.is_essential();
            cfg.background = typed.is_background();
        }
        if let Some(staged) = module.as_staged() {
            cfg.stage = staged.stage();
        }
        cfg
    }

    /// Applies explicit overrides on top of the probed values.
    pub fn apply(mut self, opts: &ModuleOptions) -> Self {
        if let Some(kind) = opts.kind {
            self.essential = kind.is_essential();
            self.background = kind.is_background();
        }
        if let Some(stage) = opts.stage {
            self.stage = stage;
        }
        self
    }

    /// Kind derived from the two flags.
    pub fn kind(&self) -> ModuleKind {
        ModuleKind::from_flags(self.essential, self.background)
    }
}
