//! # Per-task options for [`Coffin::go_with`](super::Coffin::go_with).

use tokio_util::sync::CancellationToken;

/// Options applied to a single supervised task.
///
/// ## Example
/// ```rust
/// use modvisor::coffin::GoOptions;
///
/// let opts = GoOptions::new()
///     .error_context("consumer orders crashed")
///     .isolated();
/// # let _ = opts;
/// ```
#[derive(Clone, Debug, Default)]
pub struct GoOptions {
    pub(crate) token: Option<CancellationToken>,
    pub(crate) error_context: Option<String>,
    pub(crate) isolated: bool,
}

impl GoOptions {
    /// Default options: coffin token, default error context, failures kill the coffin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands `token` to the task instead of the coffin's token.
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Prefixes the task's error (or panic) with `context` instead of the default
    /// `failed to execute task "<name>" spawned at <file>:<line>`.
    pub fn error_context(mut self, context: impl Into<String>) -> Self {
        self.error_context = Some(context.into());
        self
    }

    /// Records a failure of this task without killing the coffin.
    ///
    /// Siblings keep running; the failure is still reported by `wait`.
    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }
}
