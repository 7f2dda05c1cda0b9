//! # Errors reported by supervised tasks.
//!
//! - [`PanicError`] a panic payload that carried no error of its own;
//! - [`TaskFailure`] one task that returned an error or panicked, with context;
//! - [`CoffinError`] everything a [`Coffin`](super::Coffin) recorded, first error
//!   as primary.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::BoxError;

/// Error shared between every caller of [`Coffin::wait`](super::Coffin::wait).
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// A panic payload converted into an error.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PanicError {
    /// The task panicked with a string message.
    #[error("panic: {message}")]
    Message {
        /// Text of the panic payload.
        message: String,
    },

    /// The payload type can not be rendered.
    #[error("unhandled panic")]
    Unhandled,
}

impl PanicError {
    /// Stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            PanicError::Message { .. } => "panic_message",
            PanicError::Unhandled => "panic_unhandled",
        }
    }
}

/// A supervised task that returned an error or panicked.
#[derive(Error, Debug)]
#[error("{context}: {source}")]
pub struct TaskFailure {
    task: Cow<'static, str>,
    context: String,
    panicked: bool,
    source: BoxError,
}

impl TaskFailure {
    pub(crate) fn returned(task: Cow<'static, str>, context: String, source: BoxError) -> Self {
        Self {
            task,
            context,
            panicked: false,
            source,
        }
    }

    pub(crate) fn panicked(task: Cow<'static, str>, context: String, source: BoxError) -> Self {
        Self {
            task,
            context,
            panicked: true,
            source,
        }
    }

    /// Name the task was spawned with.
    pub fn task(&self) -> &str {
        &self.task
    }

    /// True if the task panicked instead of returning an error.
    pub fn is_panic(&self) -> bool {
        self.panicked
    }

    /// Stable label for logs.
    pub fn as_label(&self) -> &'static str {
        if self.panicked { "task_panicked" } else { "task_failed" }
    }

    /// The error returned by the task (or recovered from its panic).
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.source
    }
}

/// Failures recorded by a coffin.
///
/// Task failures come first in launch order, followed by the first explicit
/// kill reason. The first entry is the [`primary`](CoffinError::primary) error.
#[derive(Clone)]
pub struct CoffinError {
    primary: SharedError,
    rest: Vec<SharedError>,
}

impl CoffinError {
    /// Builds an aggregate from the given errors; `None` if there are none.
    pub(crate) fn from_errors(errors: Vec<SharedError>) -> Option<Self> {
        let mut iter = errors.into_iter();
        let primary = iter.next()?;
        Some(Self {
            primary,
            rest: iter.collect(),
        })
    }

    /// First recorded error.
    pub fn primary(&self) -> &SharedError {
        &self.primary
    }

    /// All recorded errors, primary first.
    pub fn errors(&self) -> impl Iterator<Item = &SharedError> {
        std::iter::once(&self.primary).chain(self.rest.iter())
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        1 + self.rest.len()
    }

    /// Always false: an aggregate holds at least its primary error.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Finds the first error of type `E`, looking through every error's source chain.
    pub fn find<E: StdError + 'static>(&self) -> Option<&E> {
        self.errors().find_map(|err| find_in::<E>(&**err))
    }

    /// True if every recorded error is (or wraps) an `E` matching `pred`.
    pub fn all<E, P>(&self, pred: P) -> bool
    where
        E: StdError + 'static,
        P: Fn(&E) -> bool,
    {
        self.errors()
            .all(|err| find_in::<E>(&**err).is_some_and(&pred))
    }
}

fn find_in<'a, E: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a E> {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if let Some(found) = e.downcast_ref::<E>() {
            return Some(found);
        }
        cur = e.source();
    }
    None
}

impl fmt::Display for CoffinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        for err in &self.rest {
            write!(f, "\n{err}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CoffinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.errors()).finish()
    }
}

impl StdError for CoffinError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.primary)
    }
}
