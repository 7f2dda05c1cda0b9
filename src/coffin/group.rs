//! # Coffin: a reusable supervised task group.
//!
//! Counters live in a single packed `AtomicU64`: started tasks in the high 32
//! bits, terminated tasks in the low 32 bits. `running = started - terminated`.
//! Reads never take the lock; every write happens under the state lock so that
//! an epoch is only declared dead by the task that finished it.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::{CoffinError, SharedError, TaskFailure};
use super::options::GoOptions;
use super::panic::resolve_panic;
use super::tomb::Tomb;
use crate::error::BoxError;

const STARTED_SHIFT: u32 = 32;
const STARTED_ONE: u64 = 1 << STARTED_SHIFT;
const TERMINATED_MASK: u64 = STARTED_ONE - 1;

#[inline]
fn unpack(status: u64) -> (u64, u64) {
    (status >> STARTED_SHIFT, status & TERMINATED_MASK)
}

/// Token and dead signal of one run of the coffin.
#[derive(Clone)]
pub(crate) struct Epoch {
    pub(crate) token: CancellationToken,
    pub(crate) dead: CancellationToken,
}

impl Epoch {
    fn new(base: Option<&CancellationToken>) -> Self {
        Self {
            token: base.map_or_else(CancellationToken::new, CancellationToken::child_token),
            dead: CancellationToken::new(),
        }
    }
}

struct State {
    epoch: Epoch,
    /// First reason the coffin started dying with.
    reason: Option<SharedError>,
    /// First reason passed to `kill`.
    kill_reason: Option<SharedError>,
    /// Task failures keyed by launch sequence.
    failures: BTreeMap<u64, SharedError>,
}

struct Inner {
    base: Option<CancellationToken>,
    status: AtomicU64,
    state: Mutex<State>,
}

/// Tracks a set of tokio tasks, recovers their panics and reports their failures.
///
/// `Coffin` is a cheap `Arc` handle: clones share the same group, so a clone
/// moved into a task observes the same token, counters and errors.
///
/// # Example
/// ```rust
/// use modvisor::coffin::Coffin;
/// use modvisor::BoxError;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let coffin = Coffin::new();
///     coffin.go("ok", || async { Ok::<(), BoxError>(()) });
///     coffin.go_with_token("waiter", |ctx| async move {
///         ctx.cancelled().await;
///         Ok::<(), BoxError>(())
///     });
///     coffin.go("fails", || async { Err::<(), BoxError>("boom".into()) });
///
///     let err = coffin.wait().await.unwrap_err();
///     assert!(err.to_string().contains("boom"));
///     assert_eq!(coffin.started(), 3);
///     assert_eq!(coffin.running(), 0);
/// }
/// ```
#[derive(Clone)]
pub struct Coffin {
    inner: Arc<Inner>,
}

impl Coffin {
    /// Creates a coffin with an independent token.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a coffin whose tokens are children of `parent`.
    ///
    /// Cancelling `parent` cancels every task of the coffin; the coffin is
    /// still waited on independently.
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self::build(Some(parent.clone()))
    }

    fn build(base: Option<CancellationToken>) -> Self {
        let epoch = Epoch::new(base.as_ref());
        Self {
            inner: Arc::new(Inner {
                base,
                status: AtomicU64::new(0),
                state: Mutex::new(State {
                    epoch,
                    reason: None,
                    kill_reason: None,
                    failures: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Spawns a task. An error or panic kills the coffin.
    ///
    /// Outside a tokio runtime the task is not run; it is recorded as failed.
    #[track_caller]
    pub fn go<F, Fut, E>(&self, name: impl Into<Cow<'static, str>>, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.go_with(name, GoOptions::default(), move |_| f());
    }

    /// Spawns a task receiving the coffin's token.
    #[track_caller]
    pub fn go_with_token<F, Fut, E>(&self, name: impl Into<Cow<'static, str>>, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.go_with(name, GoOptions::default(), f);
    }

    /// Spawns a task with explicit [`GoOptions`].
    ///
    /// The `started` counter is incremented before the task is spawned, so
    /// `started()`/`running()` are consistent as soon as this returns.
    #[track_caller]
    pub fn go_with<F, Fut, E>(&self, name: impl Into<Cow<'static, str>>, options: GoOptions, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let name = name.into();
        let location = Location::caller();
        let GoOptions {
            token,
            error_context,
            isolated,
        } = options;

        let (seq, epoch) = self.launch();
        let token = token.unwrap_or(epoch.token);
        let context = error_context.unwrap_or_else(|| {
            format!(
                "failed to execute task {name:?} spawned at {}:{}",
                location.file(),
                location.line()
            )
        });

        // outside a runtime the task is accounted as failed without being built
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                self.fail(seq, TaskFailure::returned(name, context, Box::new(err)), isolated);
                self.done();
                return;
            }
        };

        // the future factory runs on the caller's stack; a panic there must
        // still be accounted for
        let fut = match catch_unwind(AssertUnwindSafe(|| f(token))) {
            Ok(fut) => fut,
            Err(payload) => {
                let failure = TaskFailure::panicked(name, context, resolve_panic(payload));
                self.fail(seq, failure, isolated);
                self.done();
                return;
            }
        };

        let span = tracing::debug_span!("coffin.task", task = %name);
        let coffin = self.clone();
        runtime.spawn(
            async move {
                let failure = match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(TaskFailure::returned(name, context, err.into())),
                    Err(payload) => {
                        Some(TaskFailure::panicked(name, context, resolve_panic(payload)))
                    }
                };
                if let Some(failure) = failure {
                    tracing::debug!(error = %failure, "supervised task failed");
                    coffin.fail(seq, failure, isolated);
                }
                coffin.done();
            }
            .instrument(span),
        );
    }

    /// Kills the coffin: cancels its token and starts the dying phase.
    ///
    /// Idempotent. The first `Some` reason is recorded and reported by
    /// [`wait`](Coffin::wait); `None` only cancels and never overwrites a reason.
    pub fn kill(&self, reason: Option<BoxError>) {
        let mut state = self.inner.state.lock();
        if let Some(reason) = reason {
            let reason: SharedError = Arc::from(reason);
            if state.kill_reason.is_none() {
                state.kill_reason = Some(Arc::clone(&reason));
            }
            if state.reason.is_none() {
                state.reason = Some(reason);
            }
        }
        state.epoch.token.cancel();
    }

    /// Waits until every launched task has returned.
    ///
    /// Returns immediately if nothing is running. Tasks spawned while waiting
    /// are waited for as well.
    pub async fn wait(&self) -> Result<(), CoffinError> {
        loop {
            let dead = {
                let state = self.inner.state.lock();
                if self.running() == 0 {
                    break;
                }
                state.epoch.dead.clone()
            };
            dead.cancelled().await;
        }

        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Everything recorded so far: task failures in launch order, then the
    /// first kill reason.
    pub fn err(&self) -> Option<CoffinError> {
        let state = self.inner.state.lock();
        let mut errors: Vec<SharedError> = state.failures.values().cloned().collect();
        errors.extend(state.kill_reason.clone());
        CoffinError::from_errors(errors)
    }

    /// First reason the coffin started dying with, if any was given.
    pub fn reason(&self) -> Option<SharedError> {
        self.inner.state.lock().reason.clone()
    }

    /// Token handed to the tasks of the current epoch.
    pub fn token(&self) -> CancellationToken {
        self.inner.state.lock().epoch.token.clone()
    }

    /// True once the current epoch was killed, finished or its parent cancelled.
    pub fn is_dying(&self) -> bool {
        self.inner.state.lock().epoch.token.is_cancelled()
    }

    /// Snapshot of the current epoch.
    ///
    /// Schedule the tasks first, then entomb: once the epoch is dead the next
    /// `go` starts a new one that this tomb does not observe.
    pub fn entomb(&self) -> Tomb {
        let epoch = self.inner.state.lock().epoch.clone();
        Tomb::new(self.clone(), epoch)
    }

    /// Number of tasks started so far.
    pub fn started(&self) -> usize {
        unpack(self.inner.status.load(Ordering::Acquire)).0 as usize
    }

    /// Number of tasks that already returned.
    pub fn terminated(&self) -> usize {
        unpack(self.inner.status.load(Ordering::Acquire)).1 as usize
    }

    /// Number of tasks currently running.
    pub fn running(&self) -> usize {
        let (started, terminated) = unpack(self.inner.status.load(Ordering::Acquire));
        (started - terminated) as usize
    }

    /// Registers a new task and returns its launch sequence and epoch.
    fn launch(&self) -> (u64, Epoch) {
        let mut state = self.inner.state.lock();
        let prev = self.inner.status.fetch_add(STARTED_ONE, Ordering::AcqRel);
        let (started, terminated) = unpack(prev);
        if started > 0 && started == terminated {
            // the previous epoch is dead: reuse the coffin
            state.epoch = Epoch::new(self.inner.base.as_ref());
        }
        (started, state.epoch.clone())
    }

    fn fail(&self, seq: u64, failure: TaskFailure, isolated: bool) {
        let err: SharedError = Arc::new(failure);
        let mut state = self.inner.state.lock();
        state.failures.insert(seq, Arc::clone(&err));
        if isolated {
            return;
        }
        if state.reason.is_none() {
            state.reason = Some(err);
        }
        state.epoch.token.cancel();
    }

    fn done(&self) {
        let state = self.inner.state.lock();
        let status = self.inner.status.fetch_add(1, Ordering::AcqRel) + 1;
        let (started, terminated) = unpack(status);
        if started == terminated {
            state.epoch.token.cancel();
            state.epoch.dead.cancel();
        }
    }
}

impl Default for Coffin {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Coffin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (started, terminated) = unpack(self.inner.status.load(Ordering::Acquire));
        f.debug_struct("Coffin")
            .field("started", &started)
            .field("terminated", &terminated)
            .field("dying", &self.is_dying())
            .finish()
    }
}
