//! # Middleware chain around the kernel run.
//!
//! A [`Middleware`] wraps the kernel's run handler. Middlewares registered first
//! are the outermost layers:
//!
//! ```text
//! with_middleware(A, End), with_middleware(B, End), with_middleware(C, Beginning)
//!
//!   chain = [C, A, B]
//!
//!   C-pre ─► A-pre ─► B-pre ─► run handler ─► B-post ─► A-post ─► C-post
//! ```
//!
//! The handler receives the middleware token, which is cancelled once every stage
//! has stopped.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::modules::FactoryContext;

/// Future returned by a [`Handler`].
pub type HandlerFuture = BoxFuture<'static, ()>;

/// The kernel run handler, or a middleware-wrapped version of it.
pub type Handler = Arc<dyn Fn(CancellationToken) -> HandlerFuture + Send + Sync + 'static>;

/// Shared handle to a middleware.
pub type MiddlewareRef = Arc<dyn Middleware>;

/// Builds one middleware while the kernel is being built.
pub type MiddlewareFactory =
    Box<dyn FnOnce(&FactoryContext) -> Result<MiddlewareRef, BoxError> + Send + 'static>;

/// Where a middleware is inserted into the chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Position {
    /// Prepends: the middleware becomes the outermost layer.
    Beginning,
    /// Appends: the middleware becomes the innermost layer so far.
    #[default]
    End,
}

/// Wraps the next handler of the chain.
pub trait Middleware: Send + Sync + 'static {
    /// Returns a handler that runs `next` somewhere inside.
    fn wrap(&self, next: Handler) -> Handler;
}

/// Closure-backed middleware: `f(ctx, next)` must await `next(ctx)` at some point.
///
/// ## Example
/// ```rust
/// use modvisor::{Handler, MiddlewareFn};
/// use tokio_util::sync::CancellationToken;
///
/// let timing = MiddlewareFn::new(|ctx: CancellationToken, next: Handler| async move {
///     let start = std::time::Instant::now();
///     next(ctx).await;
///     tracing::info!(elapsed = ?start.elapsed(), "kernel finished");
/// });
/// # let _ = timing;
/// ```
pub struct MiddlewareFn<F> {
    f: Arc<F>,
}

impl<F> MiddlewareFn<F> {
    /// Creates the middleware.
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl<F, Fut> Middleware for MiddlewareFn<F>
where
    F: Fn(CancellationToken, Handler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn wrap(&self, next: Handler) -> Handler {
        let f = Arc::clone(&self.f);
        Arc::new(move |ctx: CancellationToken| -> HandlerFuture {
            Box::pin(f(ctx, Arc::clone(&next)))
        })
    }
}

/// Factory for a [`MiddlewareFn`] that needs nothing from the factory context.
pub fn simple_middleware<F, Fut>(f: F) -> MiddlewareFactory
where
    F: Fn(CancellationToken, Handler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |_ctx: &FactoryContext| {
        Ok::<_, BoxError>(Arc::new(MiddlewareFn::new(f)) as MiddlewareRef)
    })
}

/// Wraps `base` so that `chain[0]` is the outermost layer.
pub(crate) fn compose(chain: &[MiddlewareRef], base: Handler) -> Handler {
    chain
        .iter()
        .rev()
        .fold(base, |next, middleware| middleware.wrap(next))
}

/// Inserts a built middleware according to its position.
pub(crate) fn insert(chain: &mut Vec<MiddlewareRef>, middleware: MiddlewareRef, position: Position) {
    match position {
        Position::Beginning => chain.insert(0, middleware),
        Position::End => chain.push(middleware),
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn recording(calls: &Arc<Mutex<Vec<String>>>, label: &'static str) -> MiddlewareRef {
        let calls = Arc::clone(calls);
        Arc::new(MiddlewareFn::new(move |ctx: CancellationToken, next: Handler| {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().push(format!("{label} start"));
                next(ctx).await;
                calls.lock().push(format!("{label} end"));
            }
        }))
    }

    #[tokio::test]
    async fn first_in_chain_is_outermost() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Vec::new();
        insert(&mut chain, recording(&calls, "mid1"), Position::End);
        insert(&mut chain, recording(&calls, "mid2"), Position::End);
        insert(&mut chain, recording(&calls, "mid3"), Position::Beginning);

        let inner = Arc::clone(&calls);
        let base: Handler = Arc::new(move |_ctx: CancellationToken| -> HandlerFuture {
            let inner = Arc::clone(&inner);
            Box::pin(async move { inner.lock().push("handler".to_string()) })
        });

        compose(&chain, base)(CancellationToken::new()).await;

        assert_eq!(
            *calls.lock(),
            vec![
                "mid3 start",
                "mid1 start",
                "mid2 start",
                "handler",
                "mid2 end",
                "mid1 end",
                "mid3 end",
            ]
        );
    }

    #[tokio::test]
    async fn empty_chain_runs_base() {
        let hit = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&hit);
        let base: Handler = Arc::new(move |_ctx: CancellationToken| -> HandlerFuture {
            let flag = Arc::clone(&flag);
            Box::pin(async move { *flag.lock() = true })
        });
        compose(&[], base)(CancellationToken::new()).await;
        assert!(*hit.lock());
    }
}
