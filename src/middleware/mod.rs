//! Middleware pipeline — composable before/after request handler logic.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware wraps the next layer, enabling request inspection, short-circuit
//! responses, and response decoration without coupling handlers to infrastructure
//! concerns.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`] — type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] — converts a [`Middleware`] trait object into a
//!   [`MiddlewareHandler`].
//! - [`RequestLogger`] — built-in access logger with cache outcome.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::gateway::OUTCOME_HEADER;
use crate::{Response, context::Context};

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware (or returns a fallback `500` response when the chain is exhausted
/// without any middleware generating a response).
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
///
/// # Examples
///
/// ```rust,no_run
/// use std::pin::Pin;
/// use larder::{Response, context::Context, middleware::{Middleware, Next}};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(
///         &self,
///         ctx: Context,
///         next: Next,
///     ) -> Pin<Box<dyn std::future::Future<Output = Response> + Send>> {
///         Box::pin(async move { next.run(ctx).await })
///     }
/// }
/// ```
pub struct Next {
    middlewares: Vec<MiddlewareHandler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
///
/// Construct one with [`from_middleware`] or by wrapping a closure directly:
///
/// ```rust,no_run
/// use std::{pin::Pin, sync::Arc};
/// use larder::{Response, context::Context, middleware::{MiddlewareHandler, Next}};
///
/// let handler: MiddlewareHandler = Arc::new(|ctx: Context, next: Next| {
///     Box::pin(async move { next.run(ctx).await })
/// });
/// ```
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use larder::middleware::{RequestLogger, from_middleware};
///
/// let handler = from_middleware(Arc::new(RequestLogger));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// Advances the internal cursor by one, clones the handler at the current
    /// position, and awaits it. If no handler remains (i.e. the chain is
    /// exhausted without producing a response), a `500 Internal Server Error`
    /// response is returned as a safe fallback.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(crate::StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core trait for all larder middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through** — call `next.run(ctx).await` without modification.
/// - **Short-circuit** — return a [`Response`] directly without calling `next`.
/// - **Decorate** — call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited across
///   `.await` points in multi-threaded runtimes.
/// - Implementations **should not** hold `&mut` references to shared state across
///   an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// Built-in access logger.
///
/// Emits one `tracing::info!` record per request after the downstream
/// handler completes, carrying the peer address, host, method, target,
/// status, latency, body sizes and the cache outcome annotation read back
/// off the response.
///
/// `RequestLogger` never short-circuits and returns the downstream response
/// unmodified.
pub struct RequestLogger;

impl Middleware for RequestLogger {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let remote = ctx
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "-".to_owned());
            let host = ctx.request().host().to_owned();
            let method = ctx.request().method().as_str().to_owned();
            let uri = ctx.request().target().to_owned();
            let bytes_in = ctx.request().body().len();

            let response = next.run(ctx).await;

            let outcome = response
                .headers()
                .get(OUTCOME_HEADER)
                .unwrap_or("-")
                .to_owned();
            tracing::info!(
                remote_addr = %remote,
                host = %host,
                method = %method,
                uri = %uri,
                status = response.status().as_u16(),
                latency_ms = start.elapsed().as_millis() as u64,
                bytes_in,
                bytes_out = response.body_len(),
                outcome = %outcome,
                "request"
            );

            response
        })
    }
}
