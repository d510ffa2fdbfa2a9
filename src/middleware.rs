//! Middleware pipeline — composable before/after request handler logic.
//!
//! Each middleware wraps the next layer; the innermost layer is the endpoint.
//! Every layer produces an [`Outcome`]: `Ok(Response)` when the request
//! completed normally, `Err(HandlerError)` when it failed. The [`Pipeline`]
//! runs its [`LifecycleHook`]s on the outcome (on-send for `Ok`, on-error for
//! `Err`) and only then turns an error into the response sent to the client.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining middleware chain.
//! - [`MiddlewareHandler`] — type-erased, cheaply-cloneable middleware function.
//! - [`Pipeline`] — middleware stack + endpoint + hooks + decorations.
//! - [`LoggerMiddleware`] — built-in request/outcome logger.
//! - [`CleanupMiddleware`] / [`CleanupRegistry`] — request-scoped cleanup
//!   callbacks that run whatever the outcome.

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::{Context, Decorations, RequestScope};
use crate::error::HandlerError;
use crate::http::{Response, StatusCode};

/// What a middleware or endpoint produces for one request.
pub type Outcome = Result<Response, HandlerError>;

/// Boxed future returned by middleware and endpoints.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A type-erased, reference-counted middleware function.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_db::context::Context;
/// use rttp_db::middleware::{MiddlewareHandler, Next};
///
/// let handler: MiddlewareHandler = Arc::new(|ctx: Context, next: Next| {
///     Box::pin(async move { next.run(ctx).await })
/// });
/// ```
pub type MiddlewareHandler =
    Arc<dyn Fn(Context, Next) -> BoxFuture<Outcome> + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so each middleware can forward
/// the request at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Which handler the next `run` invokes.
    index: usize,
}

impl Next {
    /// Creates a `Next` positioned at the start of the given handler chain.
    ///
    /// # Arguments
    ///
    /// - `middlewares` — the ordered handlers; the last one is normally the endpoint.
    pub fn new(middlewares: impl Into<Arc<[MiddlewareHandler]>>) -> Self {
        Self {
            middlewares: middlewares.into(),
            index: 0,
        }
    }

    /// Invokes the next handler in the chain.
    ///
    /// If the chain is exhausted without any layer producing an outcome, a
    /// `500 Internal Server Error` response is returned as a fallback.
    ///
    /// # Arguments
    ///
    /// - `ctx` — the per-request [`Context`] handed to the next layer.
    ///
    /// # Returns
    ///
    /// The [`Outcome`] of the remaining chain.
    pub async fn run(mut self, ctx: Context) -> Outcome {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => Ok(Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")),
        }
    }
}

/// The core middleware trait.
///
/// Implementors may pass through (`next.run(ctx).await`), short-circuit with
/// their own outcome, or inspect and modify the downstream outcome.
///
/// Middleware is shared across Tokio tasks: it must be `Send + Sync` and must
/// not hold locks across `.await` points.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<Outcome>;
}

/// Conversion trait for async endpoint functions.
///
/// Any `Fn(Context) -> impl Future<Output = Outcome> + Send` that is also
/// `Send + Sync + 'static` implements this trait via the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> BoxFuture<Outcome>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Outcome> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture<Outcome> {
        Box::pin((self)(ctx))
    }
}

/// Request-completion callbacks, registered once for the life of a [`Pipeline`].
///
/// Exactly one of the two methods runs per request, after the whole
/// middleware chain has finished.
#[async_trait]
pub trait LifecycleHook: Send + Sync + 'static {
    /// Identifies the hook; a pipeline keeps at most one hook per name.
    fn name(&self) -> &'static str;

    /// The request produced a response.
    async fn on_send(&self, scope: &RequestScope, response: &Response);

    /// The request failed with `error`.
    async fn on_error(&self, scope: &RequestScope, error: &HandlerError);
}

/// A middleware stack in front of one endpoint.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_db::context::Context;
/// use rttp_db::http::{Response, StatusCode};
/// use rttp_db::middleware::{LoggerMiddleware, Outcome, Pipeline};
///
/// async fn health(_ctx: Context) -> Outcome {
///     Ok(Response::new(StatusCode::Ok).body("ok"))
/// }
///
/// # async fn example() {
/// let mut pipeline = Pipeline::new(health);
/// pipeline.layer(LoggerMiddleware);
///
/// let response = pipeline.dispatch(Context::new("GET", "/health")).await;
/// assert_eq!(response.status(), StatusCode::Ok);
/// # }
/// ```
pub struct Pipeline {
    middlewares: Vec<MiddlewareHandler>,
    endpoint: MiddlewareHandler,
    hooks: Vec<Arc<dyn LifecycleHook>>,
    decorations: Decorations,
}

impl Pipeline {
    /// Creates a pipeline with no middleware in front of `endpoint`.
    ///
    /// # Arguments
    ///
    /// - `endpoint` — any async `Fn(Context) -> Outcome`; see [`IntoHandler`].
    pub fn new(endpoint: impl IntoHandler) -> Self {
        let endpoint = Arc::new(endpoint);
        Self {
            middlewares: Vec::new(),
            endpoint: Arc::new(move |ctx: Context, _next: Next| endpoint.call(ctx)),
            hooks: Vec::new(),
            decorations: Decorations::default(),
        }
    }

    /// Appends a middleware; earlier layers wrap later ones.
    ///
    /// # Returns
    ///
    /// `&mut Self`, so layers can be chained.
    pub fn layer<M>(&mut self, middleware: M) -> &mut Self
    where
        M: Middleware + 'static,
    {
        self.middlewares.push(from_middleware(Arc::new(middleware)));
        self
    }

    /// Registers a completion hook. A second hook with the same name is ignored.
    pub fn hook(&mut self, hook: Arc<dyn LifecycleHook>) -> &mut Self {
        if self.hooks.iter().any(|h| h.name() == hook.name()) {
            debug!(hook = hook.name(), "lifecycle hook already registered");
        } else {
            self.hooks.push(hook);
        }
        self
    }

    /// Exposes `value` to every request under `name`.
    ///
    /// Handlers read it back with [`Context::decoration`]. Decorating a name
    /// twice replaces the earlier value and logs a warning.
    ///
    /// # Arguments
    ///
    /// - `name` — the lookup key, for example the configured decorator name.
    /// - `value` — shared by every request; cloning it is a reference-count bump.
    pub fn decorate<T>(&mut self, name: &str, value: Arc<T>) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        if self.decorations.contains(name) {
            warn!(decorator = name, "replacing existing decoration");
        }
        self.decorations.insert(name, value);
        self
    }

    /// Returns the value decorated under `name` if it has type `T`.
    pub fn decoration<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.decorations.get(name)
    }

    /// Number of registered completion hooks.
    pub fn hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Runs one request through the chain and its completion hooks.
    ///
    /// The hooks see the request's [`RequestScope`] and the outcome before an
    /// error is turned into its response, so they run on every exit path.
    ///
    /// # Returns
    ///
    /// The response to send: the endpoint's own, or the one built by
    /// [`HandlerError::into_response`].
    pub async fn dispatch(&self, ctx: Context) -> Response {
        let ctx = ctx.with_decorations(self.decorations.clone());
        let scope = ctx.scope().clone();

        let chain: Vec<MiddlewareHandler> = self
            .middlewares
            .iter()
            .cloned()
            .chain(std::iter::once(Arc::clone(&self.endpoint)))
            .collect();

        match Next::new(chain).run(ctx).await {
            Ok(response) => {
                for hook in &self.hooks {
                    hook.on_send(&scope, &response).await;
                }
                response
            }
            Err(err) => {
                for hook in &self.hooks {
                    hook.on_error(&scope, &err).await;
                }
                err.into_response()
            }
        }
    }
}

/// Logs each request's method, path, status, and duration.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<Outcome> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.method().to_owned();
            let path = ctx.path().to_owned();

            let outcome = next.run(ctx).await;

            let duration = start.elapsed();
            match &outcome {
                Ok(response) => info!(
                    "{} {} - {} ({:?})",
                    method,
                    path,
                    response.status().as_u16(),
                    duration
                ),
                Err(err) => info!(
                    "{} {} - {} ({:?}): {}",
                    method,
                    path,
                    err.status_code().as_u16(),
                    duration,
                    err
                ),
            }
            outcome
        })
    }
}

type Cleanup = Box<dyn FnOnce() -> BoxFuture<()> + Send>;

/// Callbacks to run once the current request finishes.
///
/// Installed into the request [`Extensions`](crate::context::Extensions) by
/// [`CleanupMiddleware`]. Callbacks run in registration order.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    callbacks: Arc<Mutex<Vec<Cleanup>>>,
}

impl CleanupRegistry {
    /// Schedules `cleanup` to run when the request finishes.
    pub fn defer<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks
            .lock()
            .push(Box::new(move || Box::pin(cleanup())));
    }

    /// Number of callbacks still waiting to run.
    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs and removes every registered callback, in order.
    pub async fn run_all(&self) {
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for cleanup in callbacks {
            cleanup().await;
        }
    }
}

/// Runs the request's [`CleanupRegistry`] after the rest of the chain, whatever its outcome.
pub struct CleanupMiddleware;

impl Middleware for CleanupMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxFuture<Outcome> {
        Box::pin(async move {
            let registry = CleanupRegistry::default();
            ctx.extensions_mut().insert(registry.clone());

            let outcome = next.run(ctx).await;
            if !registry.is_empty() {
                debug!(callbacks = registry.len(), "running request cleanup");
                registry.run_all().await;
            }
            outcome
        })
    }
}
