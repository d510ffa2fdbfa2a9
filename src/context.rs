//! Per-request context — type-safe state injection and request-scoped clients.
//!
//! A [`Context`] travels by value through the middleware chain. Besides the
//! request line it carries:
//!
//! - [`Extensions`] — type-erased per-request state installed by middleware
//!   (for example the [`CleanupRegistry`](crate::middleware::CleanupRegistry)),
//! - [`Decorations`] — process-lifetime values exposed by name at setup time
//!   (the [`Database`](crate::database::Database) under its decorator name),
//! - [`RequestScope`] — the clients bound to this request, shared with the
//!   pipeline so completion hooks can still reach them after the context has
//!   been consumed by the handler.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::client::Client;

/// Per-request values keyed by their type.
///
/// Middleware stores what later layers need here, for example the
/// [`CleanupRegistry`](crate::middleware::CleanupRegistry).
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value`, replacing any previous value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Returns a reference to the value of type `T`, if one was inserted.
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Removes and returns the value of type `T`.
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Named values exposed to every request, fixed once the pipeline is built.
///
/// Cloning is cheap; all requests share one map.
#[derive(Clone, Default)]
pub struct Decorations {
    map: Arc<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Decorations {
    /// Exposes `value` under `name`, replacing any earlier value of that name.
    pub fn insert<T>(&mut self, name: &str, value: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.map).insert(name.to_owned(), value);
    }

    /// Returns the value registered under `name` if it has type `T`.
    pub fn get<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(name)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
}

impl fmt::Debug for Decorations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}

#[derive(Default)]
struct ScopeState {
    bound: HashMap<String, Client>,
    attached: Vec<Client>,
}

/// Clients acquired during one request.
///
/// `bound` maps a property name to the most recently acquired client so
/// handlers can read it back; `attached` lists, in acquisition order, the
/// clients the completion hooks must release. A cloned scope refers to the
/// same request.
#[derive(Clone, Default)]
pub struct RequestScope {
    state: Arc<Mutex<ScopeState>>,
}

impl RequestScope {
    /// Binds `client` under `name`; a later binding of the same name wins.
    pub fn bind(&self, name: &str, client: Client) {
        self.state.lock().bound.insert(name.to_owned(), client);
    }

    /// The client most recently bound under `name`.
    pub fn client(&self, name: &str) -> Option<Client> {
        self.state.lock().bound.get(name).cloned()
    }

    /// Appends `client` to the list released when the request completes.
    pub fn attach(&self, client: Client) {
        self.state.lock().attached.push(client);
    }

    /// Number of clients waiting to be released when the request completes.
    pub fn attached(&self) -> usize {
        self.state.lock().attached.len()
    }

    /// Empties the attached list, returning its clients in acquisition order.
    pub fn take_attached(&self) -> Vec<Client> {
        std::mem::take(&mut self.state.lock().attached)
    }
}

/// Per-request context handed to middleware and handlers.
pub struct Context {
    method: String,
    path: String,
    extensions: Extensions,
    decorations: Decorations,
    scope: RequestScope,
}

impl Context {
    /// Creates a context for one request with empty extensions and scope.
    ///
    /// Decorations are filled in by [`Pipeline::dispatch`](crate::middleware::Pipeline::dispatch).
    ///
    /// # Arguments
    ///
    /// - `method` — the request method, e.g. `"GET"`.
    /// - `path` — the request path, used only for logging.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            extensions: Extensions::new(),
            decorations: Decorations::default(),
            scope: RequestScope::default(),
        }
    }

    pub(crate) fn with_decorations(mut self, decorations: Decorations) -> Self {
        self.decorations = decorations;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Per-request values installed by middleware.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The clients acquired for this request.
    ///
    /// The pipeline keeps its own handle to the scope, so clients attached
    /// here are still released after the handler has consumed the context.
    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    /// Looks up a value the pipeline exposes under `name`.
    pub fn decoration<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.decorations.get(name)
    }

    /// The client bound to this request under `name`, if one was acquired.
    pub fn client(&self, name: &str) -> Option<Client> {
        self.scope.client(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct RequestId(u64);

    #[test]
    fn extensions_are_keyed_by_type() {
        let mut ext = Extensions::new();
        ext.insert(RequestId(7));
        ext.insert("tenant-a");

        assert_eq!(ext.get::<RequestId>(), Some(&RequestId(7)));
        assert_eq!(ext.get::<&str>(), Some(&"tenant-a"));

        ext.get_mut::<RequestId>().unwrap().0 = 8;
        assert_eq!(ext.remove::<RequestId>(), Some(RequestId(8)));
        assert!(ext.get::<RequestId>().is_none());
    }

    #[test]
    fn decorations_are_typed_by_name() {
        let mut decorations = Decorations::default();
        decorations.insert("limit", Arc::new(20_u32));

        let ctx = Context::new("GET", "/").with_decorations(decorations.clone());
        assert_eq!(ctx.decoration::<u32>("limit").as_deref(), Some(&20));
        assert!(ctx.decoration::<String>("limit").is_none());
        assert!(ctx.decoration::<u32>("missing").is_none());

        // Later inserts do not affect contexts already built.
        decorations.insert("limit", Arc::new(30_u32));
        assert_eq!(ctx.decoration::<u32>("limit").as_deref(), Some(&20));
    }

    #[test]
    fn scope_is_shared_between_clones() {
        let ctx = Context::new("POST", "/orders");
        let scope = ctx.scope().clone();

        assert_eq!(scope.attached(), 0);
        assert!(scope.take_attached().is_empty());
        assert!(ctx.client("dbClient").is_none());
        assert_eq!(ctx.method(), "POST");
        assert_eq!(ctx.path(), "/orders");
    }
}
