//! Request-scoped acquisition and guaranteed cleanup.
//!
//! [`require_client`] checks a client out for the current request and binds
//! it to the request under the configured `requestDecoratorName`. Release is
//! then guaranteed one of two ways:
//!
//! 1. When [`CleanupMiddleware`](crate::middleware::CleanupMiddleware) runs
//!    in front of the handler, the release is registered as a cleanup
//!    callback on the request's [`CleanupRegistry`].
//! 2. Otherwise the client is appended to the request's attached list and
//!    the [`ClientHooks`] installed by [`DatabasePlugin::install`] release
//!    every attached client, in acquisition order, when the request
//!    completes or fails.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, trace};

use crate::client::Client;
use crate::context::{Context, RequestScope};
use crate::database::Database;
use crate::error::{DatabaseError, HandlerError};
use crate::http::Response;
use crate::middleware::{
    BoxFuture, CleanupRegistry, LifecycleHook, Middleware, Next, Outcome, Pipeline,
};

/// Acquires a client for the request in `ctx` and arranges for its release.
///
/// The client is bound on the request under the configured
/// `requestDecoratorName` and also returned, so the call site can use it
/// directly. Calling this more than once per request acquires one more
/// client each time; all of them are released.
///
/// # Errors
///
/// The pool's checkout error, unchanged.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_db::context::Context;
/// use rttp_db::database::Database;
/// use rttp_db::error::HandlerError;
/// use rttp_db::http::{Response, StatusCode};
/// use rttp_db::middleware::Outcome;
/// use rttp_db::request::require_client;
///
/// async fn count_users(ctx: Context) -> Outcome {
///     let db = ctx
///         .decoration::<Database>("database")
///         .ok_or_else(|| HandlerError::status(StatusCode::InternalServerError, "no database"))?;
///     let client = require_client(&ctx, &db).await?;
///     let result = client.query("SELECT count(*) AS n FROM users", None).await?;
///     Ok(Response::new(StatusCode::Ok).json(&result.rows))
/// }
/// ```
pub async fn require_client(ctx: &Context, database: &Database) -> Result<Client, DatabaseError> {
    let client = database.acquire_client().await?;
    ctx.scope()
        .bind(&database.config().request_decorator_name, client.clone());

    match ctx.extensions().get::<CleanupRegistry>() {
        Some(cleanup) => {
            let deferred = client.clone();
            cleanup.defer(move || async move { release_logged(&deferred).await });
            trace!(
                client = client.identity(),
                path = ctx.path(),
                "request client registered for cleanup"
            );
        }
        None => {
            ctx.scope().attach(client.clone());
            trace!(
                client = client.identity(),
                path = ctx.path(),
                attached = ctx.scope().attached(),
                "request client attached"
            );
        }
    }
    Ok(client)
}

async fn release_logged(client: &Client) {
    if let Err(err) = client.release().await {
        error!(
            client = client.identity(),
            error = %err,
            "failed to release request client"
        );
    }
}

/// Middleware that acquires a client before the handler runs.
///
/// Handlers read it back with [`Context::client`] under the configured
/// `requestDecoratorName`. If no client can be acquired the handler is not
/// run and the request fails with the pool's error.
pub struct RequireClient {
    database: Arc<Database>,
}

impl RequireClient {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

impl Middleware for RequireClient {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<Outcome> {
        let database = Arc::clone(&self.database);
        Box::pin(async move {
            require_client(&ctx, &database).await?;
            next.run(ctx).await
        })
    }
}

/// Completion hooks that release the clients attached to a request.
///
/// Success and failure release identically; only the trigger differs.
pub struct ClientHooks;

impl ClientHooks {
    async fn release_attached(scope: &RequestScope) {
        for client in scope.take_attached() {
            release_logged(&client).await;
        }
    }
}

#[async_trait]
impl LifecycleHook for ClientHooks {
    fn name(&self) -> &'static str {
        "database-clients"
    }

    async fn on_send(&self, scope: &RequestScope, _response: &Response) {
        Self::release_attached(scope).await;
    }

    async fn on_error(&self, scope: &RequestScope, _error: &HandlerError) {
        Self::release_attached(scope).await;
    }
}

/// Wires a [`Database`] into a [`Pipeline`].
pub struct DatabasePlugin;

impl DatabasePlugin {
    /// Verifies connectivity, exposes `database` under its `decoratorName`,
    /// and registers the [`ClientHooks`].
    ///
    /// # Errors
    ///
    /// [`DatabaseError::Startup`] when the probe fails. Nothing is installed
    /// in that case and the server must not start.
    pub async fn install(
        database: Arc<Database>,
        pipeline: &mut Pipeline,
    ) -> Result<(), DatabaseError> {
        database.probe().await?;

        let name = database.config().decorator_name.clone();
        pipeline.decorate(&name, database);
        pipeline.hook(Arc::new(ClientHooks));

        info!(decorator = %name, "database plugin installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tracing::Level;

    use super::*;
    use crate::config::DatabaseConfig;
    use crate::http::StatusCode;
    use crate::middleware::CleanupMiddleware;
    use crate::pool::ReleaseMode;
    use crate::testing::{MockPool, PoolEvent, capture_logs};

    fn database(pool: &MockPool) -> Arc<Database> {
        Arc::new(Database::new(
            DatabaseConfig::new("postgres://localhost/test"),
            Arc::new(pool.clone()),
        ))
    }

    fn installed_db(ctx: &Context) -> Result<Arc<Database>, HandlerError> {
        ctx.decoration::<Database>("database")
            .ok_or_else(|| HandlerError::status(StatusCode::InternalServerError, "no database"))
    }

    fn query(conn: u64, text: &str) -> PoolEvent {
        PoolEvent::Query {
            conn,
            text: text.to_owned(),
            args: Vec::<Value>::new(),
        }
    }

    async fn abandon_transfer(ctx: Context) -> Outcome {
        let db = installed_db(&ctx)?;
        let client = require_client(&ctx, &db).await?;
        client.begin_transaction().await?;
        client.query("update accounts set balance = 0", None).await?;
        Err(HandlerError::status(StatusCode::Conflict, "insufficient funds"))
    }

    async fn two_clients(ctx: Context) -> Outcome {
        let db = installed_db(&ctx)?;
        let first = require_client(&ctx, &db).await?;
        let second = require_client(&ctx, &db).await?;
        first.query("select 1", None).await?;
        second.query("select 2", None).await?;

        // The request property holds the most recent acquisition.
        let bound = ctx.client("dbClient").map(|c| c.identity());
        Ok(Response::new(StatusCode::Ok).body(format!("{bound:?}")))
    }

    async fn read_bound_client(ctx: Context) -> Outcome {
        let client = ctx
            .client("dbClient")
            .ok_or_else(|| HandlerError::status(StatusCode::InternalServerError, "no client"))?;
        let result = client.query("select 1", None).await?;
        Ok(Response::new(StatusCode::Ok).json(&result.rows))
    }

    #[tokio::test]
    async fn failed_request_rolls_back_before_release() {
        let (logs, _guard) = capture_logs();
        let pool = MockPool::new();
        let mut pipeline = Pipeline::new(abandon_transfer);
        DatabasePlugin::install(database(&pool), &mut pipeline)
            .await
            .unwrap();

        let response = pipeline.dispatch(Context::new("POST", "/transfer")).await;

        assert_eq!(response.status(), StatusCode::Conflict);
        assert_eq!(
            pool.events(),
            vec![
                // startup probe
                PoolEvent::Checkout { conn: 1 },
                PoolEvent::Release { conn: 1, mode: ReleaseMode::Reuse },
                // the request
                PoolEvent::Checkout { conn: 1 },
                query(1, "BEGIN"),
                query(1, "update accounts set balance = 0"),
                query(1, "ROLLBACK"),
                PoolEvent::Release { conn: 1, mode: ReleaseMode::Reuse },
            ]
        );
        assert!(logs.contains(Level::WARN, "rolling back uncommitted transaction"));
    }

    #[tokio::test]
    async fn attached_clients_are_released_in_order() {
        let pool = MockPool::new();
        let mut pipeline = Pipeline::new(two_clients);
        DatabasePlugin::install(database(&pool), &mut pipeline)
            .await
            .unwrap();

        let response = pipeline.dispatch(Context::new("GET", "/report")).await;

        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.body_text(), "Some(2)");
        let released: Vec<u64> = pool
            .events()
            .into_iter()
            .skip(2)
            .filter_map(|event| match event {
                PoolEvent::Release { conn, .. } => Some(conn),
                _ => None,
            })
            .collect();
        assert_eq!(released, [1, 2]);
    }

    #[tokio::test]
    async fn cleanup_registry_is_preferred_over_attached_list() {
        let pool = MockPool::new();
        let db = database(&pool);
        let mut pipeline = Pipeline::new(abandon_transfer);
        DatabasePlugin::install(Arc::clone(&db), &mut pipeline)
            .await
            .unwrap();
        pipeline.layer(CleanupMiddleware);

        let response = pipeline.dispatch(Context::new("POST", "/transfer")).await;

        assert_eq!(response.status(), StatusCode::Conflict);
        assert_eq!(pool.count("ROLLBACK"), 1);
        assert_eq!(pool.releases(1).len(), 2);

        // The client is back with the pool and usable by the next request.
        let next = db.acquire_client().await.unwrap();
        assert_eq!(next.identity(), 1);
        next.release().await.unwrap();
    }

    #[tokio::test]
    async fn require_client_middleware_binds_for_the_handler() {
        let pool = MockPool::new();
        let db = database(&pool);
        let mut pipeline = Pipeline::new(read_bound_client);
        DatabasePlugin::install(Arc::clone(&db), &mut pipeline)
            .await
            .unwrap();
        pipeline.layer(RequireClient::new(db));

        let response = pipeline.dispatch(Context::new("GET", "/one")).await;

        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.body_text(), r#"[{"?column?":1}]"#);
        assert_eq!(pool.statements(1), ["select 1"]);
        assert_eq!(pool.releases(1).len(), 2);
    }

    #[tokio::test]
    async fn acquisition_failure_fails_the_request() {
        let pool = MockPool::new();
        let db = database(&pool);
        let mut pipeline = Pipeline::new(read_bound_client);
        DatabasePlugin::install(Arc::clone(&db), &mut pipeline)
            .await
            .unwrap();
        pipeline.layer(RequireClient::new(db));

        pool.fail_connect("too many connections for role \"app\"");
        let response = pipeline.dispatch(Context::new("GET", "/one")).await;

        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert!(pool.statements(1).is_empty());
    }

    #[tokio::test]
    async fn install_aborts_when_probe_fails() {
        let pool = MockPool::new();
        pool.fail_connect("connection refused");
        let mut pipeline = Pipeline::new(read_bound_client);

        let err = DatabasePlugin::install(database(&pool), &mut pipeline)
            .await
            .unwrap_err();

        assert!(matches!(err, DatabaseError::Startup(_)));
        assert!(pipeline.decoration::<Database>("database").is_none());
        assert_eq!(pipeline.hooks(), 0);
    }

    #[tokio::test]
    async fn install_exposes_database_under_configured_name() {
        let pool = MockPool::new();
        let db = Arc::new(Database::new(
            DatabaseConfig::new("postgres://localhost/test").with_decorator_name("primary"),
            Arc::new(pool.clone()),
        ));
        let mut pipeline = Pipeline::new(read_bound_client);

        DatabasePlugin::install(Arc::clone(&db), &mut pipeline)
            .await
            .unwrap();
        DatabasePlugin::install(Arc::clone(&db), &mut pipeline)
            .await
            .unwrap();

        let exposed = pipeline.decoration::<Database>("primary").unwrap();
        assert!(Arc::ptr_eq(&exposed, &db));
        assert_eq!(pipeline.hooks(), 1);
    }
}
