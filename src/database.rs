//! Lifecycle manager — owns the pool and mints wrapped clients.
//!
//! A [`Database`] is constructed once per pool and passed explicitly (usually
//! as `Arc<Database>`) to whatever needs it: the request middleware, handlers,
//! background jobs. Tests build as many independent instances as they like.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{error, info, trace};

use crate::client::{Client, ClientInner};
use crate::config::DatabaseConfig;
use crate::error::DatabaseError;
use crate::leak::LeakReporter;
use crate::named::{self, Params};
use crate::pool::{Pool, PoolConnection, QueryResult, ReleaseMode};

/// Wrapped clients cached against the key of their physical connection.
///
/// Pools close connections behind our back (idle reaping, lifetime limits), so
/// wrappers idle for longer than the pool's maximum connection lifetime are
/// dropped on the next checkout.
pub(crate) struct ClientRegistry {
    clients: Mutex<HashMap<u64, Arc<ClientInner>>>,
    next_identity: AtomicU64,
    max_lifetime: Duration,
}

impl ClientRegistry {
    fn new(max_lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_identity: AtomicU64::new(1),
            max_lifetime,
        })
    }

    /// Returns the wrapper for `connection`, building it on first sight.
    ///
    /// Idempotent: wrapping the same physical connection again returns the
    /// existing wrapper and identity.
    pub(crate) fn wrap(self: &Arc<Self>, connection: &Arc<dyn PoolConnection>) -> Arc<ClientInner> {
        let key = connection.key();
        let mut clients = self.clients.lock();

        let before = clients.len();
        clients.retain(|_, inner| !inner.outlived(self.max_lifetime));
        if clients.len() < before {
            trace!(
                pruned = before - clients.len(),
                "dropped wrappers of retired connections"
            );
        }

        if let Some(existing) = clients.get(&key) {
            return Arc::clone(existing);
        }

        let identity = self.next_identity.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(ClientInner::new(identity, key, Arc::downgrade(self)));
        clients.insert(key, Arc::clone(&inner));
        trace!(client = identity, connection = key, "wrapped physical connection");
        inner
    }

    /// Forgets the wrapper of a connection the pool will not hand out again.
    pub(crate) fn evict(&self, key: u64) {
        if let Some(inner) = self.clients.lock().remove(&key) {
            trace!(client = inner.identity(), connection = key, "evicted wrapper");
        }
    }

    fn clear(&self) {
        self.clients.lock().clear();
    }

    fn len(&self) -> usize {
        self.clients.lock().len()
    }
}

/// The database handle: a pool plus the lifecycle of every client checked out from it.
///
/// # Examples
///
/// ```rust,no_run
/// # #[cfg(feature = "postgres")]
/// # async fn example() -> Result<(), rttp_db::DatabaseError> {
/// use rttp_db::{Database, DatabaseConfig};
///
/// let db = Database::connect(DatabaseConfig::new("postgres://app@localhost/app")).await?;
///
/// let client = db.acquire_client().await?;
/// client.begin_transaction().await?;
/// client.query("UPDATE jobs SET state = 'done' WHERE id = 1", None).await?;
/// client.commit_transaction().await?;
/// client.release().await?;
/// # Ok(())
/// # }
/// ```
pub struct Database {
    config: DatabaseConfig,
    pool: Arc<dyn Pool>,
    registry: Arc<ClientRegistry>,
    reporter: Option<Arc<dyn LeakReporter>>,
}

impl Database {
    /// Creates a database handle over an existing pool.
    ///
    /// No connection is made; call [`probe`](Self::probe) before serving traffic.
    pub fn new(config: DatabaseConfig, pool: Arc<dyn Pool>) -> Self {
        let registry = ClientRegistry::new(config.max_lifetime());
        Self {
            config,
            pool,
            registry,
            reporter: None,
        }
    }

    /// Opens a PostgreSQL pool from `config` and verifies connectivity.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::Config`] for an invalid configuration and
    /// [`DatabaseError::Startup`] when no connection can be made.
    #[cfg(feature = "postgres")]
    pub async fn connect(config: DatabaseConfig) -> Result<Self, DatabaseError> {
        config.validate()?;
        let pool = crate::pool::postgres::PgBackend::new(&config)?;
        let database = Self::new(config, Arc::new(pool));
        database.probe().await?;
        Ok(database)
    }

    /// Routes leak reports to `reporter` in addition to the log.
    #[must_use]
    pub fn with_leak_reporter(mut self, reporter: Arc<dyn LeakReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Number of physical connections with a cached wrapper.
    pub fn wrapped_connections(&self) -> usize {
        self.registry.len()
    }

    /// Acquires one connection and immediately releases it.
    ///
    /// Run at startup; a failure here means the server must not start.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::Startup`] wrapping the pool's error.
    pub async fn probe(&self) -> Result<(), DatabaseError> {
        let start = Instant::now();
        let url = self.config.masked_url();

        let connection = self.pool.connect().await.map_err(|err| {
            error!(url = %url, error = %err, "database startup probe failed");
            DatabaseError::Startup(Box::new(err))
        })?;
        connection
            .release(ReleaseMode::Reuse)
            .await
            .map_err(|err| DatabaseError::Startup(Box::new(err)))?;

        info!(
            url = %url,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "database connection verified"
        );
        Ok(())
    }

    /// Checks out a connection and returns it as a wrapped, leak-timed [`Client`].
    ///
    /// The caller owns the checkout until [`Client::release`]; if that does
    /// not happen within the configured leak timeout the client is
    /// force-released and reported.
    ///
    /// # Errors
    ///
    /// Whatever the pool returns when it cannot produce a connection,
    /// unchanged. There is no retry.
    pub async fn acquire_client(&self) -> Result<Client, DatabaseError> {
        let start = Instant::now();
        let connection = self.pool.connect().await?;

        let inner = self.registry.wrap(&connection);
        let client = Client::check_out(&inner, connection);
        client.arm_leak_timer(self.config.leak_timeout(), self.reporter.clone());

        trace!(
            client = client.identity(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "acquired database client"
        );
        Ok(client)
    }

    /// Runs one statement on whichever pooled connection the pool picks.
    ///
    /// Named placeholders are rewritten exactly as for [`Client::query`].
    /// Transactions cannot span pool-level calls; use a [`Client`] for those.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::MissingParameter`] or the driver's error, unchanged.
    pub async fn query(
        &self,
        text: &str,
        params: Option<&Params>,
    ) -> Result<QueryResult, DatabaseError> {
        let logged = named::normalize_whitespace(text);
        let positional = named::rewrite(text, params)?;

        let start = Instant::now();
        let result = self.pool.query(&positional.text, &positional.args).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(rows) => trace!(
                elapsed_ms,
                rows = rows.row_count,
                query = %logged,
                "pool query completed"
            ),
            Err(err) => error!(
                elapsed_ms,
                query = %logged,
                error = %err,
                detail = ?err,
                "pool query failed"
            ),
        }
        result
    }

    /// Closes the pool and drops every cached wrapper.
    pub async fn close(&self) {
        self.pool.close().await;
        self.registry.clear();
        info!(url = %self.config.masked_url(), "database pool closed");
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }
}
