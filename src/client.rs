//! Pooled client wrapper — one checked-out connection plus its request-scoped state.
//!
//! A [`Client`] augments a raw [`PoolConnection`] with:
//!
//! - named-parameter queries (see [`named`](crate::named)),
//! - query logging and the `last_query` / `query_running` diagnostics,
//! - a transaction state machine (`BEGIN` / `COMMIT` / implicit `ROLLBACK`),
//! - a leak timer that force-releases the client if it is held too long.
//!
//! The wrapper for a physical connection is built once and cached by the
//! [`Database`](crate::database::Database) against the connection's key, so
//! repeated checkouts of the same connection share one wrapper and one
//! identity. Every checkout bumps a generation number; a `Client` handle from
//! an earlier checkout is rejected with [`DatabaseError::Released`].
//!
//! # Ordering invariant
//!
//! `in_transaction` is cleared *before* `COMMIT` or `ROLLBACK` is dispatched.
//! A forced release racing an in-flight commit therefore observes "no open
//! transaction" and never issues a second, conflicting `ROLLBACK`.
//!
//! # Releasing
//!
//! [`Client::release`] may be called any number of times and may race the
//! leak timer. Whichever of the two claims the checkout first performs the
//! release; the other is a no-op (logged when it comes from the holder).
//!
//! A forced release that finds a statement still in flight does not queue a
//! `ROLLBACK` behind it. The connection is discarded instead, so the server
//! aborts the transaction when the connection closes and the pool never sees
//! it again.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{error, trace, warn};

use crate::database::ClientRegistry;
use crate::error::DatabaseError;
use crate::leak::{LeakReport, LeakReporter, log_leak};
use crate::named::{self, Params};
use crate::pool::{PoolConnection, QueryResult, ReleaseMode};

/// The most recent statement issued on a client, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastQuery {
    /// Statement text with whitespace runs collapsed.
    pub text: String,
    pub params: Option<Params>,
}

#[derive(Default)]
struct ClientState {
    // Bumped on every checkout; a handle is current only while this matches.
    generation: u64,
    // The pool's handle for the current checkout. Pools may hand out a fresh
    // handle object for the same physical connection on every checkout.
    connection: Option<Arc<dyn PoolConnection>>,
    checked_out: bool,
    checked_out_at: Option<Instant>,
    last_query: Option<LastQuery>,
    query_running: bool,
    in_transaction: bool,
    leak_timer: Option<AbortHandle>,
}

/// Wrapper state shared by every checkout of one physical connection.
pub(crate) struct ClientInner {
    identity: u64,
    key: u64,
    wrapped_at: Instant,
    state: Mutex<ClientState>,
    registry: Weak<ClientRegistry>,
}

impl ClientInner {
    pub(crate) fn new(identity: u64, key: u64, registry: Weak<ClientRegistry>) -> Self {
        Self {
            identity,
            key,
            wrapped_at: Instant::now(),
            state: Mutex::new(ClientState::default()),
            registry,
        }
    }

    pub(crate) fn identity(&self) -> u64 {
        self.identity
    }

    /// `true` once the connection must have been retired by a pool that
    /// closes connections older than `max_lifetime`. The wrapper postdates
    /// the connection, so its age is a lower bound on the connection's.
    pub(crate) fn outlived(&self, max_lifetime: Duration) -> bool {
        !self.state.lock().checked_out && self.wrapped_at.elapsed() > max_lifetime
    }
}

/// A wrapped client checked out for one logical request flow.
///
/// Cloning is cheap; clones refer to the same checkout.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    generation: u64,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("identity", &self.inner.identity)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

// Clears `query_running` when dropped, including when the query future is cancelled.
struct RunningGuard<'a> {
    client: &'a Client,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.client.inner.state.lock();
        if state.generation == self.client.generation {
            state.query_running = false;
        }
    }
}

impl Client {
    /// Starts a new checkout of `connection` on its cached wrapper `inner`.
    ///
    /// State left behind by a checkout that never went through
    /// [`release`](Self::release) is reported and cleared; it never blocks
    /// the new checkout.
    pub(crate) fn check_out(
        inner: &Arc<ClientInner>,
        connection: Arc<dyn PoolConnection>,
    ) -> Self {
        let mut state = inner.state.lock();

        if let Some(stale) = state.leak_timer.take() {
            error!(
                client = inner.identity,
                "stale leak timer armed on a freshly acquired client; previous checkout was never released"
            );
            stale.abort();
        }
        if state.query_running {
            error!(
                client = inner.identity,
                last_query = state.last_query.as_ref().map_or("<none>", |q| q.text.as_str()),
                "query still marked running on a freshly acquired client"
            );
            state.query_running = false;
        }
        if state.in_transaction {
            error!(
                client = inner.identity,
                "transaction still marked open on a freshly acquired client"
            );
            state.in_transaction = false;
        }

        state.generation += 1;
        state.connection = Some(connection);
        state.checked_out = true;
        state.checked_out_at = Some(Instant::now());

        Self {
            inner: Arc::clone(inner),
            generation: state.generation,
        }
    }

    /// Arms the leak timer, replacing (and cancelling) any timer already armed.
    pub(crate) fn arm_leak_timer(
        &self,
        timeout: Duration,
        reporter: Option<Arc<dyn LeakReporter>>,
    ) {
        let client = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            client.expire(timeout, reporter).await;
        })
        .abort_handle();

        let mut state = self.inner.state.lock();
        if self.is_current(&state) {
            if let Some(previous) = state.leak_timer.replace(handle) {
                previous.abort();
            }
        } else {
            handle.abort();
        }
    }

    /// Process-unique identity of the underlying physical connection.
    pub fn identity(&self) -> u64 {
        self.inner.identity
    }

    /// `true` between a successful `BEGIN` and the terminal `COMMIT`/`ROLLBACK`.
    pub fn in_transaction(&self) -> bool {
        self.inner.state.lock().in_transaction
    }

    /// `true` while a statement dispatched through this client is in flight.
    pub fn query_running(&self) -> bool {
        self.inner.state.lock().query_running
    }

    /// The last statement issued on this connection.
    pub fn last_query(&self) -> Option<LastQuery> {
        self.inner.state.lock().last_query.clone()
    }

    /// `true` once this checkout has been released, by its holder or by the leak timer.
    pub fn is_released(&self) -> bool {
        !self.is_current(&self.inner.state.lock())
    }

    /// `true` while a leak timer is armed for this connection.
    pub fn leak_timer_armed(&self) -> bool {
        self.inner.state.lock().leak_timer.is_some()
    }

    /// Returns `true` if both handles wrap the same physical connection.
    pub fn same_connection(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn is_current(&self, state: &ClientState) -> bool {
        state.generation == self.generation && state.checked_out
    }

    fn ensure_current(&self) -> Result<(), DatabaseError> {
        if self.is_current(&self.inner.state.lock()) {
            Ok(())
        } else {
            Err(DatabaseError::Released {
                identity: self.inner.identity,
            })
        }
    }

    /// Executes `text`, rewriting `:name` placeholders from `params`.
    ///
    /// The statement is recorded as [`last_query`](Self::last_query) before
    /// dispatch. Failures are logged in full and returned unchanged.
    ///
    /// # Errors
    ///
    /// - [`DatabaseError::Released`] if this checkout was already released.
    /// - [`DatabaseError::MissingParameter`] if `text` names a parameter absent from `params`.
    /// - Any error the driver returns, exactly as returned.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # async fn example(client: rttp_db::Client) -> Result<(), rttp_db::DatabaseError> {
    /// use serde_json::json;
    ///
    /// let result = client
    ///     .query("SELECT name FROM users WHERE id = :id", json!({ "id": 42 }).as_object())
    ///     .await?;
    /// println!("{} row(s)", result.row_count);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query(
        &self,
        text: &str,
        params: Option<&Params>,
    ) -> Result<QueryResult, DatabaseError> {
        self.ensure_current()?;
        self.dispatch(text, params).await
    }

    async fn dispatch(
        &self,
        text: &str,
        params: Option<&Params>,
    ) -> Result<QueryResult, DatabaseError> {
        let logged = named::normalize_whitespace(text);
        let connection = {
            let mut state = self.inner.state.lock();
            let Some(connection) = state.connection.clone() else {
                return Err(DatabaseError::Released {
                    identity: self.inner.identity,
                });
            };
            state.last_query = Some(LastQuery {
                text: logged.clone(),
                params: params.cloned(),
            });
            state.query_running = true;
            connection
        };
        let _running = RunningGuard { client: self };

        let start = Instant::now();
        let result = match named::rewrite(text, params) {
            Ok(positional) => connection.query(&positional.text, &positional.args).await,
            Err(err) => Err(err),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(rows) => trace!(
                client = self.inner.identity,
                elapsed_ms,
                rows = rows.row_count,
                query = %logged,
                "query completed"
            ),
            Err(err) => error!(
                client = self.inner.identity,
                elapsed_ms,
                query = %logged,
                params = ?params,
                error = %err,
                detail = ?err,
                "query failed"
            ),
        }
        result
    }

    /// Issues `BEGIN` and marks the client as in a transaction.
    ///
    /// Returns `Ok(false)` without issuing anything if a transaction is
    /// already open; the misuse is logged at error level.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::Released`] for a released checkout, or the driver's
    /// error if `BEGIN` fails (the client then stays outside a transaction).
    pub async fn begin_transaction(&self) -> Result<bool, DatabaseError> {
        {
            let state = self.inner.state.lock();
            if !self.is_current(&state) {
                return Err(DatabaseError::Released {
                    identity: self.inner.identity,
                });
            }
            if state.in_transaction {
                error!(
                    client = self.inner.identity,
                    "begin_transaction called while a transaction is already open; ignoring"
                );
                return Ok(false);
            }
        }

        self.dispatch("BEGIN", None).await?;

        let mut state = self.inner.state.lock();
        if self.is_current(&state) {
            state.in_transaction = true;
        }
        Ok(true)
    }

    /// Issues `COMMIT` for the open transaction.
    ///
    /// Returns `Ok(false)` without issuing anything if no transaction is
    /// open; the misuse is logged at error level.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::Released`] for a released checkout, or the driver's
    /// error if `COMMIT` fails.
    pub async fn commit_transaction(&self) -> Result<bool, DatabaseError> {
        {
            let mut state = self.inner.state.lock();
            if !self.is_current(&state) {
                return Err(DatabaseError::Released {
                    identity: self.inner.identity,
                });
            }
            if !state.in_transaction {
                error!(
                    client = self.inner.identity,
                    "commit_transaction called outside a transaction; ignoring"
                );
                return Ok(false);
            }
            state.in_transaction = false;
        }

        self.dispatch("COMMIT", None).await?;
        Ok(true)
    }

    /// Rolls back the open transaction, if any. Returns whether `ROLLBACK` was issued.
    ///
    /// [`release`](Self::release) calls this automatically.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::Released`] for a released checkout, or the driver's
    /// error if `ROLLBACK` fails.
    pub async fn rollback_if_not_committed(&self) -> Result<bool, DatabaseError> {
        self.ensure_current()?;
        self.rollback_open_transaction().await
    }

    async fn rollback_open_transaction(&self) -> Result<bool, DatabaseError> {
        {
            let mut state = self.inner.state.lock();
            if !state.in_transaction {
                return Ok(false);
            }
            state.in_transaction = false;
        }

        warn!(
            client = self.inner.identity,
            "rolling back uncommitted transaction"
        );
        self.dispatch("ROLLBACK", None).await?;
        Ok(true)
    }

    /// Returns the connection to the pool.
    ///
    /// In order: rolls back an uncommitted transaction, clears the running
    /// flag, cancels the leak timer, and hands the connection back. If the
    /// rollback fails the connection is discarded instead of reused and the
    /// rollback error is returned once the connection is back with the pool.
    ///
    /// Calling this on a checkout that was already released (by an earlier
    /// call or by the leak timer) logs the anomaly and does nothing else.
    ///
    /// # Errors
    ///
    /// The rollback's error, otherwise the pool's release error.
    pub async fn release(&self) -> Result<(), DatabaseError> {
        {
            let mut state = self.inner.state.lock();
            if !self.is_current(&state) {
                error!(
                    client = self.inner.identity,
                    "release called on a client that is not checked out; ignoring"
                );
                return Ok(());
            }
            state.checked_out = false;
        }
        self.finish_release().await
    }

    // Runs once per checkout, after the caller has claimed the checkout.
    async fn finish_release(&self) -> Result<(), DatabaseError> {
        let rollback = self.rollback_open_transaction().await;
        let mode = if rollback.is_err() {
            ReleaseMode::Discard
        } else {
            ReleaseMode::Reuse
        };
        let released = self.hand_back(mode).await;

        rollback?;
        released
    }

    // Forced release while a statement is still in flight. The statement owns
    // the connection, so an in-band ROLLBACK would queue behind it; the
    // connection is closed instead and the server aborts any open transaction.
    async fn abandon(&self) -> Result<(), DatabaseError> {
        let open_transaction = std::mem::take(&mut self.inner.state.lock().in_transaction);
        warn!(
            client = self.inner.identity,
            open_transaction,
            "statement still in flight; discarding connection"
        );
        self.hand_back(ReleaseMode::Discard).await
    }

    async fn hand_back(&self, mode: ReleaseMode) -> Result<(), DatabaseError> {
        let (connection, held) = {
            let mut state = self.inner.state.lock();
            state.query_running = false;
            if let Some(timer) = state.leak_timer.take() {
                timer.abort();
            }
            (
                state.connection.take(),
                state.checked_out_at.take().map(|at| at.elapsed()),
            )
        };

        let released = match connection {
            Some(connection) => connection.release(mode).await,
            None => Ok(()),
        };
        if mode == ReleaseMode::Discard || released.is_err() {
            if let Some(registry) = self.inner.registry.upgrade() {
                registry.evict(self.inner.key);
            }
        }

        trace!(
            client = self.inner.identity,
            held_ms = held.map_or(0, |d| d.as_millis() as u64),
            mode = ?mode,
            "released database client"
        );
        if let Err(err) = &released {
            error!(
                client = self.inner.identity,
                error = %err,
                "failed to return connection to the pool"
            );
        }
        released
    }

    // Leak timer body. Runs inside the timer task itself, so the stored
    // handle is dropped rather than aborted.
    async fn expire(self, timeout: Duration, reporter: Option<Arc<dyn LeakReporter>>) {
        let (last_query, query_running) = {
            let mut state = self.inner.state.lock();
            if !self.is_current(&state) {
                return;
            }
            state.checked_out = false;
            state.leak_timer = None;
            (state.last_query.clone(), state.query_running)
        };

        let released = if query_running {
            self.abandon().await
        } else {
            self.finish_release().await
        };

        let report = LeakReport {
            identity: self.inner.identity,
            leak_timeout: timeout,
            last_query,
            query_running,
            release_error: released.err().map(|e| e.to_string()),
        };
        log_leak(&report);
        if let Some(reporter) = reporter {
            reporter.report(&report);
        }
    }
}
