//! Driver seam — the connection pool this crate manages clients on top of.
//!
//! The pool itself (connection establishment, checkout queueing, sizing,
//! network I/O) is provided by an implementation of [`Pool`]. This crate only
//! needs the handful of operations below; everything else about a client's
//! lifecycle is layered on in [`client`](crate::client).
//!
//! Implementations:
//!
//! - `postgres` (feature `postgres`): sqlx `PgPool`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::DatabaseError;

#[cfg(feature = "postgres")]
pub mod postgres;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Result of a successfully executed statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    /// Rows affected (for DML) or returned (for queries).
    pub row_count: u64,
    pub rows: Vec<Row>,
}

/// How a connection goes back to its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// The connection is healthy and may be handed out again.
    Reuse,
    /// The connection is in an unknown state and must be closed.
    Discard,
}

/// A physical connection checked out from a [`Pool`].
///
/// The pool may hand back the same physical connection object on later
/// checkouts; [`key`](Self::key) must identify it stably for its whole
/// lifetime so wrapped clients can be cached against it.
#[async_trait]
pub trait PoolConnection: Send + Sync + 'static {
    /// Stable identifier of the underlying physical connection.
    ///
    /// Never reused for a different physical connection of the same pool,
    /// even after the original has been closed.
    fn key(&self) -> u64;

    /// Executes `text` with positional (`$n`) arguments.
    async fn query(&self, text: &str, args: &[Value]) -> Result<QueryResult, DatabaseError>;

    /// Returns the connection to the pool.
    async fn release(&self, mode: ReleaseMode) -> Result<(), DatabaseError>;
}

/// A pool of physical database connections.
#[async_trait]
pub trait Pool: Send + Sync + 'static {
    /// Checks out a connection, waiting up to the pool's configured timeout.
    async fn connect(&self) -> Result<Arc<dyn PoolConnection>, DatabaseError>;

    /// Executes `text` on whichever connection the pool picks, without a dedicated checkout.
    async fn query(&self, text: &str, args: &[Value]) -> Result<QueryResult, DatabaseError>;

    /// Closes every connection and refuses further checkouts.
    async fn close(&self);
}
