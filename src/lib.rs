//! # rttp-db
//!
//! Request-scoped pooled database clients for rttp: one client checked out
//! per request, a leak timer that force-releases clients held too long, a
//! transaction state machine that never leaves a transaction open, and
//! request-completion hooks that guarantee release on every exit path.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rttp_db::context::Context;
//! use rttp_db::http::{Response, StatusCode};
//! use rttp_db::middleware::{LoggerMiddleware, Outcome, Pipeline};
//! use rttp_db::request::{DatabasePlugin, RequireClient};
//! use rttp_db::{Database, DatabaseConfig, HandlerError};
//! use serde_json::json;
//!
//! async fn rename_user(ctx: Context) -> Outcome {
//!     let client = ctx
//!         .client("dbClient")
//!         .ok_or_else(|| HandlerError::status(StatusCode::InternalServerError, "no client"))?;
//!
//!     client.begin_transaction().await?;
//!     client
//!         .query(
//!             "UPDATE users SET name = :name WHERE id = :id",
//!             json!({ "id": 7, "name": "Ada" }).as_object(),
//!         )
//!         .await?;
//!     client.commit_transaction().await?;
//!
//!     Ok(Response::new(StatusCode::NoContent))
//! }
//!
//! # #[cfg(feature = "postgres")]
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DatabaseConfig::from_env()?;
//!     let database = Arc::new(Database::connect(config).await?);
//!
//!     let mut pipeline = Pipeline::new(rename_user);
//!     DatabasePlugin::install(Arc::clone(&database), &mut pipeline).await?;
//!     pipeline.layer(LoggerMiddleware).layer(RequireClient::new(database));
//!
//!     let response = pipeline.dispatch(Context::new("PUT", "/users/7")).await;
//!     println!("{}", response.status());
//!     Ok(())
//! }
//! # #[cfg(not(feature = "postgres"))]
//! # fn main() {}
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod http;
pub mod leak;
pub mod middleware;
pub mod named;
pub mod pool;
pub mod request;

#[cfg(test)]
mod testing;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use client::{Client, LastQuery};
pub use config::DatabaseConfig;
pub use database::Database;
pub use error::{ConfigError, DatabaseError, HandlerError};
pub use http::{Response, StatusCode};
pub use leak::{LeakReport, LeakReporter};
pub use middleware::{Middleware, Next, Pipeline};
pub use pool::{Pool, PoolConnection, QueryResult, ReleaseMode};
pub use request::{DatabasePlugin, RequireClient, require_client};
