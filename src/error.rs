//! Error types for the database layer and for request handlers.

use std::time::Duration;

use thiserror::Error;

use crate::http::{Response, StatusCode};

/// Boxed driver-level error carried as the `source` of a [`DatabaseError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the pool, the wrapped clients, and the lifecycle manager.
///
/// Errors coming from the pool or the driver are surfaced to callers exactly as
/// the driver produced them; nothing in this crate wraps, retries, or
/// suppresses them.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("database connection failed: {0}")]
    Connection(#[source] BoxError),

    #[error("query failed: {message}")]
    Query {
        message: String,
        /// Server-reported error code (SQLSTATE for PostgreSQL), if any.
        code: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    #[error("cannot decode column `{column}` of type {type_name}")]
    Decode {
        column: String,
        type_name: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("no value supplied for named parameter `{name}`")]
    MissingParameter { name: String },

    #[error("database client {identity} has already been released")]
    Released { identity: u64 },

    #[error("database startup probe failed: {0}")]
    Startup(#[source] Box<DatabaseError>),

    #[error("invalid database configuration: {0}")]
    Config(#[from] ConfigError),
}

impl DatabaseError {
    /// Returns the server-reported error code, if this is a query failure that carried one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Errors raised while loading or validating [`DatabaseConfig`](crate::config::DatabaseConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option `{option}`")]
    Missing { option: &'static str },

    #[error("option `{option}` is invalid: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Error returned by request handlers and middleware.
///
/// The pipeline turns this into an error response after the on-error hooks
/// have run.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("{message}")]
    Status { status: StatusCode, message: String },
}

impl HandlerError {
    /// Creates a handler error that maps to the given status code.
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Returns the status code the error response will carry.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Database(DatabaseError::PoolExhausted { .. } | DatabaseError::PoolClosed) => {
                StatusCode::ServiceUnavailable
            }
            Self::Database(_) => StatusCode::InternalServerError,
            Self::Status { status, .. } => *status,
        }
    }

    /// Converts the error into the response sent to the client.
    ///
    /// Database error details stay in the logs; the client only sees the
    /// canonical reason phrase.
    pub fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            Self::Database(_) => Response::new(status).body(status.canonical_reason()),
            Self::Status { message, .. } => Response::new(status).body(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_error_exposes_code() {
        let err = DatabaseError::Query {
            message: "relation \"users\" does not exist".into(),
            code: Some("42P01".into()),
            source: None,
        };
        assert_eq!(err.code(), Some("42P01"));
        assert_eq!(
            err.to_string(),
            "query failed: relation \"users\" does not exist"
        );
    }

    #[test]
    fn pool_exhaustion_maps_to_service_unavailable() {
        let err = HandlerError::from(DatabaseError::PoolExhausted {
            waited: Duration::from_millis(5000),
        });
        assert_eq!(err.status_code(), StatusCode::ServiceUnavailable);
    }

    #[test]
    fn database_details_are_not_sent_to_clients() {
        let err = HandlerError::from(DatabaseError::Query {
            message: "syntax error at or near \"selec\"".into(),
            code: Some("42601".into()),
            source: None,
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(response.body_text(), "Internal Server Error");
    }

    #[test]
    fn startup_error_keeps_cause() {
        let err = DatabaseError::Startup(Box::new(DatabaseError::PoolClosed));
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("connection pool is closed"));
    }
}
