//! PostgreSQL pool backed by sqlx.
//!
//! Parameters are bound from JSON values: `null`, booleans, integers, floats
//! and strings map to `NULL`, `BOOL`, `INT8`, `FLOAT8` and `TEXT`; integers
//! beyond `i64` go out as `NUMERIC`, and arrays and objects as `JSONB`. A
//! string compared against a column of another type needs an explicit cast in
//! the query text (`WHERE id = :id::uuid`).
//!
//! Result columns decode to JSON by their PostgreSQL type. `NUMERIC` comes
//! back as a string to keep its precision, timestamps as RFC 3339 strings and
//! `BYTEA` as `\x`-prefixed hex. A column of any other type fails the query
//! with [`DatabaseError::Decode`] rather than reading as `null`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::Value;
use sqlx::error::DatabaseError as _;
use sqlx::pool::PoolConnection as SqlxConnection;
use sqlx::postgres::{PgArguments, PgColumn, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::{Decimal, Uuid};
use sqlx::{Column, Decode, Either, Executor, Postgres, Row as _, Type, TypeInfo};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Pool, PoolConnection, QueryResult, ReleaseMode, Row};
use crate::config::DatabaseConfig;
use crate::error::{BoxError, DatabaseError};

// Session setting holding the key assigned when sqlx opened the connection.
// Backend pids are recycled by the server, so they cannot key wrappers.
const CONNECTION_KEY_SETTING: &str = "rttp.connection_key";

/// A sqlx `PgPool` exposed through the [`Pool`] seam.
pub struct PgBackend {
    pool: PgPool,
    acquire_timeout: Duration,
}

impl PgBackend {
    /// Builds a lazily-connecting pool from `config`.
    ///
    /// No connection is opened until the first checkout; run
    /// [`Database::probe`](crate::database::Database::probe) to verify the
    /// server is reachable. Every physical connection the pool opens is
    /// tagged with a key unique within this pool.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::Connection`] if the connection URL cannot be parsed.
    pub fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let next_key = Arc::new(AtomicU64::new(1));
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .max_lifetime(Some(config.max_lifetime()))
            .test_before_acquire(config.keep_alive)
            .after_connect(move |conn, _meta| {
                let key = next_key.fetch_add(1, Ordering::Relaxed);
                Box::pin(async move {
                    sqlx::query("SELECT set_config($1, $2, false)")
                        .bind(CONNECTION_KEY_SETTING)
                        .bind(key.to_string())
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_lazy(&config.connection_url)
            .map_err(|err| DatabaseError::Connection(Box::new(err)))?;

        debug!(
            url = %config.masked_url(),
            max_connections = config.max_connections,
            keep_alive = config.keep_alive,
            "created postgres pool"
        );
        Ok(Self::from_pool(pool, config.connection_timeout()))
    }

    /// Wraps an existing pool. `acquire_timeout` is only used for error reporting.
    ///
    /// The pool must tag its connections the way [`new`](Self::new) does;
    /// checkouts of untagged connections fail.
    pub fn from_pool(pool: PgPool, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            acquire_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn checkout_error(&self, err: sqlx::Error) -> DatabaseError {
        match err {
            sqlx::Error::PoolTimedOut => DatabaseError::PoolExhausted {
                waited: self.acquire_timeout,
            },
            other => map_error(other),
        }
    }
}

#[async_trait]
impl Pool for PgBackend {
    async fn connect(&self) -> Result<Arc<dyn PoolConnection>, DatabaseError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| self.checkout_error(err))?;

        let tag: Option<String> = sqlx::query_scalar("SELECT current_setting($1, true)")
            .bind(CONNECTION_KEY_SETTING)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_error)?;

        Ok(Arc::new(PgConnection {
            key: parse_key(tag.as_deref())?,
            conn: Arc::new(Mutex::new(Some(conn))),
        }))
    }

    async fn query(&self, text: &str, args: &[Value]) -> Result<QueryResult, DatabaseError> {
        execute(&self.pool, text, args).await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_key(tag: Option<&str>) -> Result<u64, DatabaseError> {
    let tag = tag.filter(|t| !t.is_empty()).ok_or_else(|| {
        DatabaseError::Connection(
            format!("connection carries no `{CONNECTION_KEY_SETTING}` setting").into(),
        )
    })?;
    tag.parse()
        .map_err(|err| DatabaseError::Connection(Box::new(err)))
}

/// One checkout of a physical connection.
pub struct PgConnection {
    key: u64,
    conn: Arc<Mutex<Option<SqlxConnection<Postgres>>>>,
}

#[async_trait]
impl PoolConnection for PgConnection {
    fn key(&self) -> u64 {
        self.key
    }

    async fn query(&self, text: &str, args: &[Value]) -> Result<QueryResult, DatabaseError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| {
            DatabaseError::Connection(
                format!("connection {} was already returned to the pool", self.key).into(),
            )
        })?;
        execute(&mut **conn, text, args).await
    }

    async fn release(&self, mode: ReleaseMode) -> Result<(), DatabaseError> {
        // A statement still in flight holds the lock; hand the connection
        // back once it completes instead of waiting for it here.
        match self.conn.try_lock() {
            Ok(mut guard) => {
                let conn = guard.take();
                drop(guard);
                give_back(conn, mode).await
            }
            Err(_) => {
                debug!(
                    connection = self.key,
                    mode = ?mode,
                    "statement in flight; deferring return to the pool"
                );
                let slot = Arc::clone(&self.conn);
                let key = self.key;
                tokio::spawn(async move {
                    let conn = slot.lock().await.take();
                    if let Err(err) = give_back(conn, mode).await {
                        warn!(connection = key, error = %err, "deferred release failed");
                    }
                });
                Ok(())
            }
        }
    }
}

async fn give_back(
    conn: Option<SqlxConnection<Postgres>>,
    mode: ReleaseMode,
) -> Result<(), DatabaseError> {
    match (conn, mode) {
        (None, _) => Ok(()),
        // Dropping a checkout returns it to the pool.
        (Some(conn), ReleaseMode::Reuse) => {
            drop(conn);
            Ok(())
        }
        (Some(conn), ReleaseMode::Discard) => conn.close().await.map_err(map_error),
    }
}

async fn execute<'c, E>(executor: E, text: &str, args: &[Value]) -> Result<QueryResult, DatabaseError>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = args.iter().map(param).fold(sqlx::query(text), bind);

    let mut result = QueryResult::default();
    let mut stream = executor.fetch_many(query);
    while let Some(step) = stream.try_next().await.map_err(map_error)? {
        match step {
            Either::Left(done) => result.row_count += done.rows_affected(),
            Either::Right(row) => result.rows.push(decode_row(&row)?),
        }
    }
    Ok(result)
}

/// A JSON argument resolved to the PostgreSQL type it is sent as.
#[derive(Debug, Clone, PartialEq)]
enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Numeric(Decimal),
    Float(f64),
    Text(String),
    Json(Value),
}

fn param(value: &Value) -> Param {
    match value {
        Value::Null => Param::Null,
        Value::Bool(b) => Param::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Param::Int(i)
            } else if let Some(u) = n.as_u64() {
                Param::Numeric(Decimal::from(u))
            } else {
                n.as_f64().map_or(Param::Null, Param::Float)
            }
        }
        Value::String(s) => Param::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => Param::Json(value.clone()),
    }
}

fn bind(query: Query<'_, Postgres, PgArguments>, param: Param) -> Query<'_, Postgres, PgArguments> {
    match param {
        Param::Null => query.bind(None::<i32>),
        Param::Bool(b) => query.bind(b),
        Param::Int(i) => query.bind(i),
        Param::Numeric(d) => query.bind(d),
        Param::Float(f) => query.bind(f),
        Param::Text(s) => query.bind(s),
        Param::Json(v) => query.bind(sqlx::types::Json(v)),
    }
}

/// How a result column is read, chosen from its PostgreSQL type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Void,
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Uuid,
    Timestamptz,
    Timestamp,
    Date,
    Time,
    Json,
    Bytea,
    TextArray,
    Int4Array,
    Int8Array,
    BoolArray,
    Float8Array,
    UuidArray,
}

impl ColumnKind {
    fn from_type_name(name: &str) -> Option<Self> {
        let kind = match name {
            "VOID" => Self::Void,
            "BOOL" => Self::Bool,
            "INT2" => Self::Int2,
            "INT4" => Self::Int4,
            "INT8" => Self::Int8,
            "FLOAT4" => Self::Float4,
            "FLOAT8" => Self::Float8,
            "NUMERIC" => Self::Numeric,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" | "UNKNOWN" => Self::Text,
            "UUID" => Self::Uuid,
            "TIMESTAMPTZ" => Self::Timestamptz,
            "TIMESTAMP" => Self::Timestamp,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "JSON" | "JSONB" => Self::Json,
            "BYTEA" => Self::Bytea,
            "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => Self::TextArray,
            "INT4[]" => Self::Int4Array,
            "INT8[]" => Self::Int8Array,
            "BOOL[]" => Self::BoolArray,
            "FLOAT8[]" => Self::Float8Array,
            "UUID[]" => Self::UuidArray,
            _ => return None,
        };
        Some(kind)
    }
}

fn decode_row(pg_row: &PgRow) -> Result<Row, DatabaseError> {
    let mut row = Row::new();
    for column in pg_row.columns() {
        row.insert(column.name().to_owned(), decode_column(pg_row, column)?);
    }
    Ok(row)
}

fn decode_column(row: &PgRow, column: &PgColumn) -> Result<Value, DatabaseError> {
    let type_name = column.type_info().name();
    let decode_error = |source: Option<sqlx::Error>| DatabaseError::Decode {
        column: column.name().to_owned(),
        type_name: type_name.to_owned(),
        source: source.map(|err| Box::new(err) as BoxError),
    };
    let kind = ColumnKind::from_type_name(type_name).ok_or_else(|| decode_error(None))?;
    let i = column.ordinal();

    let decoded = match kind {
        ColumnKind::Void => return Ok(Value::Null),
        ColumnKind::Bool => get::<bool>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::Int2 => get::<i16>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::Int4 => get::<i32>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::Int8 => get::<i64>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::Float4 => get::<f32>(row, i).map(|v| v.map(|f| Value::from(f64::from(f)))),
        ColumnKind::Float8 => get::<f64>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::Numeric => get::<Decimal>(row, i).map(|v| v.map(numeric_value)),
        ColumnKind::Text => get::<String>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::Uuid => get::<Uuid>(row, i).map(|v| v.map(|u| Value::from(u.to_string()))),
        ColumnKind::Timestamptz => get::<DateTime<Utc>>(row, i).map(|v| v.map(timestamptz_value)),
        ColumnKind::Timestamp => get::<NaiveDateTime>(row, i).map(|v| v.map(timestamp_value)),
        ColumnKind::Date => get::<NaiveDate>(row, i).map(|v| v.map(|d| Value::from(d.to_string()))),
        ColumnKind::Time => get::<NaiveTime>(row, i).map(|v| v.map(|t| Value::from(t.to_string()))),
        ColumnKind::Json => get::<sqlx::types::Json<Value>>(row, i).map(|v| v.map(|json| json.0)),
        ColumnKind::Bytea => get::<Vec<u8>>(row, i).map(|v| v.map(|b| bytea_value(&b))),
        ColumnKind::TextArray => get::<Vec<Option<String>>>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::Int4Array => get::<Vec<Option<i32>>>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::Int8Array => get::<Vec<Option<i64>>>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::BoolArray => get::<Vec<Option<bool>>>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::Float8Array => get::<Vec<Option<f64>>>(row, i).map(|v| v.map(Value::from)),
        ColumnKind::UuidArray => get::<Vec<Option<Uuid>>>(row, i).map(|v| {
            v.map(|ids| {
                let ids: Vec<Option<String>> = ids
                    .into_iter()
                    .map(|id| id.map(|u| u.to_string()))
                    .collect();
                Value::from(ids)
            })
        }),
    };
    decoded
        .map(|value| value.unwrap_or(Value::Null))
        .map_err(|err| decode_error(Some(err)))
}

fn get<'r, T>(row: &'r PgRow, index: usize) -> Result<Option<T>, sqlx::Error>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<Option<T>, _>(index)
}

fn numeric_value(d: Decimal) -> Value {
    Value::String(d.to_string())
}

fn timestamptz_value(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339())
}

fn timestamp_value(ts: NaiveDateTime) -> Value {
    Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

fn bytea_value(bytes: &[u8]) -> Value {
    let mut hex = String::with_capacity(2 + bytes.len() * 2);
    hex.push_str("\\x");
    for byte in bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    Value::String(hex)
}

fn map_error(err: sqlx::Error) -> DatabaseError {
    match err {
        sqlx::Error::PoolClosed => DatabaseError::PoolClosed,
        sqlx::Error::Database(db) => DatabaseError::Query {
            message: db.message().to_owned(),
            code: db.code().map(|code| code.into_owned()),
            source: Some(Box::new(sqlx::Error::Database(db))),
        },
        other => DatabaseError::Connection(Box::new(other)),
    }
}
