//! Test support: a scripted in-memory pool and a log capture layer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::field::{Field, Visit};
use tracing::{Event as TracingEvent, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer};
use tracing_subscriber::prelude::*;

use crate::error::DatabaseError;
use crate::pool::{Pool, PoolConnection, QueryResult, ReleaseMode};

/// Something the mock pool observed, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PoolEvent {
    Checkout { conn: u64 },
    Query { conn: u64, text: String, args: Vec<Value> },
    Release { conn: u64, mode: ReleaseMode },
    PoolQuery { text: String, args: Vec<Value> },
}

#[derive(Default)]
struct MockState {
    idle: Vec<Arc<MockConnection>>,
    checked_out: HashMap<u64, Arc<MockConnection>>,
    next_key: u64,
    events: Vec<PoolEvent>,
    connect_failure: Option<String>,
    failures: Vec<(String, String, Option<String>)>,
    hangs: Vec<String>,
    closed: bool,
}

/// In-memory pool that hands the same physical connection objects back out,
/// most recently released first.
#[derive(Clone, Default)]
pub(crate) struct MockPool {
    state: Arc<Mutex<MockState>>,
}

/// One physical connection. Statements on it run one at a time, so a hung
/// statement holds up everything queued behind it.
pub(crate) struct MockConnection {
    key: u64,
    state: Arc<Mutex<MockState>>,
    gate: tokio::sync::Mutex<()>,
}

impl MockPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every subsequent checkout fails with a connection error carrying `message`.
    pub(crate) fn fail_connect(&self, message: &str) {
        self.state.lock().connect_failure = Some(message.to_owned());
    }

    /// Statements containing `pattern` fail with a query error.
    pub(crate) fn fail_queries(&self, pattern: &str, message: &str, code: Option<&str>) {
        self.state.lock().failures.push((
            pattern.to_owned(),
            message.to_owned(),
            code.map(str::to_owned),
        ));
    }

    /// Statements containing `pattern` never complete.
    pub(crate) fn hang_queries(&self, pattern: &str) {
        self.state.lock().hangs.push(pattern.to_owned());
    }

    /// Puts every checked-out connection back on the idle list without a release,
    /// as a misbehaving pool would.
    pub(crate) fn reclaim_all(&self) {
        let mut state = self.state.lock();
        let reclaimed: Vec<_> = state.checked_out.drain().map(|(_, conn)| conn).collect();
        state.idle.extend(reclaimed);
    }

    /// Closes every idle connection, as an idle reaper or lifetime limit would.
    /// Later checkouts open new connections under new keys.
    pub(crate) fn retire_idle(&self) {
        self.state.lock().idle.clear();
    }

    pub(crate) fn events(&self) -> Vec<PoolEvent> {
        self.state.lock().events.clone()
    }

    /// Texts of the statements sent on connection `conn`, in order.
    pub(crate) fn statements(&self, conn: u64) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PoolEvent::Query { conn: c, text, .. } if c == conn => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Number of statements, on any connection, whose text is exactly `text`.
    pub(crate) fn count(&self, text: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, PoolEvent::Query { text: t, .. } if t == text))
            .count()
    }

    pub(crate) fn releases(&self, conn: u64) -> Vec<ReleaseMode> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PoolEvent::Release { conn: c, mode } if c == conn => Some(mode),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn scripted(state: &Arc<Mutex<MockState>>, text: &str) -> Result<QueryResult, DatabaseError> {
    let state = state.lock();
    if let Some((_, message, code)) = state.failures.iter().find(|(p, _, _)| text.contains(p)) {
        return Err(DatabaseError::Query {
            message: message.clone(),
            code: code.clone(),
            source: None,
        });
    }
    let row = json!({ "?column?": 1 });
    Ok(QueryResult {
        row_count: 1,
        rows: row.as_object().cloned().into_iter().collect(),
    })
}

fn hangs(state: &Arc<Mutex<MockState>>, text: &str) -> bool {
    state.lock().hangs.iter().any(|p| text.contains(p))
}

#[async_trait]
impl Pool for MockPool {
    async fn connect(&self) -> Result<Arc<dyn PoolConnection>, DatabaseError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DatabaseError::PoolClosed);
        }
        if let Some(message) = &state.connect_failure {
            return Err(DatabaseError::Connection(message.clone().into()));
        }
        let conn = match state.idle.pop() {
            Some(conn) => conn,
            None => {
                state.next_key += 1;
                Arc::new(MockConnection {
                    key: state.next_key,
                    state: Arc::clone(&self.state),
                    gate: tokio::sync::Mutex::new(()),
                })
            }
        };
        state.checked_out.insert(conn.key, Arc::clone(&conn));
        state.events.push(PoolEvent::Checkout { conn: conn.key });
        Ok(conn)
    }

    async fn query(&self, text: &str, args: &[Value]) -> Result<QueryResult, DatabaseError> {
        self.state.lock().events.push(PoolEvent::PoolQuery {
            text: text.to_owned(),
            args: args.to_vec(),
        });
        scripted(&self.state, text)
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.idle.clear();
    }
}

#[async_trait]
impl PoolConnection for MockConnection {
    fn key(&self) -> u64 {
        self.key
    }

    async fn query(&self, text: &str, args: &[Value]) -> Result<QueryResult, DatabaseError> {
        let _gate = self.gate.lock().await;
        self.state.lock().events.push(PoolEvent::Query {
            conn: self.key,
            text: text.to_owned(),
            args: args.to_vec(),
        });
        if hangs(&self.state, text) {
            std::future::pending::<()>().await;
        }
        scripted(&self.state, text)
    }

    async fn release(&self, mode: ReleaseMode) -> Result<(), DatabaseError> {
        let mut state = self.state.lock();
        state.events.push(PoolEvent::Release {
            conn: self.key,
            mode,
        });
        if let Some(conn) = state.checked_out.remove(&self.key) {
            if mode == ReleaseMode::Reuse && !state.closed {
                state.idle.push(conn);
            }
        }
        Ok(())
    }
}

/// One captured log event: level, message, and `key=value` fields.
#[derive(Debug, Clone)]
pub(crate) struct LogLine {
    pub(crate) level: Level,
    pub(crate) message: String,
    pub(crate) fields: String,
}

#[derive(Clone, Default)]
pub(crate) struct CapturedLogs {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl CapturedLogs {
    /// Number of events at `level` whose message contains `needle`.
    pub(crate) fn count(&self, level: Level, needle: &str) -> usize {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.level == level && line.message.contains(needle))
            .count()
    }

    pub(crate) fn contains(&self, level: Level, needle: &str) -> bool {
        self.count(level, needle) > 0
    }

    pub(crate) fn at_level(&self, level: Level) -> Vec<LogLine> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.level == level)
            .cloned()
            .collect()
    }
}

struct CaptureLayer {
    logs: CapturedLogs,
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push_str(&format!("{}={:?} ", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.fields.push_str(&format!("{}={} ", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &TracingEvent<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        self.logs.lines.lock().push(LogLine {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

/// Captures every event emitted on this thread until the guard is dropped.
///
/// Tests using this must run on the current-thread runtime (the
/// `#[tokio::test]` default) so spawned tasks log on the same thread.
pub(crate) fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer { logs: logs.clone() });
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}
