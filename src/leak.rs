//! Leak diagnostics.
//!
//! A client still checked out when its leak timer expires is force-released
//! and described by a [`LeakReport`]. The report is always logged at error
//! level; a [`LeakReporter`] configured on the
//! [`Database`](crate::database::Database) receives it as well, for routing
//! to an external alerting system.

use std::time::Duration;

use serde::Serialize;

use crate::client::LastQuery;

/// Diagnostic snapshot of a leaked client, taken when its leak timer fired.
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    /// Identity of the leaked client.
    pub identity: u64,
    /// Configured leak threshold the client exceeded.
    pub leak_timeout: Duration,
    /// The last statement issued on the client, if any.
    pub last_query: Option<LastQuery>,
    /// Whether a statement was still in flight when the timer fired.
    ///
    /// The statement keeps running on the server; the forced release only
    /// stops this process from waiting on it.
    pub query_running: bool,
    /// Error returned by the forced release, if it failed.
    pub release_error: Option<String>,
}

impl LeakReport {
    /// The normalized text of the last statement, if one was issued.
    pub fn last_query_text(&self) -> Option<&str> {
        self.last_query.as_ref().map(|q| q.text.as_str())
    }
}

/// External monitoring collaborator that receives leak reports.
///
/// Any `Fn(&LeakReport)` closure implements this trait.
pub trait LeakReporter: Send + Sync + 'static {
    fn report(&self, report: &LeakReport);
}

impl<F> LeakReporter for F
where
    F: Fn(&LeakReport) + Send + Sync + 'static,
{
    fn report(&self, report: &LeakReport) {
        self(report)
    }
}

pub(crate) fn log_leak(report: &LeakReport) {
    tracing::error!(
        client = report.identity,
        leak_timeout_ms = report.leak_timeout.as_millis() as u64,
        query_running = report.query_running,
        last_query = report.last_query_text().unwrap_or("<none>"),
        release_error = report.release_error.as_deref().unwrap_or("<none>"),
        "database client leaked; forced release"
    );
}
