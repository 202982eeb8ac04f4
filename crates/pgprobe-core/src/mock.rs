//! Scripted in-memory sessions for testing probes without a PostgreSQL server.
//!
//! [`MockConnector`] hands out [`MockSession`]s that answer queries from a
//! table of canned responses keyed by database name and SQL text (whitespace
//! insensitive). It records every connect, query and close so tests can
//! assert on connection hygiene as well as on emitted samples.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use pgprobe_core::context::ScrapeContext;
//! use pgprobe_core::instance::Instance;
//! use pgprobe_core::mock::MockConnector;
//! use pgprobe_core::session::Row;
//!
//! let connector = MockConnector::new();
//! connector.on_query("postgres", "SELECT version()", vec![Row::from_texts(&[Some("PostgreSQL 17.2 on x86_64")])]);
//!
//! let mut instance = Instance::with_connector(
//!     "host=localhost dbname=postgres",
//!     Duration::ZERO,
//!     Arc::new(connector.clone()),
//! ).unwrap();
//! instance.setup(&ScrapeContext::background()).unwrap();
//! assert!(instance.version_gte(17, 0, 0));
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::context::ScrapeContext;
use crate::dsn::Dsn;
use crate::error::{ProbeError, ProbeResult};
use crate::session::{Connector, Row, Session};

/// Database assumed when a descriptor names none.
const DEFAULT_DATABASE: &str = "postgres";

/// Upper bound for [`MockResponse::BlockUntilCancelled`] so a broken test
/// cannot hang forever.
const BLOCK_LIMIT: Duration = Duration::from_secs(10);

/// Canned answer for one query.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows(Vec<Row>),
    Error(String),
    /// Blocks like a long-running statement until the scrape is cancelled.
    BlockUntilCancelled,
}

#[derive(Default)]
struct MockState {
    responses: HashMap<(String, String), MockResponse>,
    connect_failures: HashSet<String>,
    descriptors: Vec<String>,
    calls: Vec<(String, String)>,
    opened: usize,
    closed: usize,
}

/// Connector that opens [`MockSession`]s.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Answers `sql` on `database` with `rows`.
    pub fn on_query(&self, database: &str, sql: &str, rows: Vec<Row>) {
        self.respond(database, sql, MockResponse::Rows(rows));
    }

    /// Makes `sql` on `database` fail with `message`.
    pub fn fail_query(&self, database: &str, sql: &str, message: &str) {
        self.respond(database, sql, MockResponse::Error(message.to_string()));
    }

    pub fn respond(&self, database: &str, sql: &str, response: MockResponse) {
        self.lock()
            .responses
            .insert((database.to_string(), normalize_sql(sql)), response);
    }

    /// Makes connecting to `database` fail.
    pub fn fail_connect(&self, database: &str) {
        self.lock().connect_failures.insert(database.to_string());
    }

    /// Every descriptor passed to `connect`, in order.
    pub fn descriptors(&self) -> Vec<String> {
        self.lock().descriptors.clone()
    }

    /// Every `(database, sql)` executed, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.lock().calls.clone()
    }

    /// Databases that received at least one query, in first-query order.
    pub fn queried_databases(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for (db, _) in self.lock().calls.iter() {
            if !seen.contains(db) {
                seen.push(db.clone());
            }
        }
        seen
    }

    /// Number of sessions successfully opened.
    pub fn opened(&self) -> usize {
        self.lock().opened
    }

    /// Number of sessions closed.
    pub fn closed(&self) -> usize {
        self.lock().closed
    }
}

impl Connector for MockConnector {
    fn connect(&self, ctx: &ScrapeContext, descriptor: &str) -> ProbeResult<Box<dyn Session>> {
        ctx.check()?;
        let database = Dsn::parse(descriptor)?
            .database()
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        let mut state = self.lock();
        state.descriptors.push(descriptor.to_string());
        if state.connect_failures.contains(&database) {
            return Err(ProbeError::ConnectionFailed(format!(
                "database \"{}\" does not accept connections",
                database
            )));
        }
        state.opened += 1;

        Ok(Box::new(MockSession {
            database,
            state: self.state.clone(),
        }))
    }
}

/// Session answering from the connector's response table.
pub struct MockSession {
    database: String,
    state: Arc<Mutex<MockState>>,
}

impl Session for MockSession {
    fn query(&mut self, ctx: &ScrapeContext, sql: &str) -> ProbeResult<Vec<Row>> {
        ctx.check()?;

        let key = (self.database.clone(), normalize_sql(sql));
        let response = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.calls.push((self.database.clone(), sql.to_string()));
            state.responses.get(&key).cloned()
        };

        match response {
            Some(MockResponse::Rows(rows)) => Ok(rows),
            Some(MockResponse::Error(message)) => Err(ProbeError::QueryFailed(message)),
            Some(MockResponse::BlockUntilCancelled) => block_until_cancelled(ctx),
            None => Err(ProbeError::QueryFailed(format!(
                "unexpected query on {}: {}",
                self.database, sql
            ))),
        }
    }

    fn close(self: Box<Self>) -> ProbeResult<()> {
        match self.state.lock() {
            Ok(mut state) => state.closed += 1,
            Err(poisoned) => poisoned.into_inner().closed += 1,
        }
        Ok(())
    }
}

/// Waits for the context's cancel hook, the way a real session waits for the
/// server to abort the statement.
fn block_until_cancelled(ctx: &ScrapeContext) -> ProbeResult<Vec<Row>> {
    let signal = Arc::new((Mutex::new(false), Condvar::new()));
    let hook_signal = signal.clone();
    let _registration = ctx.register(Box::new(move || {
        let (lock, cvar) = &*hook_signal;
        if let Ok(mut fired) = lock.lock() {
            *fired = true;
            cvar.notify_all();
        }
    }));

    let (lock, cvar) = &*signal;
    let guard = lock
        .lock()
        .map_err(|_| ProbeError::QueryFailed("mock signal poisoned".to_string()))?;
    let (guard, _) = cvar
        .wait_timeout_while(guard, BLOCK_LIMIT, |fired| !*fired)
        .map_err(|_| ProbeError::QueryFailed("mock signal poisoned".to_string()))?;

    if *guard {
        Err(ctx.cancellation_error())
    } else {
        Err(ProbeError::QueryFailed(
            "statement was never cancelled".to_string(),
        ))
    }
}

/// Collapses whitespace so multi-line SQL constants match their scripted form.
fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
