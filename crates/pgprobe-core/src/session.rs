//! Database session abstraction.
//!
//! Probes never talk to `postgres::Client` directly. They go through the
//! [`Session`] trait so the same code runs against a live server
//! ([`PgSession`]) or against scripted responses in tests
//! ([`crate::mock::MockSession`]).

use std::str::FromStr;

use postgres::{Client, Config, NoTls, SimpleQueryMessage};
use tracing::{debug, trace};

use crate::context::{CancelHook, ScrapeContext};
use crate::error::{ProbeError, ProbeResult, format_postgres_error};

/// One result row. Cells are the server's text representation, `None` for NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: Vec<Option<String>>,
}

impl Row {
    pub fn new(cells: Vec<Option<String>>) -> Self {
        Self { cells }
    }

    /// Builds a row from borrowed cells.
    pub fn from_texts(cells: &[Option<&str>]) -> Self {
        Self {
            cells: cells.iter().map(|c| c.map(str::to_string)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Raw text of column `idx`, `None` for NULL.
    pub fn text(&self, idx: usize) -> ProbeResult<Option<&str>> {
        self.cells
            .get(idx)
            .map(|c| c.as_deref())
            .ok_or_else(|| {
                ProbeError::ScanFailed(format!(
                    "column {} out of range ({} columns)",
                    idx,
                    self.cells.len()
                ))
            })
    }

    pub fn f64(&self, idx: usize) -> ProbeResult<Option<f64>> {
        match self.text(idx)? {
            None => Ok(None),
            Some(s) => s.trim().parse::<f64>().map(Some).map_err(|e| {
                ProbeError::ScanFailed(format!("column {}: {:?} is not a number: {}", idx, s, e))
            }),
        }
    }

    pub fn i64(&self, idx: usize) -> ProbeResult<Option<i64>> {
        match self.text(idx)? {
            None => Ok(None),
            Some(s) => s.trim().parse::<i64>().map(Some).map_err(|e| {
                ProbeError::ScanFailed(format!("column {}: {:?} is not an integer: {}", idx, s, e))
            }),
        }
    }

    /// Accepts PostgreSQL's `t`/`f` as well as `true`/`false`.
    pub fn bool(&self, idx: usize) -> ProbeResult<Option<bool>> {
        match self.text(idx)? {
            None => Ok(None),
            Some("t") | Some("true") => Ok(Some(true)),
            Some("f") | Some("false") => Ok(Some(false)),
            Some(other) => Err(ProbeError::ScanFailed(format!(
                "column {}: {:?} is not a boolean",
                idx, other
            ))),
        }
    }
}

/// A single database connection.
///
/// Every call takes the scrape context; implementations must make the call
/// abort when the context is cancelled.
pub trait Session: Send {
    /// Runs `sql` and returns all rows.
    fn query(&mut self, ctx: &ScrapeContext, sql: &str) -> ProbeResult<Vec<Row>>;

    /// Closes the connection.
    fn close(self: Box<Self>) -> ProbeResult<()>;
}

/// Opens sessions from connection descriptors.
pub trait Connector: Send + Sync {
    fn connect(&self, ctx: &ScrapeContext, descriptor: &str) -> ProbeResult<Box<dyn Session>>;
}

/// Connector backed by the `postgres` crate.
///
/// Each session is exactly one client connection; there is no pool behind it,
/// so an Instance never holds more than one open connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

impl Connector for PgConnector {
    fn connect(&self, ctx: &ScrapeContext, descriptor: &str) -> ProbeResult<Box<dyn Session>> {
        ctx.check()?;

        let mut config = Config::from_str(descriptor)
            .map_err(|e| ProbeError::InvalidDescriptor(format_postgres_error(&e)))?;
        // Bound the handshake by whatever is left of the scrape.
        if config.get_connect_timeout().is_none()
            && let Some(remaining) = ctx.remaining()
        {
            if remaining.is_zero() {
                return Err(ProbeError::DeadlineExceeded);
            }
            config.connect_timeout(remaining);
        }

        match config.connect(NoTls) {
            Ok(client) => Ok(Box::new(PgSession { client })),
            Err(e) => {
                if ctx.is_cancelled() {
                    return Err(ctx.cancellation_error());
                }
                Err(ProbeError::ConnectionFailed(format_postgres_error(&e)))
            }
        }
    }
}

/// Runs `call` with `hook` registered on `ctx`.
///
/// A cancel request only interrupts a statement that is already running, so a
/// cancellation landing before registration must stop `call` from starting.
fn with_cancel_hook<T>(
    ctx: &ScrapeContext,
    hook: CancelHook,
    call: impl FnOnce() -> ProbeResult<T>,
) -> ProbeResult<T> {
    let _registration = ctx.register(hook);
    ctx.check()?;
    call()
}

/// Live PostgreSQL session.
pub struct PgSession {
    client: Client,
}

impl Session for PgSession {
    fn query(&mut self, ctx: &ScrapeContext, sql: &str) -> ProbeResult<Vec<Row>> {
        ctx.check()?;

        let token = self.client.cancel_token();
        let hook: CancelHook = Box::new(move || {
            if let Err(e) = token.cancel_query(NoTls) {
                debug!(error = %format_postgres_error(&e), "failed to send cancel request");
            }
        });

        let client = &mut self.client;
        let messages = with_cancel_hook(ctx, hook, || {
            trace!(sql, "running query");
            client.simple_query(sql).map_err(|e| {
                if ctx.is_cancelled() {
                    ctx.cancellation_error()
                } else {
                    ProbeError::QueryFailed(format_postgres_error(&e))
                }
            })
        })?;

        let rows = messages
            .iter()
            .filter_map(|msg| match msg {
                SimpleQueryMessage::Row(row) => Some(Row::new(
                    (0..row.len())
                        .map(|idx| row.get(idx).map(str::to_string))
                        .collect(),
                )),
                _ => None,
            })
            .collect();
        Ok(rows)
    }

    fn close(self: Box<Self>) -> ProbeResult<()> {
        self.client
            .close()
            .map_err(|e| ProbeError::ConnectionFailed(format_postgres_error(&e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_before_registration_skips_the_call() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let ctx = ScrapeContext::background();
        ctx.cancel();

        let hook_fired = Arc::new(AtomicBool::new(false));
        let fired = hook_fired.clone();
        let mut called = false;
        let result = with_cancel_hook(
            &ctx,
            Box::new(move || fired.store(true, Ordering::SeqCst)),
            || {
                called = true;
                Ok(())
            },
        );

        assert!(matches!(result, Err(ProbeError::Cancelled)));
        assert!(!called);
        assert!(hook_fired.load(Ordering::SeqCst));
    }

    #[test]
    fn live_context_runs_the_call() {
        let ctx = ScrapeContext::background();
        let result = with_cancel_hook(&ctx, Box::new(|| {}), || Ok(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn typed_accessors() {
        let row = Row::from_texts(&[Some("42"), Some("1.5"), Some("t"), None, Some("abc")]);
        assert_eq!(row.i64(0).unwrap(), Some(42));
        assert_eq!(row.f64(1).unwrap(), Some(1.5));
        assert_eq!(row.bool(2).unwrap(), Some(true));
        assert_eq!(row.f64(3).unwrap(), None);
        assert_eq!(row.text(4).unwrap(), Some("abc"));
    }

    #[test]
    fn accessor_errors_are_scan_failures() {
        let row = Row::from_texts(&[Some("abc")]);
        assert!(matches!(row.f64(0), Err(ProbeError::ScanFailed(_))));
        assert!(matches!(row.bool(0), Err(ProbeError::ScanFailed(_))));
        assert!(matches!(row.text(3), Err(ProbeError::ScanFailed(_))));
    }

    #[test]
    fn pg_connector_rejects_unparseable_descriptor() {
        let ctx = ScrapeContext::background();
        let result = PgConnector.connect(&ctx, "not a valid dsn");
        assert!(matches!(result, Err(ProbeError::InvalidDescriptor(_))));
    }

    #[test]
    fn pg_connector_honours_cancelled_context() {
        let ctx = ScrapeContext::background();
        ctx.cancel();
        let result = PgConnector.connect(&ctx, "host=localhost dbname=postgres");
        assert!(matches!(result, Err(ProbeError::Cancelled)));
    }
}
