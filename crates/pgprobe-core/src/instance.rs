//! Monitored PostgreSQL instance.
//!
//! An [`Instance`] owns (or borrows) the primary connection used by every
//! probe during a scrape, knows the server version, and can open additional
//! connections to sibling databases on the same server for multi-database
//! probes.
//!
//! ## Lifecycle
//!
//! 1. [`Instance::new`] validates the descriptor; no socket is opened.
//! 2. [`Instance::setup`] connects, applies the session statement timeout and
//!    detects the server version.
//! 3. Probes run against it.
//! 4. [`Instance::close`] releases the connection if this instance opened it.
//!
//! A configured instance serves as a template: [`Instance::template`] yields an
//! unconfigured copy sharing descriptor, timeout and connector, which is how
//! every scrape gets its own independent instance.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use semver::Version;
use tracing::{debug, warn};

use crate::context::ScrapeContext;
use crate::dsn::Dsn;
use crate::error::{ProbeError, ProbeResult};
use crate::session::{Connector, PgConnector, Row, Session};
use crate::version::{parse_bare_version, parse_verbose_version};

const VERSION_QUERY: &str = "SELECT version()";
const SERVER_VERSION_QUERY: &str = "SHOW server_version";

/// A session owned by someone else (for example a host application that
/// shares one connection across components).
pub type SharedSession = Arc<Mutex<Box<dyn Session>>>;

enum SessionHandle {
    /// Opened by this instance; closed by [`Instance::close`].
    Owned(Box<dyn Session>),
    /// Supplied externally; left open on close.
    Borrowed(SharedSession),
}

/// Creates a ready-to-use instance for one scrape.
pub type InstanceFactory = Box<dyn Fn(&ScrapeContext) -> ProbeResult<Instance> + Send + Sync>;

/// Factory that copies `template` and sets up a fresh connection on each call.
pub fn instance_factory_from_template(template: Instance) -> InstanceFactory {
    let dsn = template.dsn.clone();
    let statement_timeout = template.statement_timeout;
    let connector = template.connector.clone();
    Box::new(move |ctx| {
        let mut instance = Instance::unconfigured(dsn.clone(), statement_timeout, connector.clone());
        instance.setup(ctx)?;
        Ok(instance)
    })
}

pub struct Instance {
    dsn: Dsn,
    statement_timeout: Duration,
    connector: Arc<dyn Connector>,
    session: Option<SessionHandle>,
    version: Version,
}

impl Instance {
    /// Creates an unconfigured instance using the real PostgreSQL connector.
    ///
    /// A zero `statement_timeout` leaves the server default in place.
    pub fn new(descriptor: &str, statement_timeout: Duration) -> ProbeResult<Self> {
        Self::with_connector(descriptor, statement_timeout, Arc::new(PgConnector))
    }

    /// Creates an unconfigured instance that opens sessions through `connector`.
    pub fn with_connector(
        descriptor: &str,
        statement_timeout: Duration,
        connector: Arc<dyn Connector>,
    ) -> ProbeResult<Self> {
        let dsn = Dsn::parse(descriptor)?;
        Ok(Self::unconfigured(dsn, statement_timeout, connector))
    }

    fn unconfigured(dsn: Dsn, statement_timeout: Duration, connector: Arc<dyn Connector>) -> Self {
        Self {
            dsn,
            statement_timeout,
            connector,
            session: None,
            version: Version::new(0, 0, 0),
        }
    }

    /// Unconfigured copy: same descriptor, timeout and connector, no connection.
    pub fn template(&self) -> Self {
        Self::unconfigured(self.dsn.clone(), self.statement_timeout, self.connector.clone())
    }

    /// Opens the primary connection, applies the statement timeout and
    /// detects the server version.
    pub fn setup(&mut self, ctx: &ScrapeContext) -> ProbeResult<()> {
        let session = self.connector.connect(ctx, &self.dsn.to_string())?;
        self.session = Some(SessionHandle::Owned(session));

        if let Err(e) = self.configure(ctx) {
            if let Err(close_err) = self.close() {
                debug!(error = %close_err, "failed to close connection after setup error");
            }
            return Err(e);
        }

        debug!(
            dsn = %self.dsn.redacted(),
            version = %self.version,
            statement_timeout_ms = self.statement_timeout.as_millis() as u64,
            "instance ready"
        );
        Ok(())
    }

    /// Sets the instance up on a connection it does not own.
    ///
    /// The timeout is applied at session level on the shared connection.
    /// [`Instance::close`] leaves the connection open.
    pub fn setup_with_session(
        &mut self,
        ctx: &ScrapeContext,
        shared: SharedSession,
    ) -> ProbeResult<()> {
        self.session = Some(SessionHandle::Borrowed(shared));
        if let Err(e) = self.configure(ctx) {
            self.session = None;
            return Err(e);
        }
        Ok(())
    }

    fn configure(&mut self, ctx: &ScrapeContext) -> ProbeResult<()> {
        if !self.statement_timeout.is_zero() {
            let sql = format!(
                "SET statement_timeout = {}",
                self.statement_timeout.as_millis()
            );
            self.execute(ctx, &sql).map_err(|e| match e {
                e if e.is_cancellation() => e,
                e => ProbeError::TimeoutConfigurationFailed(e.to_string()),
            })?;
        }

        self.version = self.detect_version(ctx)?;
        Ok(())
    }

    fn detect_version(&mut self, ctx: &ScrapeContext) -> ProbeResult<Version> {
        let verbose = self.query_single_text(ctx, VERSION_QUERY)?;
        if let Some(version) = verbose.as_deref().and_then(parse_verbose_version) {
            return Ok(version);
        }

        let bare = self.query_single_text(ctx, SERVER_VERSION_QUERY)?;
        if let Some(version) = bare.as_deref().and_then(parse_bare_version) {
            return Ok(version);
        }

        Err(ProbeError::VersionUnparseable(
            bare.or(verbose).unwrap_or_default(),
        ))
    }

    fn query_single_text(&mut self, ctx: &ScrapeContext, sql: &str) -> ProbeResult<Option<String>> {
        let rows = self.query(ctx, sql)?;
        match rows.first() {
            Some(row) => Ok(row.text(0)?.map(str::to_string)),
            None => Ok(None),
        }
    }

    /// Runs `sql` on the primary connection.
    pub fn query(&mut self, ctx: &ScrapeContext, sql: &str) -> ProbeResult<Vec<Row>> {
        match self.session.as_mut() {
            Some(SessionHandle::Owned(session)) => session.query(ctx, sql),
            Some(SessionHandle::Borrowed(shared)) => {
                let mut session = shared.lock().map_err(|_| {
                    ProbeError::ConnectionFailed("shared session lock poisoned".to_string())
                })?;
                session.query(ctx, sql)
            }
            None => Err(ProbeError::ConnectionFailed(
                "instance is not set up".to_string(),
            )),
        }
    }

    /// Runs a statement on the primary connection, discarding rows.
    pub fn execute(&mut self, ctx: &ScrapeContext, sql: &str) -> ProbeResult<()> {
        self.query(ctx, sql).map(|_| ())
    }

    /// Opens a separate connection to `database` on the same server.
    ///
    /// The primary connection is not touched. The returned handle closes its
    /// connection when dropped.
    pub fn connect_to_database(
        &self,
        ctx: &ScrapeContext,
        database: &str,
    ) -> ProbeResult<DatabaseSession> {
        let descriptor = self.dsn.with_database(database).to_string();
        let session = self.connector.connect(ctx, &descriptor)?;
        let mut handle = DatabaseSession {
            datname: database.to_string(),
            session: Some(session),
        };

        if !self.statement_timeout.is_zero() {
            let sql = format!(
                "SET statement_timeout = {}",
                self.statement_timeout.as_millis()
            );
            handle.query(ctx, &sql).map_err(|e| match e {
                e if e.is_cancellation() => e,
                e => ProbeError::TimeoutConfigurationFailed(e.to_string()),
            })?;
        }

        Ok(handle)
    }

    /// Releases the primary connection if this instance opened it.
    pub fn close(&mut self) -> ProbeResult<()> {
        match self.session.take() {
            Some(SessionHandle::Owned(session)) => session.close(),
            Some(SessionHandle::Borrowed(_)) | None => Ok(()),
        }
    }

    /// Detected server version (`0.0.0` before setup).
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// True if the server version is at least `major.minor.patch`.
    pub fn version_gte(&self, major: u64, minor: u64, patch: u64) -> bool {
        self.version >= Version::new(major, minor, patch)
    }

    /// True if the server version is below `major.minor.patch`.
    pub fn version_lt(&self, major: u64, minor: u64, patch: u64) -> bool {
        self.version < Version::new(major, minor, patch)
    }

    pub fn descriptor(&self) -> &Dsn {
        &self.dsn
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// True if [`Instance::close`] would close the connection.
    pub fn owns_connection(&self) -> bool {
        matches!(self.session, Some(SessionHandle::Owned(_)))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close instance connection");
        }
    }
}

/// Connection to one sibling database, opened for multi-database probes.
///
/// Closed on drop, so every exit path of the probe releases it.
pub struct DatabaseSession {
    datname: String,
    session: Option<Box<dyn Session>>,
}

impl DatabaseSession {
    pub fn datname(&self) -> &str {
        &self.datname
    }

    pub fn query(&mut self, ctx: &ScrapeContext, sql: &str) -> ProbeResult<Vec<Row>> {
        match self.session.as_mut() {
            Some(session) => session.query(ctx, sql),
            None => Err(ProbeError::ConnectionFailed(format!(
                "connection to {} already closed",
                self.datname
            ))),
        }
    }

    /// Closes the connection, reporting any error.
    pub fn close(mut self) -> ProbeResult<()> {
        match self.session.take() {
            Some(session) => session.close(),
            None => Ok(()),
        }
    }
}

impl Drop for DatabaseSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take()
            && let Err(e) = session.close()
        {
            debug!(database = %self.datname, error = %e, "failed to close database connection");
        }
    }
}
