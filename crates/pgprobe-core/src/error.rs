//! Error types for instance setup, probes and the scrape orchestrator.

use thiserror::Error;

/// Result type alias for probe and instance operations.
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Errors raised while connecting to PostgreSQL or collecting samples.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The connection descriptor is neither URI nor key=value shaped.
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    /// Opening a connection failed (network, authentication, unknown database).
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Neither `version()` nor `server_version` could be parsed.
    #[error("could not parse server version from {0:?}")]
    VersionUnparseable(String),

    /// `SET statement_timeout` was rejected.
    #[error("failed to set statement timeout: {0}")]
    TimeoutConfigurationFailed(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    /// A row could not be decoded into the shape the probe expects.
    #[error("scan failed: {0}")]
    ScanFailed(String),

    /// The probe found nothing to report. Not a failure of the server.
    #[error("collector returned no data")]
    NoData,

    #[error("scrape cancelled")]
    Cancelled,

    #[error("scrape deadline exceeded")]
    DeadlineExceeded,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProbeError {
    /// Returns true for the "nothing to report" outcome.
    pub fn is_no_data(&self) -> bool {
        matches!(self, ProbeError::NoData)
    }

    /// Returns true for failures that make every probe pointless for this scrape.
    pub fn is_instance_fatal(&self) -> bool {
        matches!(
            self,
            ProbeError::InvalidDescriptor(_)
                | ProbeError::ConnectionFailed(_)
                | ProbeError::VersionUnparseable(_)
                | ProbeError::TimeoutConfigurationFailed(_)
        )
    }

    /// Returns true if the error came from scrape context cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProbeError::Cancelled | ProbeError::DeadlineExceeded)
    }
}

/// Formats PostgreSQL error message for display.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}
