//! pgprobe-core - PostgreSQL metrics collection engine.
//!
//! Provides:
//! - `dsn` - connection descriptor parsing and database rewriting
//! - `instance` - monitored server handle (connection, version, fan-out)
//! - `registry` - probe table, built once at startup
//! - `scrape` - per-scrape orchestration with per-probe fault isolation
//! - `probes` - built-in probes
//! - `sink` - metric samples and Prometheus text rendering
//! - `context` - cancellable scrape context
//! - `session` - database session seam, `mock` - scripted sessions for tests

pub mod config;
pub mod context;
pub mod dsn;
pub mod error;
pub mod instance;
pub mod mock;
pub mod probes;
pub mod registry;
pub mod scrape;
pub mod session;
pub mod sink;
pub mod version;

pub use config::ProbeConfig;
pub use context::ScrapeContext;
pub use error::{ProbeError, ProbeResult};
pub use instance::Instance;
pub use registry::{Probe, Registry};
pub use scrape::{ScrapeReport, Scraper};
pub use sink::{Sample, Sink};
