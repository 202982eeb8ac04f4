//! Installed extensions across the databases of a server.
//!
//! Every scrape lists the connectable databases, drops the excluded ones and
//! picks at most `max_databases` of them: the configured include list first,
//! then a random sample of the rest, so a large fleet gets covered over many
//! scrapes. Each selected database gets its own short-lived connection. A
//! database that cannot be reached or queried is logged and skipped.
//!
//! Extensions are deduplicated by name; when several databases carry the same
//! extension the last one scanned wins, and its database is reported in the
//! `datname` label.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::context::ScrapeContext;
use crate::error::ProbeResult;
use crate::instance::Instance;
use crate::registry::Probe;
use crate::sink::{MetricDesc, Sink};

pub const SUBSYSTEM: &str = "extension";

const INFO: MetricDesc = MetricDesc::new(
    SUBSYSTEM,
    "info",
    "Installed PostgreSQL extensions",
    &["datname", "extname", "extversion"],
);
const DATABASES_DISCOVERED: MetricDesc = MetricDesc::new(
    SUBSYSTEM,
    "databases_discovered",
    "Total number of connectable databases found",
    &[],
);
const DATABASES_SCANNED: MetricDesc = MetricDesc::new(
    SUBSYSTEM,
    "databases_scanned",
    "Number of databases scanned for extensions this scrape",
    &[],
);

const DATABASE_LIST_QUERY: &str = "SELECT datname FROM pg_catalog.pg_database \
     WHERE datallowconn AND NOT datistemplate";
const EXTENSION_QUERY: &str = "SELECT extname, extversion FROM pg_catalog.pg_extension";

/// Picks the databases to scan this scrape.
///
/// With `max_scan <= 0` every eligible database is returned in discovery
/// order. Otherwise the `priority` names present in `eligible` come first, in
/// `priority` order, followed by a shuffled sample of the others filling the
/// budget. Priority entries are never dropped, so the result only exceeds
/// `max_scan` when the priority list alone does.
pub fn select_databases<R: Rng + ?Sized>(
    eligible: &[String],
    priority: &[String],
    max_scan: i64,
    rng: &mut R,
) -> Vec<String> {
    if max_scan <= 0 {
        return eligible.to_vec();
    }

    let mut pending: HashSet<&str> = eligible.iter().map(String::as_str).collect();
    let mut selected: Vec<String> = Vec::new();
    for name in priority {
        if pending.remove(name.as_str()) {
            selected.push(name.clone());
        }
    }

    let mut others: Vec<&String> = eligible
        .iter()
        .filter(|name| pending.remove(name.as_str()))
        .collect();
    others.shuffle(rng);

    let room = usize::try_from(max_scan)
        .unwrap_or(usize::MAX)
        .saturating_sub(selected.len());
    selected.extend(others.into_iter().take(room).cloned());
    selected
}

pub struct ExtensionProbe {
    config: ProbeConfig,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl ExtensionProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            config: config.clone(),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
        }
    }

    /// Replaces the sampling source, e.g. with a seeded generator.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Mutex::new(Box::new(rng));
        self
    }

    fn discover(&self, ctx: &ScrapeContext, instance: &mut Instance) -> ProbeResult<Vec<String>> {
        let rows = instance.query(ctx, DATABASE_LIST_QUERY)?;
        let mut eligible = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(datname) = row.text(0)? else {
                continue;
            };
            if self.config.is_excluded(datname) {
                debug!(database = %datname, "skipping excluded database");
                continue;
            }
            eligible.push(datname.to_string());
        }
        Ok(eligible)
    }

    fn select(&self, eligible: &[String]) -> Vec<String> {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let extension = &self.config.extension;
        select_databases(eligible, &extension.include_databases, extension.max_databases, &mut **rng)
    }

    /// Reads one database's extensions. Nothing is returned unless every row
    /// was read.
    fn scan_database(
        &self,
        ctx: &ScrapeContext,
        instance: &Instance,
        datname: &str,
    ) -> ProbeResult<Vec<(String, String)>> {
        let mut session = instance.connect_to_database(ctx, datname)?;
        let rows = session.query(ctx, EXTENSION_QUERY)?;

        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(extname) = row.text(0)? else {
                continue;
            };
            let extversion = row.text(1)?.unwrap_or_default();
            found.push((extname.to_string(), extversion.to_string()));
        }

        if let Err(e) = session.close() {
            debug!(database = %datname, error = %e, "failed to close database connection");
        }
        Ok(found)
    }
}

impl Probe for ExtensionProbe {
    fn update(&self, ctx: &ScrapeContext, instance: &mut Instance, sink: &Sink) -> ProbeResult<()> {
        let eligible = self.discover(ctx, instance)?;
        sink.emit(DATABASES_DISCOVERED.gauge(eligible.len() as f64, &[]));

        if eligible.is_empty() {
            debug!("no databases to query for extensions");
            sink.emit(DATABASES_SCANNED.gauge(0.0, &[]));
            return Ok(());
        }

        let targets = self.select(&eligible);
        sink.emit(DATABASES_SCANNED.gauge(targets.len() as f64, &[]));
        debug!(
            discovered = eligible.len(),
            scanned = targets.len(),
            "scanning databases for extensions"
        );

        // extname -> (datname, extversion)
        let mut extensions: BTreeMap<String, (String, String)> = BTreeMap::new();
        for datname in &targets {
            match self.scan_database(ctx, instance, datname) {
                Ok(found) => {
                    for (extname, extversion) in found {
                        extensions.insert(extname, (datname.clone(), extversion));
                    }
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(database = %datname, error = %e, "failed to collect extensions for database");
                }
            }
        }

        for (extname, (datname, extversion)) in &extensions {
            sink.emit(INFO.gauge(1.0, &[datname.as_str(), extname.as_str(), extversion.as_str()]));
        }
        Ok(())
    }
}

pub(crate) fn construct(config: &ProbeConfig) -> ProbeResult<Box<dyn Probe>> {
    Ok(Box::new(ExtensionProbe::new(config)))
}
