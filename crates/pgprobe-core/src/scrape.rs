//! Scrape orchestrator.
//!
//! A [`Scraper`] owns the enabled probes and an [`InstanceFactory`]. Each call
//! to [`Scraper::scrape`] sets up a fresh instance, runs every probe against it
//! with the same context and sink, and turns each probe's result into a pair of
//! `scrape_collector_*` samples. A failing probe never stops the others; only
//! instance setup failures abort the scrape.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::config::ProbeConfig;
use crate::context::ScrapeContext;
use crate::error::{ProbeError, ProbeResult};
use crate::instance::{Instance, InstanceFactory};
use crate::registry::{Probe, Registry};
use crate::sink::{MetricDesc, Sink};

const COLLECTOR_SUCCESS: MetricDesc = MetricDesc::new(
    "scrape",
    "collector_success",
    "Whether a collector succeeded.",
    &["collector"],
);
const COLLECTOR_DURATION: MetricDesc = MetricDesc::new(
    "scrape",
    "collector_duration_seconds",
    "Duration of a collector scrape.",
    &["collector"],
);

/// Result of one probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub name: &'static str,
    pub success: bool,
    /// The probe declined to report anything.
    pub no_data: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeReport {
    pub probes: Vec<ProbeOutcome>,
    pub duration: Duration,
}

impl ScrapeReport {
    pub fn succeeded(&self) -> usize {
        self.probes.iter().filter(|p| p.success).count()
    }

    pub fn failed(&self) -> usize {
        self.probes.len() - self.succeeded()
    }

    pub fn outcome(&self, name: &str) -> Option<&ProbeOutcome> {
        self.probes.iter().find(|p| p.name == name)
    }
}

pub struct Scraper {
    probes: Vec<(&'static str, Box<dyn Probe>)>,
    factory: InstanceFactory,
}

impl Scraper {
    /// Instantiates the probes `config` enables in `registry`.
    pub fn new(
        registry: &Registry,
        config: &ProbeConfig,
        factory: InstanceFactory,
    ) -> ProbeResult<Self> {
        let probes = registry.instantiate(config)?;
        debug!(
            collectors = ?probes.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            "enabled collectors"
        );
        Ok(Self { probes, factory })
    }

    pub fn from_probes(probes: Vec<(&'static str, Box<dyn Probe>)>, factory: InstanceFactory) -> Self {
        Self { probes, factory }
    }

    pub fn probe_names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|(name, _)| *name).collect()
    }

    /// Runs one scrape.
    ///
    /// Fails only when no instance could be set up; probe failures are
    /// reported through the sink and the returned report.
    pub fn scrape(&self, ctx: &ScrapeContext, sink: &Sink) -> ProbeResult<ScrapeReport> {
        let start = Instant::now();
        let mut instance = (self.factory)(ctx).inspect_err(|e| {
            error!(error = %e, "failed to set up instance, skipping scrape");
        })?;

        let mut report = self.run_probes(ctx, &mut instance, sink);

        if let Err(e) = instance.close() {
            warn!(error = %e, "failed to close instance after scrape");
        }
        report.duration = start.elapsed();
        Ok(report)
    }

    /// Runs every probe against an instance that is already set up.
    pub fn run_probes(&self, ctx: &ScrapeContext, instance: &mut Instance, sink: &Sink) -> ScrapeReport {
        let start = Instant::now();
        let mut report = ScrapeReport::default();

        for (name, probe) in &self.probes {
            let name = *name;
            let outcome = run_probe(name, probe.as_ref(), ctx, instance, sink);
            sink.emit(COLLECTOR_SUCCESS.gauge(if outcome.success { 1.0 } else { 0.0 }, &[name]));
            sink.emit(COLLECTOR_DURATION.gauge(outcome.duration.as_secs_f64(), &[name]));
            report.probes.push(outcome);
        }

        report.duration = start.elapsed();
        report
    }
}

fn run_probe(
    name: &'static str,
    probe: &dyn Probe,
    ctx: &ScrapeContext,
    instance: &mut Instance,
    sink: &Sink,
) -> ProbeOutcome {
    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| probe.update(ctx, instance, sink)))
        .unwrap_or_else(|payload| Err(ProbeError::QueryFailed(panic_message(payload))));
    let duration = start.elapsed();
    let duration_ms = duration.as_millis() as u64;

    match result {
        Ok(()) => {
            debug!(probe = %name, duration_ms, "collector succeeded");
            ProbeOutcome {
                name,
                success: true,
                no_data: false,
                duration,
                error: None,
            }
        }
        Err(e) if e.is_no_data() => {
            debug!(probe = %name, duration_ms, "collector returned no data");
            ProbeOutcome {
                name,
                success: false,
                no_data: true,
                duration,
                error: None,
            }
        }
        Err(e) => {
            error!(probe = %name, duration_ms, error = %e, "collector failed");
            ProbeOutcome {
                name,
                success: false,
                no_data: false,
                duration,
                error: Some(e.to_string()),
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("collector panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("collector panicked: {}", s)
    } else {
        "collector panicked".to_string()
    }
}
