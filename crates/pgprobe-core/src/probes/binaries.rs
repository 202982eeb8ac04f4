//! Build timestamps of custom server binaries.
//!
//! Some server builds ship SQL functions returning the unix time they were
//! built at. Each one found in `pg_proc` becomes an unlabelled gauge.

use tracing::debug;

use crate::config::ProbeConfig;
use crate::context::ScrapeContext;
use crate::error::{ProbeError, ProbeResult};
use crate::instance::Instance;
use crate::registry::Probe;
use crate::sink::{MetricDesc, Sink};

pub const SUBSYSTEM: &str = "postgres_binaries";

const BUILD_TIMESTAMPS: [MetricDesc; 3] = [
    MetricDesc::new(
        SUBSYSTEM,
        "pg_pscale_utils_build_unix_timestamp",
        "Build time of the pg_pscale_utils binary as a unix timestamp",
        &[],
    ),
    MetricDesc::new(
        SUBSYSTEM,
        "pg_readonly_build_unix_timestamp",
        "Build time of the pg_readonly binary as a unix timestamp",
        &[],
    ),
    MetricDesc::new(
        SUBSYSTEM,
        "pginsights_build_unix_timestamp",
        "Build time of the pginsights binary as a unix timestamp",
        &[],
    ),
];

fn exists_query(function: &str) -> String {
    format!(
        "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_proc WHERE proname = '{}')",
        function
    )
}

fn call_query(function: &str) -> String {
    format!("SELECT {}()", function)
}

pub struct PostgresBinariesProbe;

impl PostgresBinariesProbe {
    fn build_timestamp(
        ctx: &ScrapeContext,
        instance: &mut Instance,
        function: &str,
    ) -> ProbeResult<Option<f64>> {
        let exists = instance
            .query(ctx, &exists_query(function))?
            .first()
            .map(|row| row.bool(0))
            .transpose()?
            .flatten()
            .unwrap_or(false);
        if !exists {
            debug!(function, "build timestamp function not installed");
            return Ok(None);
        }

        let rows = instance.query(ctx, &call_query(function))?;
        let row = rows
            .first()
            .ok_or_else(|| ProbeError::ScanFailed(format!("{}() returned no row", function)))?;
        row.f64(0)
    }
}

impl Probe for PostgresBinariesProbe {
    fn update(&self, ctx: &ScrapeContext, instance: &mut Instance, sink: &Sink) -> ProbeResult<()> {
        let mut found = Vec::new();
        for desc in &BUILD_TIMESTAMPS {
            if let Some(value) = Self::build_timestamp(ctx, instance, desc.name)? {
                found.push(desc.gauge(value, &[]));
            }
        }

        if found.is_empty() {
            return Err(ProbeError::NoData);
        }
        for sample in found {
            sink.emit(sample);
        }
        Ok(())
    }
}

pub(crate) fn construct(_config: &ProbeConfig) -> ProbeResult<Box<dyn Probe>> {
    Ok(Box::new(PostgresBinariesProbe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use crate::session::Row;
    use std::sync::Arc;
    use std::time::Duration;

    const FUNCTIONS: [&str; 3] = [
        "pg_pscale_utils_build_unix_timestamp",
        "pg_readonly_build_unix_timestamp",
        "pginsights_build_unix_timestamp",
    ];

    fn instance(connector: &MockConnector) -> Instance {
        connector.on_query(
            "postgres",
            "SELECT version()",
            vec![Row::from_texts(&[Some("PostgreSQL 16.4 on x86_64")])],
        );
        let mut instance = Instance::with_connector(
            "host=h dbname=postgres",
            Duration::ZERO,
            Arc::new(connector.clone()),
        )
        .unwrap();
        instance.setup(&ScrapeContext::background()).unwrap();
        instance
    }

    fn installed(connector: &MockConnector, function: &str, timestamp: Option<&str>) {
        let exists = if timestamp.is_some() { "t" } else { "f" };
        connector.on_query("postgres", &exists_query(function), vec![Row::from_texts(&[Some(exists)])]);
        if let Some(ts) = timestamp {
            connector.on_query("postgres", &call_query(function), vec![Row::from_texts(&[Some(ts)])]);
        }
    }

    #[test]
    fn reports_every_installed_function() {
        let connector = MockConnector::new();
        installed(&connector, FUNCTIONS[0], Some("1700000001"));
        installed(&connector, FUNCTIONS[1], Some("1700000002"));
        installed(&connector, FUNCTIONS[2], Some("1700000003"));

        let mut instance = instance(&connector);
        let sink = Sink::new();
        PostgresBinariesProbe
            .update(&ScrapeContext::background(), &mut instance, &sink)
            .unwrap();

        let samples = sink.snapshot();
        assert_eq!(
            samples.iter().map(|s| s.value).collect::<Vec<_>>(),
            vec![1700000001.0, 1700000002.0, 1700000003.0]
        );
        assert_eq!(
            samples[1].name,
            "pg_postgres_binaries_pg_readonly_build_unix_timestamp"
        );
        assert!(samples.iter().all(|s| s.labels.is_empty()));
    }

    #[test]
    fn skips_missing_functions() {
        let connector = MockConnector::new();
        installed(&connector, FUNCTIONS[0], Some("1700000001"));
        installed(&connector, FUNCTIONS[1], None);
        installed(&connector, FUNCTIONS[2], None);

        let mut instance = instance(&connector);
        let sink = Sink::new();
        PostgresBinariesProbe
            .update(&ScrapeContext::background(), &mut instance, &sink)
            .unwrap();

        assert_eq!(sink.len(), 1);
        assert!(
            !connector
                .calls()
                .iter()
                .any(|(_, sql)| *sql == call_query(FUNCTIONS[1]))
        );
    }

    #[test]
    fn nothing_installed_is_no_data() {
        let connector = MockConnector::new();
        for function in FUNCTIONS {
            installed(&connector, function, None);
        }

        let mut instance = instance(&connector);
        let sink = Sink::new();
        let result =
            PostgresBinariesProbe.update(&ScrapeContext::background(), &mut instance, &sink);
        assert!(matches!(result, Err(ProbeError::NoData)));
        assert!(sink.is_empty());
    }

    #[test]
    fn failed_lookup_fails_without_output() {
        let connector = MockConnector::new();
        connector.fail_query("postgres", &exists_query(FUNCTIONS[0]), "connection refused");

        let mut instance = instance(&connector);
        let sink = Sink::new();
        let result =
            PostgresBinariesProbe.update(&ScrapeContext::background(), &mut instance, &sink);
        assert!(matches!(result, Err(ProbeError::QueryFailed(_))));
        assert!(sink.is_empty());
    }
}
