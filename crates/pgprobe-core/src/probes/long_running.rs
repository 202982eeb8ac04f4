//! Transactions open for longer than fixed age thresholds.

use crate::config::ProbeConfig;
use crate::context::ScrapeContext;
use crate::error::{ProbeError, ProbeResult};
use crate::instance::Instance;
use crate::registry::Probe;
use crate::sink::{MetricDesc, Sink};

pub const SUBSYSTEM: &str = "long_running_transactions";

const COUNT: MetricDesc = MetricDesc::new(
    SUBSYSTEM,
    "count",
    "Number of transactions running longer than threshold",
    &["threshold"],
);
const OLDEST: MetricDesc = MetricDesc::new(
    SUBSYSTEM,
    "oldest_timestamp_seconds",
    "The current maximum transaction age in seconds",
    &[],
);

/// Age thresholds in seconds, in column order of [`QUERY`].
const THRESHOLDS: [&str; 4] = ["60", "300", "600", "1800"];

const QUERY: &str = "WITH transaction_ages AS (
    SELECT EXTRACT(EPOCH FROM clock_timestamp() - xact_start) AS age_seconds
    FROM pg_catalog.pg_stat_activity
    WHERE state IS DISTINCT FROM 'idle'
      AND query NOT LIKE 'autovacuum:%'
      AND xact_start IS NOT NULL
)
SELECT
    COUNT(*) FILTER (WHERE age_seconds >= 60),
    COUNT(*) FILTER (WHERE age_seconds >= 300),
    COUNT(*) FILTER (WHERE age_seconds >= 600),
    COUNT(*) FILTER (WHERE age_seconds >= 1800),
    MAX(age_seconds)
FROM transaction_ages";

pub struct LongRunningTransactionsProbe;

impl Probe for LongRunningTransactionsProbe {
    fn update(&self, ctx: &ScrapeContext, instance: &mut Instance, sink: &Sink) -> ProbeResult<()> {
        let rows = instance.query(ctx, QUERY)?;
        let row = rows
            .first()
            .ok_or_else(|| ProbeError::ScanFailed("aggregate returned no row".to_string()))?;

        let mut counts = [0.0; THRESHOLDS.len()];
        for (idx, count) in counts.iter_mut().enumerate() {
            *count = row.f64(idx)?.unwrap_or(0.0);
        }
        // NULL when nothing is running.
        let oldest = row.f64(THRESHOLDS.len())?.unwrap_or(0.0);

        for (threshold, count) in THRESHOLDS.iter().zip(counts) {
            sink.emit(COUNT.gauge(count, &[*threshold]));
        }
        sink.emit(OLDEST.gauge(oldest, &[]));
        Ok(())
    }
}

pub(crate) fn construct(_config: &ProbeConfig) -> ProbeResult<Box<dyn Probe>> {
    Ok(Box::new(LongRunningTransactionsProbe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use crate::session::Row;
    use std::sync::Arc;
    use std::time::Duration;

    fn instance(connector: &MockConnector) -> Instance {
        connector.on_query(
            "postgres",
            "SELECT version()",
            vec![Row::from_texts(&[Some("PostgreSQL 13.4 on x86_64")])],
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

    #[test]
    fn emits_one_gauge_per_threshold() {
        let connector = MockConnector::new();
        connector.on_query(
            "postgres",
            QUERY,
            vec![Row::from_texts(&[
                Some("5"),
                Some("3"),
                Some("1"),
                Some("0"),
                Some("742.25"),
            ])],
        );
        let mut instance = instance(&connector);
        let sink = Sink::new();
        LongRunningTransactionsProbe
            .update(&ScrapeContext::background(), &mut instance, &sink)
            .unwrap();

        let samples = sink.snapshot();
        let counts: Vec<(&str, f64)> = samples
            .iter()
            .filter(|s| s.name == "pg_long_running_transactions_count")
            .map(|s| (s.label("threshold").unwrap_or_default(), s.value))
            .collect();
        assert_eq!(
            counts,
            vec![("60", 5.0), ("300", 3.0), ("600", 1.0), ("1800", 0.0)]
        );
        let oldest = samples.last().unwrap();
        assert_eq!(oldest.name, "pg_long_running_transactions_oldest_timestamp_seconds");
        assert_eq!(oldest.value, 742.25);
    }

    #[test]
    fn idle_server_reports_zero_age() {
        let connector = MockConnector::new();
        connector.on_query(
            "postgres",
            QUERY,
            vec![Row::from_texts(&[Some("0"), Some("0"), Some("0"), Some("0"), None])],
        );
        let mut instance = instance(&connector);
        let sink = Sink::new();
        LongRunningTransactionsProbe
            .update(&ScrapeContext::background(), &mut instance, &sink)
            .unwrap();

        let samples = sink.snapshot();
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[4].value, 0.0);
    }

    #[test]
    fn malformed_row_is_a_scan_failure() {
        let connector = MockConnector::new();
        connector.on_query("postgres", QUERY, vec![Row::from_texts(&[Some("many")])]);
        let mut instance = instance(&connector);
        let sink = Sink::new();
        let result =
            LongRunningTransactionsProbe.update(&ScrapeContext::background(), &mut instance, &sink);
        assert!(matches!(result, Err(ProbeError::ScanFailed(_))));
        assert!(sink.is_empty());
    }
}
