//! Superuser roles nobody asked for.
//!
//! From PostgreSQL 16 on, membership grants with `SET` or `ADMIN` option on a
//! superuser role are followed recursively and reported as `indirect`.

use std::collections::HashSet;

use tracing::debug;

use crate::config::ProbeConfig;
use crate::context::ScrapeContext;
use crate::error::ProbeResult;
use crate::instance::Instance;
use crate::registry::Probe;
use crate::sink::{MetricDesc, Sink};

pub const SUBSYSTEM: &str = "unexpected_superusers";

const COUNT: MetricDesc = MetricDesc::new(
    SUBSYSTEM,
    "count",
    "Number of superuser roles that are not in the expected superuser list",
    &[],
);
const ROLE: MetricDesc = MetricDesc::new(
    SUBSYSTEM,
    "role",
    "Unexpected superuser role (value is always 1)",
    &["rolname", "access_type"],
);

const SUPERUSERS_QUERY: &str = "SELECT rolname, 'direct'::pg_catalog.text AS access_type \
     FROM pg_catalog.pg_roles WHERE rolsuper";

const SUPERUSERS_QUERY_PG16: &str = "WITH RECURSIVE superuser_chain AS (
    SELECT oid, rolname, 'direct'::pg_catalog.text AS access_type
    FROM pg_catalog.pg_roles WHERE rolsuper
    UNION
    SELECT r.oid, r.rolname, 'indirect'::pg_catalog.text AS access_type
    FROM pg_catalog.pg_roles r
    JOIN pg_catalog.pg_auth_members m ON m.member OPERATOR(pg_catalog.=) r.oid
    JOIN superuser_chain s ON m.roleid OPERATOR(pg_catalog.=) s.oid
    WHERE NOT r.rolsuper
        AND (m.set_option OPERATOR(pg_catalog.=) true OR m.admin_option OPERATOR(pg_catalog.=) true)
)
SELECT rolname, access_type FROM superuser_chain";

pub struct UnexpectedSuperusersProbe {
    expected: HashSet<String>,
}

impl UnexpectedSuperusersProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            expected: config.expected_superusers.iter().cloned().collect(),
        }
    }
}

impl Probe for UnexpectedSuperusersProbe {
    fn update(&self, ctx: &ScrapeContext, instance: &mut Instance, sink: &Sink) -> ProbeResult<()> {
        let sql = if instance.version_gte(16, 0, 0) {
            SUPERUSERS_QUERY_PG16
        } else {
            SUPERUSERS_QUERY
        };

        let rows = instance.query(ctx, sql)?;
        // Decode everything before emitting so a bad row leaves no partial output.
        let mut unexpected = Vec::new();
        for row in &rows {
            let Some(rolname) = row.text(0)? else {
                continue;
            };
            if self.expected.contains(rolname) {
                debug!(role = %rolname, "expected superuser");
                continue;
            }
            let access_type = row.text(1)?.unwrap_or("direct");
            unexpected.push((rolname.to_string(), access_type.to_string()));
        }

        for (rolname, access_type) in &unexpected {
            sink.emit(ROLE.gauge(1.0, &[rolname.as_str(), access_type.as_str()]));
        }
        sink.emit(COUNT.gauge(unexpected.len() as f64, &[]));
        Ok(())
    }
}

pub(crate) fn construct(config: &ProbeConfig) -> ProbeResult<Box<dyn Probe>> {
    Ok(Box::new(UnexpectedSuperusersProbe::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::mock::MockConnector;
    use crate::session::Row;
    use std::sync::Arc;
    use std::time::Duration;

    fn instance(version: &str, connector: &MockConnector) -> Instance {
        connector.on_query("postgres", "SELECT version()", vec![Row::from_texts(&[Some(version)])]);
        let mut instance = Instance::with_connector(
            "host=h dbname=postgres",
            Duration::ZERO,
            Arc::new(connector.clone()),
        )
        .unwrap();
        instance.setup(&ScrapeContext::background()).unwrap();
        instance
    }

    fn config(expected: &[&str]) -> ProbeConfig {
        ProbeConfig {
            expected_superusers: expected.iter().map(|s| s.to_string()).collect(),
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn pg16_reports_indirect_members() {
        let connector = MockConnector::new();
        connector.on_query(
            "postgres",
            SUPERUSERS_QUERY_PG16,
            vec![
                Row::from_texts(&[Some("postgres"), Some("direct")]),
                Row::from_texts(&[Some("admin"), Some("direct")]),
                Row::from_texts(&[Some("ops"), Some("indirect")]),
            ],
        );
        let mut instance = instance("PostgreSQL 16.2 on x86_64", &connector);
        let sink = Sink::new();
        UnexpectedSuperusersProbe::new(&config(&["postgres"]))
            .update(&ScrapeContext::background(), &mut instance, &sink)
            .unwrap();

        let samples = sink.snapshot();
        let roles: Vec<(&str, &str)> = samples
            .iter()
            .filter(|s| s.name == "pg_unexpected_superusers_role")
            .map(|s| {
                (
                    s.label("rolname").unwrap_or_default(),
                    s.label("access_type").unwrap_or_default(),
                )
            })
            .collect();
        assert_eq!(roles, vec![("admin", "direct"), ("ops", "indirect")]);

        let count = samples
            .iter()
            .find(|s| s.name == "pg_unexpected_superusers_count")
            .unwrap();
        assert_eq!(count.value, 2.0);
    }

    #[test]
    fn older_servers_use_flat_scan() {
        let connector = MockConnector::new();
        connector.on_query(
            "postgres",
            SUPERUSERS_QUERY,
            vec![Row::from_texts(&[Some("postgres"), None])],
        );
        let mut instance = instance("PostgreSQL 15.6 on x86_64", &connector);
        let sink = Sink::new();
        UnexpectedSuperusersProbe::new(&config(&[]))
            .update(&ScrapeContext::background(), &mut instance, &sink)
            .unwrap();

        let samples = sink.snapshot();
        assert_eq!(samples[0].label("access_type"), Some("direct"));
        assert_eq!(samples[1].value, 1.0);
    }

    #[test]
    fn zero_count_is_still_reported() {
        let connector = MockConnector::new();
        connector.on_query("postgres", SUPERUSERS_QUERY, Vec::new());
        let mut instance = instance("PostgreSQL 14.1 on x86_64", &connector);
        let sink = Sink::new();
        UnexpectedSuperusersProbe::new(&config(&[]))
            .update(&ScrapeContext::background(), &mut instance, &sink)
            .unwrap();

        let samples = sink.snapshot();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "pg_unexpected_superusers_count");
        assert_eq!(samples[0].value, 0.0);
    }

    #[test]
    fn query_error_emits_nothing() {
        let connector = MockConnector::new();
        connector.fail_query("postgres", SUPERUSERS_QUERY_PG16, "permission denied");
        let mut instance = instance("PostgreSQL 17.0 on x86_64", &connector);
        let sink = Sink::new();
        let result = UnexpectedSuperusersProbe::new(&config(&[])).update(
            &ScrapeContext::background(),
            &mut instance,
            &sink,
        );
        assert!(matches!(result, Err(ProbeError::QueryFailed(_))));
        assert!(sink.is_empty());
    }
}
