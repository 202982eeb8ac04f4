//! Entries of `synchronized_standby_slots` without a matching physical slot.
//!
//! A dangling entry blocks logical replication, so anything above zero needs
//! attention. The setting exists from PostgreSQL 17; older servers are skipped.

use tracing::debug;

use crate::config::ProbeConfig;
use crate::context::ScrapeContext;
use crate::error::ProbeResult;
use crate::instance::Instance;
use crate::registry::Probe;
use crate::sink::{MetricDesc, Sink};

pub const SUBSYSTEM: &str = "synchronized_standby_slots";

const INVALID: MetricDesc = MetricDesc::new(
    SUBSYSTEM,
    "invalid",
    "Number of slots listed in synchronized_standby_slots that do not exist as physical replication slots. Non-zero means logical replication is blocked.",
    &[],
);

const QUERY: &str = "SELECT count(*) AS invalid_count
FROM unnest(string_to_array(
  (SELECT setting FROM pg_catalog.pg_settings WHERE name = 'synchronized_standby_slots'),
  ','
)) AS configured(slot_name)
WHERE trim(configured.slot_name) != ''
  AND NOT EXISTS(
    SELECT 1 FROM pg_catalog.pg_replication_slots s
    WHERE s.slot_name = trim(configured.slot_name)
      AND s.slot_type = 'physical'
  )";

pub struct SynchronizedStandbySlotsProbe;

impl Probe for SynchronizedStandbySlotsProbe {
    fn update(&self, ctx: &ScrapeContext, instance: &mut Instance, sink: &Sink) -> ProbeResult<()> {
        if instance.version_lt(17, 0, 0) {
            debug!(version = %instance.version(), "synchronized_standby_slots needs PostgreSQL 17, skipping");
            return Ok(());
        }

        let rows = instance.query(ctx, QUERY)?;
        let invalid = match rows.first() {
            Some(row) => row.i64(0)?.unwrap_or(0),
            None => 0,
        };
        sink.emit(INVALID.gauge(invalid as f64, &[]));
        Ok(())
    }
}

pub(crate) fn construct(_config: &ProbeConfig) -> ProbeResult<Box<dyn Probe>> {
    Ok(Box::new(SynchronizedStandbySlotsProbe))
}
