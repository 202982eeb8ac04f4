//! Metric samples and the sink probes write them to.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Mutex;

use serde::Serialize;

/// Prefix shared by every metric this exporter produces.
pub const NAMESPACE: &str = "pg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

/// One observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
}

impl Sample {
    /// Label value by name.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// Joins the non-empty parts with `_`.
pub fn build_fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Static description of a metric family.
#[derive(Debug, Clone, Copy)]
pub struct MetricDesc {
    pub subsystem: &'static str,
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

impl MetricDesc {
    pub const fn new(
        subsystem: &'static str,
        name: &'static str,
        help: &'static str,
        labels: &'static [&'static str],
    ) -> Self {
        Self {
            subsystem,
            name,
            help,
            labels,
        }
    }

    pub fn fq_name(&self) -> String {
        build_fq_name(NAMESPACE, self.subsystem, self.name)
    }

    /// Gauge sample; `values` line up with the declared label names.
    pub fn gauge(&self, value: f64, values: &[&str]) -> Sample {
        self.sample(MetricKind::Gauge, value, values)
    }

    fn sample(&self, kind: MetricKind, value: f64, values: &[&str]) -> Sample {
        debug_assert_eq!(
            self.labels.len(),
            values.len(),
            "label cardinality mismatch for {}",
            self.fq_name()
        );
        Sample {
            name: self.fq_name(),
            help: self.help.to_string(),
            kind,
            value,
            labels: self
                .labels
                .iter()
                .zip(values)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Append-only, thread-safe sample collector for one scrape.
#[derive(Debug, Default)]
pub struct Sink {
    samples: Mutex<Vec<Sample>>,
}

impl Sink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, sample: Sample) {
        match self.samples.lock() {
            Ok(mut samples) => samples.push(sample),
            Err(poisoned) => poisoned.into_inner().push(sample),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything emitted so far, in emission order.
    pub fn snapshot(&self) -> Vec<Sample> {
        match self.samples.lock() {
            Ok(samples) => samples.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn into_samples(self) -> Vec<Sample> {
        match self.samples.into_inner() {
            Ok(samples) => samples,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Renders the Prometheus text exposition format.
    ///
    /// Families appear in first-emission order, samples within a family in
    /// emission order.
    pub fn render_text(&self) -> String {
        render_text(&self.snapshot())
    }
}

/// Renders samples in the Prometheus text exposition format.
pub fn render_text(samples: &[Sample]) -> String {
    let mut families: Vec<(&Sample, Vec<&Sample>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for sample in samples {
        match index.get(sample.name.as_str()) {
            Some(&idx) => families[idx].1.push(sample),
            None => {
                index.insert(sample.name.as_str(), families.len());
                families.push((sample, vec![sample]));
            }
        }
    }

    let mut out = String::new();
    for (head, members) in families {
        let _ = writeln!(out, "# HELP {} {}", head.name, escape_help(&head.help));
        let _ = writeln!(out, "# TYPE {} {}", head.name, head.kind.as_str());
        for sample in members {
            out.push_str(&sample.name);
            if !sample.labels.is_empty() {
                out.push('{');
                for (idx, (k, v)) in sample.labels.iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}=\"{}\"", k, escape_label_value(v));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", format_value(sample.value));
        }
    }
    out
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: MetricDesc = MetricDesc::new(
        "extension",
        "info",
        "Installed PostgreSQL extensions",
        &["datname", "extname", "extversion"],
    );
    const COUNT: MetricDesc = MetricDesc::new("", "long_running_transactions", "x", &[]);

    #[test]
    fn fq_name_skips_empty_parts() {
        assert_eq!(INFO.fq_name(), "pg_extension_info");
        assert_eq!(COUNT.fq_name(), "pg_long_running_transactions");
        assert_eq!(build_fq_name("", "", "up"), "up");
    }

    #[test]
    fn gauge_maps_labels() {
        let s = INFO.gauge(1.0, &["app", "pgcrypto", "1.3"]);
        assert_eq!(s.kind, MetricKind::Gauge);
        assert_eq!(s.label("extname"), Some("pgcrypto"));
        assert_eq!(s.label("datname"), Some("app"));
    }

    #[test]
    fn render_groups_families() {
        let sink = Sink::new();
        sink.emit(INFO.gauge(1.0, &["a", "pgcrypto", "1.3"]));
        sink.emit(COUNT.gauge(2.5, &[]));
        sink.emit(INFO.gauge(1.0, &["b", "uuid-ossp", "1.1"]));

        let text = sink.render_text();
        assert_eq!(text.matches("# TYPE pg_extension_info gauge").count(), 1);
        let expected_line =
            "pg_extension_info{datname=\"b\",extname=\"uuid-ossp\",extversion=\"1.1\"} 1";
        assert!(text.contains(expected_line));
        assert!(text.contains("pg_long_running_transactions 2.5"));
        let first_info = text.find("pgcrypto").unwrap();
        let second_info = text.find("uuid-ossp").unwrap();
        let count = text.find("pg_long_running_transactions 2.5").unwrap();
        assert!(first_info < second_info && second_info < count);
    }

    #[test]
    fn render_escapes_label_values() {
        let sink = Sink::new();
        sink.emit(INFO.gauge(1.0, &["we\"ird", "x\\y", "1\n2"]));
        let text = sink.render_text();
        assert!(text.contains(r#"datname="we\"ird""#));
        assert!(text.contains(r#"extname="x\\y""#));
        assert!(text.contains(r#"extversion="1\n2""#));
    }

    #[test]
    fn special_values() {
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(3.0), "3");
    }
}
