//! Rendering and writing scrape results.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use pgprobe_core::sink::{Sample, render_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Prometheus text exposition format.
    Text,
    Json,
}

/// Renders one scrape, stamped with `scraped_at`.
pub fn render(samples: &[Sample], format: OutputFormat, scraped_at: DateTime<Utc>) -> io::Result<String> {
    let timestamp = scraped_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    match format {
        OutputFormat::Text => Ok(format!(
            "# pgprobed scrape at {}\n{}",
            timestamp,
            render_text(samples)
        )),
        OutputFormat::Json => {
            let samples = serde_json::to_value(samples).map_err(io::Error::other)?;
            let doc = serde_json::json!({
                "timestamp": timestamp,
                "samples": samples,
            });
            let mut out = serde_json::to_string_pretty(&doc).map_err(io::Error::other)?;
            out.push('\n');
            Ok(out)
        }
    }
}

/// Writes to stdout, or replaces `path` atomically through a `.tmp` sibling
/// so readers never see a half-written file.
pub fn write_output(path: Option<&Path>, content: &str) -> io::Result<()> {
    let Some(path) = path else {
        let mut stdout = io::stdout().lock();
        stdout.write_all(content.as_bytes())?;
        return stdout.flush();
    };

    let tmp = tmp_path(path);
    fs::write(&tmp, content)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pgprobe_core::sink::MetricDesc;

    const SCANNED: MetricDesc = MetricDesc::new(
        "extension",
        "databases_scanned",
        "Number of databases scanned for extensions this scrape",
        &[],
    );

    fn samples() -> Vec<Sample> {
        vec![SCANNED.gauge(3.0, &[])]
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn text_has_header_and_samples() {
        let text = render(&samples(), OutputFormat::Text, at()).unwrap();
        assert!(text.starts_with("# pgprobed scrape at 2025-03-01T12:00:00Z\n"));
        assert!(text.contains("# TYPE pg_extension_databases_scanned gauge"));
        assert!(text.contains("pg_extension_databases_scanned 3\n"));
    }

    #[test]
    fn json_is_parseable() {
        let json = render(&samples(), OutputFormat::Json, at()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(doc["timestamp"], "2025-03-01T12:00:00Z");
        assert_eq!(doc["samples"][0]["name"], "pg_extension_databases_scanned");
        assert_eq!(doc["samples"][0]["kind"], "gauge");
        assert_eq!(doc["samples"][0]["value"], 3.0);
    }

    #[test]
    fn textfile_is_replaced_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.prom");
        fs::write(&path, "stale").unwrap();

        write_output(Some(&path), "fresh\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh\n");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("pg.prom");
        assert!(write_output(Some(&path), "x").is_err());
    }
}
