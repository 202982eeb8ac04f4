//! Shared probe configuration.
//!
//! Built once by the host at startup and handed read-only to every probe
//! constructor.

use std::collections::BTreeMap;

/// Default scan budget of the extension probe.
pub const DEFAULT_EXTENSION_MAX_DATABASES: i64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConfig {
    /// Databases scanned per scrape; `<= 0` scans all of them.
    pub max_databases: i64,
    /// Databases scanned on every scrape, in this order.
    pub include_databases: Vec<String>,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            max_databases: DEFAULT_EXTENSION_MAX_DATABASES,
            include_databases: Vec::new(),
        }
    }
}

/// Superuser roles the platform itself manages, as a comma-separated list.
pub const DEFAULT_EXPECTED_SUPERUSERS: &str = "pscale_admin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Databases no multi-database probe ever connects to.
    pub exclude_databases: Vec<String>,
    pub extension: ExtensionConfig,
    /// Superuser roles that are not reported as unexpected.
    pub expected_superusers: Vec<String>,
    /// Probe name to enabled flag, overriding the registered default.
    pub overrides: BTreeMap<String, bool>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            exclude_databases: Vec::new(),
            extension: ExtensionConfig::default(),
            expected_superusers: parse_database_list(DEFAULT_EXPECTED_SUPERUSERS),
            overrides: BTreeMap::new(),
        }
    }
}

impl ProbeConfig {
    pub fn is_excluded(&self, database: &str) -> bool {
        self.exclude_databases.iter().any(|d| d == database)
    }

    /// Enables or disables a probe regardless of its default.
    pub fn set_enabled(&mut self, probe: &str, enabled: bool) {
        self.overrides.insert(probe.to_string(), enabled);
    }
}

/// Splits a comma-separated list of names, trimming whitespace and dropping
/// empty entries.
///
/// ```
/// use pgprobe_core::config::parse_database_list;
/// assert_eq!(parse_database_list(" app, ,billing,"), vec!["app", "billing"]);
/// ```
pub fn parse_database_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
