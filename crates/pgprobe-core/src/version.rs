//! Server version parsing.
//!
//! `SELECT version()` returns something like
//! `"PostgreSQL 9.6.2 on x86_64-pc-linux-gnu, compiled by gcc (GCC) 6.2.1 20160830, 64-bit"`,
//! while `SHOW server_version` returns `"13.3 (Debian 13.3-1.pgdg100+1)"`.
//! Both are reduced to a [`semver::Version`] so probes can gate SQL on it.

use std::sync::LazyLock;

use regex::Regex;
use semver::Version;

static VERBOSE_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\w+ ((\d+)(\.\d+)?(\.\d+)?)").expect("verbose version regex is valid")
});

static BARE_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((\d+)(\.\d+)?(\.\d+)?)").expect("bare version regex is valid")
});

/// Extracts the version from `"<product> <version> on ..."`.
pub fn parse_verbose_version(text: &str) -> Option<Version> {
    let caps = VERBOSE_VERSION_RE.captures(text.trim())?;
    parse_tolerant(caps.get(1)?.as_str())
}

/// Extracts the version from `"<version> (<build info>)"`.
pub fn parse_bare_version(text: &str) -> Option<Version> {
    let caps = BARE_VERSION_RE.captures(text.trim())?;
    parse_tolerant(caps.get(1)?.as_str())
}

/// Parses `"16"`, `"16.4"` or `"9.6.2"`, padding missing components with zero.
pub fn parse_tolerant(text: &str) -> Option<Version> {
    let mut parts = text.split('.').map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = match parts.next() {
        Some(p) => p.ok()?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(p) => p.ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(Version::new(major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_form() {
        let v = parse_verbose_version(
            "PostgreSQL 9.6.2 on x86_64-pc-linux-gnu, compiled by gcc (GCC) 6.2.1 20160830, 64-bit",
        );
        assert_eq!(v, Some(Version::new(9, 6, 2)));
        assert_eq!(
            parse_verbose_version("PostgreSQL 16.4 (Debian 16.4-1) on aarch64"),
            Some(Version::new(16, 4, 0))
        );
        assert_eq!(
            parse_verbose_version("PostgreSQL 17beta1 on x86_64"),
            Some(Version::new(17, 0, 0))
        );
    }

    #[test]
    fn verbose_form_rejects_bare_string() {
        assert_eq!(parse_verbose_version("13.3 (Debian 13.3-1.pgdg100+1)"), None);
    }

    #[test]
    fn bare_form() {
        assert_eq!(
            parse_bare_version("13.3 (Debian 13.3-1.pgdg100+1)"),
            Some(Version::new(13, 3, 0))
        );
        assert_eq!(parse_bare_version("17"), Some(Version::new(17, 0, 0)));
        assert_eq!(parse_bare_version("devel"), None);
    }

    #[test]
    fn gating_comparisons() {
        let v16 = Version::new(16, 0, 0);
        assert!(Version::new(16, 4, 0) >= v16);
        assert!(Version::new(15, 9, 0) < v16);
    }
}
