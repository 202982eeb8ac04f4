//! Connection descriptor parsing and database rewriting.
//!
//! PostgreSQL accepts two textual forms of connection descriptor:
//!
//! - URI: `postgres://[user[:pass]@]host[:port]/[database][?params]`
//!   (`postgresql://` is accepted as well)
//! - libpq key=value: `host=localhost port=5432 user=app dbname=postgres`
//!
//! Both are parsed into a structured [`Dsn`] before rewriting so that
//! pointing a descriptor at another database on the same server never
//! touches credentials, host, port or extra parameters.

use std::fmt;

use crate::error::{ProbeError, ProbeResult};

const URI_SCHEMES: [&str; 2] = ["postgres://", "postgresql://"];

/// Parsed connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dsn {
    Uri(UriDsn),
    KeyValue(KeyValueDsn),
}

/// URI-shaped descriptor split into its components. Everything except the
/// path is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriDsn {
    /// `postgres://` or `postgresql://`, including the separator.
    scheme: &'static str,
    /// `[user[:pass]@]host[:port]`, verbatim.
    authority: String,
    /// Database segment without the leading slash, percent-encoded. Empty means none.
    path: String,
    /// Query string without the leading `?`.
    query: Option<String>,
}

/// libpq key=value descriptor as an ordered token list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueDsn {
    tokens: Vec<KvToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KvToken {
    key: String,
    /// Value exactly as written, quotes included.
    raw_value: String,
}

impl Dsn {
    /// Parses a descriptor in either shape.
    pub fn parse(descriptor: &str) -> ProbeResult<Self> {
        let trimmed = descriptor.trim();
        if trimmed.is_empty() {
            return Err(ProbeError::InvalidDescriptor(
                "empty connection descriptor".to_string(),
            ));
        }

        for scheme in URI_SCHEMES {
            if let Some(rest) = trimmed.strip_prefix(scheme) {
                return Ok(Dsn::Uri(UriDsn::parse(scheme, rest)));
            }
        }

        if let Some(scheme) = uri_scheme(trimmed) {
            return Err(ProbeError::InvalidDescriptor(format!(
                "unsupported URI scheme {:?}",
                scheme
            )));
        }

        KeyValueDsn::parse(trimmed).map(Dsn::KeyValue)
    }

    /// Database the descriptor points at, if it names one explicitly.
    pub fn database(&self) -> Option<String> {
        match self {
            Dsn::Uri(uri) if uri.path.is_empty() => None,
            Dsn::Uri(uri) => Some(percent_decode(&uri.path)),
            Dsn::KeyValue(kv) => kv
                .tokens
                .iter()
                .rev()
                .find(|t| t.key == "dbname")
                .map(|t| unquote(&t.raw_value)),
        }
    }

    /// Returns an equivalent descriptor that targets `database`.
    pub fn with_database(&self, database: &str) -> Dsn {
        match self {
            Dsn::Uri(uri) => Dsn::Uri(UriDsn {
                scheme: uri.scheme,
                authority: uri.authority.clone(),
                path: percent_encode(database),
                query: uri.query.clone(),
            }),
            Dsn::KeyValue(kv) => Dsn::KeyValue(kv.with_database(database)),
        }
    }

    /// Descriptor text with any password masked, for log output.
    pub fn redacted(&self) -> String {
        match self {
            Dsn::Uri(uri) => {
                let authority = match uri.authority.rsplit_once('@') {
                    Some((userinfo, host)) => match userinfo.split_once(':') {
                        Some((user, _)) => format!("{user}:****@{host}"),
                        None => uri.authority.clone(),
                    },
                    None => uri.authority.clone(),
                };
                UriDsn {
                    authority,
                    ..uri.clone()
                }
                .to_string()
            }
            Dsn::KeyValue(kv) => kv
                .tokens
                .iter()
                .map(|t| {
                    if t.key == "password" {
                        format!("{}=****", t.key)
                    } else {
                        format!("{}={}", t.key, t.raw_value)
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dsn::Uri(uri) => uri.fmt(f),
            Dsn::KeyValue(kv) => kv.fmt(f),
        }
    }
}

impl UriDsn {
    fn parse(scheme: &'static str, rest: &str) -> Self {
        let (before_query, query) = match rest.split_once('?') {
            Some((head, q)) => (head, Some(q.to_string())),
            None => (rest, None),
        };
        let (authority, path) = match before_query.split_once('/') {
            Some((a, p)) => (a, p),
            None => (before_query, ""),
        };
        Self {
            scheme,
            authority: authority.to_string(),
            path: path.to_string(),
            query,
        }
    }
}

impl fmt::Display for UriDsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", self.scheme, self.authority, self.path)?;
        if let Some(ref query) = self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

impl KeyValueDsn {
    /// Tokenizes libpq `key=value` pairs.
    ///
    /// Handles optional whitespace around `=` and single-quoted values with
    /// `\'` / `\\` escapes. Any bare word without `=` is rejected.
    fn parse(input: &str) -> ProbeResult<Self> {
        let chars: Vec<char> = input.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;

        let skip_ws = |i: &mut usize| {
            while *i < chars.len() && chars[*i].is_whitespace() {
                *i += 1;
            }
        };

        loop {
            skip_ws(&mut i);
            if i >= chars.len() {
                break;
            }

            let key_start = i;
            while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() {
                i += 1;
            }
            let key: String = chars[key_start..i].iter().collect();

            skip_ws(&mut i);
            if i >= chars.len() || chars[i] != '=' || key.is_empty() {
                return Err(ProbeError::InvalidDescriptor(format!(
                    "expected key=value pair near {:?}",
                    key
                )));
            }
            i += 1; // '='
            skip_ws(&mut i);

            let value_start = i;
            if i < chars.len() && chars[i] == '\'' {
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '\\' => i += 2,
                        '\'' => {
                            i += 1;
                            closed = true;
                            break;
                        }
                        _ => i += 1,
                    }
                }
                if !closed {
                    return Err(ProbeError::InvalidDescriptor(format!(
                        "unterminated quoted value for key {:?}",
                        key
                    )));
                }
            } else {
                while i < chars.len() && !chars[i].is_whitespace() {
                    i += 1;
                }
            }
            let end = i.min(chars.len());
            let raw_value: String = chars[value_start..end].iter().collect();

            tokens.push(KvToken { key, raw_value });
        }

        Ok(Self { tokens })
    }

    /// Replaces the first `dbname` in place (dropping later duplicates) or
    /// appends one when absent.
    fn with_database(&self, database: &str) -> Self {
        let value = quote_value(database);
        let mut found = false;
        let mut tokens = Vec::with_capacity(self.tokens.len() + 1);

        for token in &self.tokens {
            if token.key == "dbname" {
                if !found {
                    found = true;
                    tokens.push(KvToken {
                        key: "dbname".to_string(),
                        raw_value: value.clone(),
                    });
                }
                continue;
            }
            tokens.push(token.clone());
        }

        if !found {
            tokens.push(KvToken {
                key: "dbname".to_string(),
                raw_value: value,
            });
        }

        Self { tokens }
    }
}

impl fmt::Display for KeyValueDsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, token) in self.tokens.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", token.key, token.raw_value)?;
        }
        Ok(())
    }
}

/// Rewrites `descriptor` so that it targets `database`, keeping every other
/// field untouched.
///
/// ```
/// use pgprobe_core::dsn::rewrite_database;
///
/// let dsn = rewrite_database("postgres://u:p@h:5432/orig?sslmode=disable", "new").unwrap();
/// assert_eq!(dsn, "postgres://u:p@h:5432/new?sslmode=disable");
/// ```
pub fn rewrite_database(descriptor: &str, database: &str) -> ProbeResult<String> {
    Dsn::parse(descriptor).map(|dsn| dsn.with_database(database).to_string())
}

/// Quotes a key=value descriptor value when libpq would need it.
pub fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

fn unquote(raw: &str) -> String {
    let Some(inner) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) else {
        return raw.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn percent_encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(
                byte,
                b'-' | b'.'
                    | b'_'
                    | b'~'
                    | b'!'
                    | b'$'
                    | b'&'
                    | b'\''
                    | b'('
                    | b')'
                    | b'*'
                    | b'+'
                    | b','
                    | b';'
                    | b'='
                    | b':'
                    | b'@'
            );
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Some(b) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
        {
            out.push(b);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Scheme of a descriptor that starts with `scheme://`.
///
/// `://` inside a key=value value (a password, a file path) does not count.
fn uri_scheme(descriptor: &str) -> Option<&str> {
    let (scheme, _) = descriptor.split_once("://")?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    let valid = first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'));
    valid.then_some(scheme)
}
