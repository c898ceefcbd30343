//! File identity normalization.
//!
//! Turns a source-specific location (portal URL, UNC path, drive path or
//! relative path) into a [`FileKey`]. Pure: no IO, no mutable state. Each
//! method gets its own [`NormalizationRule`]; new methods register a rule
//! instead of touching this logic.
//!
//! `normalize(normalize(x).to_string()) == normalize(x)` holds because the
//! canonical `[host]path` form is parsed back without percent-decoding or
//! noise trimming a second time.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::RunConfig;
use crate::model::{FileKey, SourceMethod};

pub const DEFAULT_HOST: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationRule {
    /// Lower-case the relative path (hosts are always lower-cased).
    pub case_insensitive: bool,
    /// Leading path segments dropped once, compared case-insensitively.
    pub noise_segments: Vec<String>,
    /// Root for relative locations when the source declares none.
    pub default_host: String,
}

impl NormalizationRule {
    pub fn for_method(method: &SourceMethod) -> Self {
        match method {
            SourceMethod::PatternMatch => Self {
                case_insensitive: true,
                noise_segments: vec![],
                default_host: DEFAULT_HOST.into(),
            },
            SourceMethod::AuthoritativeExportA | SourceMethod::AuthoritativeExportB => Self {
                case_insensitive: true,
                noise_segments: vec!["shared documents".into(), "documents".into()],
                default_host: DEFAULT_HOST.into(),
            },
            SourceMethod::Custom(_) => Self {
                case_insensitive: false,
                noise_segments: vec![],
                default_host: DEFAULT_HOST.into(),
            },
        }
    }
}

/// Rule lookup table keyed by method name, plus host aliases.
#[derive(Debug, Clone, Default)]
pub struct NormalizerTable {
    rules: BTreeMap<String, NormalizationRule>,
    aliases: BTreeMap<String, String>,
}

impl NormalizerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RunConfig) -> Self {
        let mut table = Self::new();
        for (method_name, o) in &config.normalize {
            let method = SourceMethod::from(method_name.as_str());
            let mut rule = table.rule(&method);
            if let Some(ci) = o.case_insensitive {
                rule.case_insensitive = ci;
            }
            if let Some(ref noise) = o.noise_segments {
                rule.noise_segments = noise.clone();
            }
            if let Some(ref host) = o.default_host {
                rule.default_host = host.clone();
            }
            table = table.with_rule(&method, rule);
        }
        for (from, to) in &config.hosts {
            table = table.with_alias(from, to);
        }
        table
    }

    pub fn with_rule(mut self, method: &SourceMethod, rule: NormalizationRule) -> Self {
        let rule = NormalizationRule {
            noise_segments: rule.noise_segments.iter().map(|s| s.to_lowercase()).collect(),
            default_host: clean_host(&rule.default_host),
            ..rule
        };
        self.rules.insert(method.as_str().to_string(), rule);
        self
    }

    /// Map one storage root onto another. Both sides are host-normalized.
    pub fn with_alias(mut self, from: &str, to: &str) -> Self {
        self.aliases.insert(clean_host(from), clean_host(to));
        self
    }

    pub fn rule(&self, method: &SourceMethod) -> NormalizationRule {
        self.rules
            .get(method.as_str())
            .cloned()
            .unwrap_or_else(|| NormalizationRule::for_method(method))
    }

    pub fn normalize(&self, raw_location: &str, method: &SourceMethod) -> FileKey {
        self.normalize_with_host(raw_location, method, None)
    }

    /// `source_host` roots relative locations for sources that declare one.
    pub fn normalize_with_host(
        &self,
        raw_location: &str,
        method: &SourceMethod,
        source_host: Option<&str>,
    ) -> FileKey {
        let rule = self.rule(method);
        let raw = raw_location.trim();
        let fallback_host = source_host
            .map(clean_host)
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| rule.default_host.clone());

        if let Some((host, path)) = self.parse_canonical(raw, &fallback_host) {
            let host = if host.is_empty() { fallback_host } else { host };
            return FileKey {
                host: self.alias(&host),
                relative_path: fold(&clean_path(&path), &rule),
            };
        }

        let (host, path) = split_location(raw);
        let host = match host {
            Some(h) if !h.is_empty() => h,
            _ => fallback_host,
        };

        let mut segments = path_segments(&path);
        if let Some(first) = segments.first() {
            if rule.noise_segments.contains(&first.to_lowercase()) {
                segments.remove(0);
            }
        }

        FileKey {
            host: self.alias(&host),
            relative_path: fold(&segments.join("/"), &rule),
        }
    }

    /// Read `[host]path` back only when `host` is one this table could have
    /// produced: a configured root, or a network-style name. A bracketed
    /// file name such as `[Draft] budget.xlsx` stays a relative path.
    fn parse_canonical(&self, raw: &str, fallback_host: &str) -> Option<(String, String)> {
        let rest = raw.strip_prefix('[')?;
        let end = rest.find(']')?;
        let path = &rest[end + 1..];
        if path.starts_with(char::is_whitespace) {
            return None;
        }
        let host = clean_host(&rest[..end]);
        let produced = host.is_empty()
            || host == fallback_host
            || host.contains(['.', '/', ':'])
            || self.is_configured_host(&host);
        produced.then(|| (host, path.to_string()))
    }

    fn is_configured_host(&self, host: &str) -> bool {
        host == DEFAULT_HOST
            || self.rules.values().any(|r| r.default_host == host)
            || self.aliases.contains_key(host)
            || self.aliases.values().any(|h| h == host)
    }

    /// Follow alias chains to their end. Cycles collapse onto their
    /// smallest member so the result is a fixed point.
    fn alias(&self, host: &str) -> String {
        let mut path: Vec<&str> = vec![host];
        let mut current = host;
        while let Some(next) = self.aliases.get(current) {
            if let Some(pos) = path.iter().position(|h| *h == next.as_str()) {
                return path[pos..]
                    .iter()
                    .min()
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| next.clone());
            }
            path.push(next.as_str());
            current = next.as_str();
        }
        current.to_string()
    }
}

/// Normalize with the default rule table and no aliases.
pub fn normalize(raw_location: &str, method: &SourceMethod) -> FileKey {
    NormalizerTable::new().normalize(raw_location, method)
}

/// Normalize a batch of locations into a key set (used for coverage lists).
pub fn normalize_all<'a>(
    table: &NormalizerTable,
    locations: impl IntoIterator<Item = &'a String>,
    method: &SourceMethod,
    source_host: Option<&str>,
) -> BTreeSet<FileKey> {
    locations
        .into_iter()
        .map(|l| table.normalize_with_host(l, method, source_host))
        .collect()
}

// ---------------------------------------------------------------------------
// Location syntax
// ---------------------------------------------------------------------------

/// Split a non-canonical location into (host, decoded path).
fn split_location(raw: &str) -> (Option<String>, String) {
    if is_drive_path(raw) {
        return (Some(clean_host(&raw[..2])), decode(&raw[2..]));
    }

    if raw.contains("://") {
        if let Ok(url) = url::Url::parse(raw) {
            return match url.host_str() {
                Some(h) => split_url(h, url.path()),
                // file:///C:/x and similar: no authority, fall back on the path.
                None => split_location(url.path().trim_start_matches('/')),
            };
        }
    }

    if raw.starts_with("\\\\") || raw.starts_with("//") {
        let decoded = decode(raw);
        let segments = path_segments(&decoded);
        let host = segments.iter().take(2).cloned().collect::<Vec<_>>().join("/");
        let path = segments.iter().skip(2).cloned().collect::<Vec<_>>().join("/");
        return (Some(clean_host(&host)), path);
    }

    (None, decode(raw))
}

/// Portal URLs root at `/sites/<name>` or `/teams/<name>` when present.
fn split_url(host: &str, encoded_path: &str) -> (Option<String>, String) {
    let host = host.trim_matches(|c| c == '[' || c == ']');
    let segments: Vec<&str> = encoded_path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [kind, site, rest @ ..]
            if kind.eq_ignore_ascii_case("sites") || kind.eq_ignore_ascii_case("teams") =>
        {
            let root = format!("{host}/{kind}/{}", decode(site));
            (Some(clean_host(&root)), decode(&rest.join("/")))
        }
        _ => (Some(clean_host(host)), decode(encoded_path)),
    }
}

fn is_drive_path(raw: &str) -> bool {
    let b = raw.as_bytes();
    b.len() >= 2
        && b[0].is_ascii_alphabetic()
        && b[1] == b':'
        && (b.len() == 2 || b[2] == b'\\' || b[2] == b'/')
}

fn decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn path_segments(path: &str) -> Vec<String> {
    path.split(['/', '\\'])
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != ".")
        .map(str::to_string)
        .collect()
}

fn clean_path(path: &str) -> String {
    path_segments(path).join("/")
}

/// Hosts are case-insensitive, `/`-separated, and never contain brackets.
fn clean_host(host: &str) -> String {
    path_segments(&host.replace(['[', ']'], "")).join("/").to_lowercase()
}

fn fold(path: &str, rule: &NormalizationRule) -> String {
    if rule.case_insensitive {
        path.to_lowercase()
    } else {
        path.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
