//! Type identifier resolution.
//!
//! Precedence: `UserSupplied` > `AuthoritativeQuery` > `CachedFile`. The
//! table is filled once, before any source loads, and is read-only after
//! that. Resolution is total: unknown ids become `Unmapped:<id>`.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::config::TypesConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind};

pub const UNMAPPED_PREFIX: &str = "Unmapped:";

pub type LookupError = Box<dyn std::error::Error + Send + Sync>;

/// Live source of `raw id -> canonical name` mappings, queried once per run.
///
/// Implementations may block; the resolver runs them on a worker thread and
/// stops waiting after its timeout.
pub trait AuthoritativeSource: Send + 'static {
    fn describe(&self) -> String {
        "authoritative catalog".into()
    }

    fn fetch_mappings(&self) -> Result<Vec<(String, String)>, LookupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeOrigin {
    AuthoritativeQuery,
    CachedFile,
    UserSupplied,
}

impl TypeOrigin {
    fn precedence(self) -> u8 {
        match self {
            Self::CachedFile => 1,
            Self::AuthoritativeQuery => 2,
            Self::UserSupplied => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeMapping {
    pub raw_id: String,
    pub canonical_name: String,
    pub origin: TypeOrigin,
}

/// Result of resolving one raw id. `origin` is `None` for placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub name: String,
    pub origin: Option<TypeOrigin>,
}

impl Resolved {
    pub fn is_mapped(&self) -> bool {
        self.origin.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeResolver {
    entries: HashMap<String, TypeMapping>,
    /// Folded canonical name -> canonical name and its origin, for sources
    /// that emit names.
    names: HashMap<String, (String, TypeOrigin)>,
}

fn fold(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn placeholder(raw_id: &str) -> String {
    format!("{UNMAPPED_PREFIX}{}", raw_id.trim())
}

pub fn is_placeholder(name: &str) -> bool {
    name.starts_with(UNMAPPED_PREFIX)
}

impl TypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table for a run: cache file, operator overrides, then the
    /// optional live lookup. Never fails; problems come back as diagnostics.
    pub fn build(
        types: &TypesConfig,
        base_dir: &Path,
        authoritative: Option<Box<dyn AuthoritativeSource>>,
    ) -> (Self, Vec<Diagnostic>) {
        let mut resolver = Self::new();
        let mut diagnostics = Vec::new();

        if let Some(ref cache) = types.cache {
            if let Some(diag) = resolver.load_cache_file(&base_dir.join(cache)) {
                diagnostics.push(diag);
            }
        }

        resolver.insert_all(
            types.overrides.iter().map(|(k, v)| (k.clone(), v.clone())),
            TypeOrigin::UserSupplied,
        );

        if let (Some(source), Some(auth)) = (authoritative, types.authoritative.as_ref()) {
            let timeout = Duration::from_millis(auth.timeout_ms);
            if let Err(diag) = resolver.merge_authoritative(source, timeout) {
                diagnostics.push(diag);
            }
        }

        (resolver, diagnostics)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mapping(&self, raw_id: &str) -> Option<&TypeMapping> {
        self.entries.get(&fold(raw_id))
    }

    /// Insert unless an entry of higher precedence already owns the key.
    /// Returns whether the entry was stored.
    pub fn insert(&mut self, raw_id: &str, canonical_name: &str, origin: TypeOrigin) -> bool {
        let stored = self.insert_unindexed(raw_id, canonical_name, origin);
        if stored {
            self.reindex();
        }
        stored
    }

    pub fn insert_all(
        &mut self,
        entries: impl IntoIterator<Item = (String, String)>,
        origin: TypeOrigin,
    ) -> usize {
        let stored = entries
            .into_iter()
            .filter(|(raw, name)| self.insert_unindexed(raw, name, origin))
            .count();
        self.reindex();
        stored
    }

    fn insert_unindexed(&mut self, raw_id: &str, canonical_name: &str, origin: TypeOrigin) -> bool {
        let key = fold(raw_id);
        let name = canonical_name.trim();
        if key.is_empty() || name.is_empty() {
            return false;
        }
        if let Some(existing) = self.entries.get(&key) {
            if existing.origin.precedence() > origin.precedence() {
                return false;
            }
        }
        self.entries.insert(
            key,
            TypeMapping {
                raw_id: raw_id.trim().to_string(),
                canonical_name: name.to_string(),
                origin,
            },
        );
        true
    }

    /// Names that differ only by case keep the spelling from the highest
    /// precedence entry, ties broken by raw id.
    fn reindex(&mut self) {
        let mut ranked: Vec<&TypeMapping> = self.entries.values().collect();
        ranked.sort_by(|a, b| {
            b.origin
                .precedence()
                .cmp(&a.origin.precedence())
                .then_with(|| a.raw_id.cmp(&b.raw_id))
        });

        let mut names = HashMap::with_capacity(ranked.len());
        for m in ranked {
            names
                .entry(fold(&m.canonical_name))
                .or_insert_with(|| (m.canonical_name.clone(), m.origin));
        }
        self.names = names;
    }

    /// Load the cached mapping file. Missing or empty files are fine; a
    /// malformed file is reported and ignored.
    pub fn load_cache_file(&mut self, path: &Path) -> Option<Diagnostic> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("type cache {} not found, continuing without it", path.display());
                return None;
            }
            Err(e) => {
                return Some(Diagnostic::new(
                    DiagnosticKind::CacheUnreadable,
                    format!("cannot read type cache {}: {e}", path.display()),
                ));
            }
        };

        match parse_cache(&data) {
            Ok(entries) => {
                let stored = self.insert_all(entries, TypeOrigin::CachedFile);
                tracing::info!(entries = stored, "loaded type cache {}", path.display());
                None
            }
            Err(msg) => {
                tracing::warn!("ignoring type cache {}: {msg}", path.display());
                Some(Diagnostic::new(
                    DiagnosticKind::CacheUnreadable,
                    format!("{}: {msg}", path.display()),
                ))
            }
        }
    }

    /// Query the live source once, waiting at most `timeout`. On failure the
    /// table is left untouched (cache-only mode).
    pub fn merge_authoritative(
        &mut self,
        source: Box<dyn AuthoritativeSource>,
        timeout: Duration,
    ) -> Result<usize, Diagnostic> {
        let label = source.describe();
        let (tx, rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("type-lookup".into())
            .spawn(move || {
                let _ = tx.send(source.fetch_mappings());
            });
        if let Err(e) = spawned {
            return Err(Diagnostic::new(
                DiagnosticKind::AuthoritativeLookupFailed,
                format!("{label}: cannot start lookup: {e}"),
            ));
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(entries)) => {
                let stored = self.insert_all(entries, TypeOrigin::AuthoritativeQuery);
                tracing::info!(entries = stored, "merged mappings from {label}");
                Ok(stored)
            }
            Ok(Err(e)) => {
                tracing::warn!("{label} lookup failed, using cached mappings only: {e}");
                Err(Diagnostic::new(
                    DiagnosticKind::AuthoritativeLookupFailed,
                    format!("{label}: {e}"),
                ))
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "{label} lookup exceeded {}ms, using cached mappings only",
                    timeout.as_millis()
                );
                Err(Diagnostic::new(
                    DiagnosticKind::AuthoritativeLookupTimeout,
                    format!("{label}: no response within {}ms", timeout.as_millis()),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Diagnostic::new(
                DiagnosticKind::AuthoritativeLookupFailed,
                format!("{label}: lookup thread exited without a result"),
            )),
        }
    }

    pub fn resolve(&self, raw_id: &str) -> Resolved {
        if let Some(m) = self.mapping(raw_id) {
            return Resolved {
                name: m.canonical_name.clone(),
                origin: Some(m.origin),
            };
        }
        if let Some((name, origin)) = self.names.get(&fold(raw_id)) {
            return Resolved {
                name: name.clone(),
                origin: Some(*origin),
            };
        }
        Resolved {
            name: placeholder(raw_id),
            origin: None,
        }
    }

    /// Resolve and record unmapped ids for the run report.
    pub fn resolve_tracking(&self, raw_id: &str, unmapped: &mut BTreeSet<String>) -> String {
        let resolved = self.resolve(raw_id);
        if !resolved.is_mapped() {
            unmapped.insert(raw_id.trim().to_string());
        }
        resolved.name
    }
}

/// Accepts `{"mappings": {...}}` or a bare `{raw: name}` object. Non-string
/// values are skipped.
pub fn parse_cache(data: &str) -> Result<Vec<(String, String)>, String> {
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    let root: Value = serde_json::from_str(data).map_err(|e| format!("invalid JSON: {e}"))?;
    let obj = root.as_object().ok_or("expected a JSON object")?;
    let map = match obj.get("mappings") {
        Some(Value::Object(inner)) => inner,
        Some(_) => return Err("\"mappings\" must be an object".into()),
        None => obj,
    };
    Ok(map
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|name| (k.clone(), name.to_string())))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SSN_GUID: &str = "a44669fe-0d48-453d-a9b1-2cc83f2cba77";
    const SSN: &str = "U.S. Social Security Number (SSN)";

    struct Fixed(Vec<(String, String)>);

    impl AuthoritativeSource for Fixed {
        fn fetch_mappings(&self) -> Result<Vec<(String, String)>, LookupError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl AuthoritativeSource for Failing {
        fn fetch_mappings(&self) -> Result<Vec<(String, String)>, LookupError> {
            Err("HTTP 503".into())
        }
    }

    struct Hung(Duration);

    impl AuthoritativeSource for Hung {
        fn fetch_mappings(&self) -> Result<Vec<(String, String)>, LookupError> {
            thread::sleep(self.0);
            Ok(vec![("late".into(), "Late".into())])
        }
    }

    fn write_cache(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("type-map.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn cache_entry_resolves_exact_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cache(
            dir.path(),
            &format!(r#"{{"mappings": {{"{SSN_GUID}": "{SSN}"}}}}"#),
        );
        let mut r = TypeResolver::new();
        assert!(r.load_cache_file(&path).is_none());
        let resolved = r.resolve(SSN_GUID);
        assert_eq!(resolved.name, SSN);
        assert_eq!(resolved.origin, Some(TypeOrigin::CachedFile));
        // GUIDs are case-insensitive.
        assert_eq!(r.resolve(&SSN_GUID.to_uppercase()).name, SSN);
    }

    #[test]
    fn unknown_id_becomes_placeholder() {
        let r = TypeResolver::new();
        let mut unmapped = BTreeSet::new();
        let name = r.resolve_tracking(" 0e9b3178-9678-47dd-a509-37222ca96b42 ", &mut unmapped);
        assert_eq!(name, "Unmapped:0e9b3178-9678-47dd-a509-37222ca96b42");
        assert!(unmapped.contains("0e9b3178-9678-47dd-a509-37222ca96b42"));
        assert!(is_placeholder(&name));
    }

    #[test]
    fn canonical_name_resolves_to_itself() {
        let mut r = TypeResolver::new();
        r.insert(SSN_GUID, SSN, TypeOrigin::CachedFile);
        let resolved = r.resolve("u.s. social security number (ssn)");
        assert_eq!(resolved.name, SSN);
        assert!(resolved.is_mapped());
    }

    #[test]
    fn precedence_rules() {
        let mut r = TypeResolver::new();
        assert!(r.insert("x", "Cached", TypeOrigin::CachedFile));
        assert!(r.insert("x", "Live", TypeOrigin::AuthoritativeQuery));
        assert!(!r.insert("x", "Cached again", TypeOrigin::CachedFile));
        assert_eq!(r.resolve("x").name, "Live");

        assert!(r.insert("y", "Operator", TypeOrigin::UserSupplied));
        assert!(!r.insert("y", "Live", TypeOrigin::AuthoritativeQuery));
        assert_eq!(r.resolve("y").name, "Operator");
        assert!(!r.insert("z", "  ", TypeOrigin::CachedFile));
    }

    #[test]
    fn case_variant_names_resolve_deterministically() {
        let mut r = TypeResolver::new();
        r.insert("guid-a", "credit card number", TypeOrigin::CachedFile);
        r.insert("guid-b", "Credit Card Number", TypeOrigin::UserSupplied);
        r.insert("guid-c", "CREDIT CARD NUMBER", TypeOrigin::AuthoritativeQuery);
        let resolved = r.resolve("Credit card NUMBER");
        assert_eq!(resolved.name, "Credit Card Number");
        assert_eq!(resolved.origin, Some(TypeOrigin::UserSupplied));
        assert_eq!(r.mapping(" GUID-B ").unwrap().origin, TypeOrigin::UserSupplied);

        // Same precedence: the lowest raw id wins, whatever the insert order.
        let forward: Vec<(&str, &str)> = vec![("id-2", "Bank Account"), ("id-1", "BANK ACCOUNT")];
        let mut backward = forward.clone();
        backward.reverse();
        for order in [forward, backward] {
            let mut r = TypeResolver::new();
            r.insert_all(
                order.into_iter().map(|(k, v)| (k.to_string(), v.to_string())),
                TypeOrigin::CachedFile,
            );
            assert_eq!(r.resolve("bank account").name, "BANK ACCOUNT");
        }
    }

    #[test]
    fn missing_cache_is_silent_malformed_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = TypeResolver::new();
        assert!(r.load_cache_file(&dir.path().join("absent.json")).is_none());
        let empty = write_cache(dir.path(), "   ");
        assert!(r.load_cache_file(&empty).is_none());
        let bad = write_cache(dir.path(), "[1, 2]");
        let diag = r.load_cache_file(&bad).unwrap();
        assert_eq!(diag.kind, DiagnosticKind::CacheUnreadable);
        assert!(r.is_empty());
    }

    #[test]
    fn bare_object_cache() {
        let entries = parse_cache(r#"{"a": "A", "b": 3}"#).unwrap();
        assert_eq!(entries, vec![("a".to_string(), "A".to_string())]);
        assert!(parse_cache(r#"{"mappings": []}"#).is_err());
    }

    #[test]
    fn authoritative_merge_respects_user_entries() {
        let mut r = TypeResolver::new();
        r.insert("a", "Cached A", TypeOrigin::CachedFile);
        r.insert("b", "Operator B", TypeOrigin::UserSupplied);
        let source = Fixed(vec![
            ("a".into(), "Live A".into()),
            ("b".into(), "Live B".into()),
            ("c".into(), "Live C".into()),
        ]);
        let stored = r.merge_authoritative(Box::new(source), Duration::from_secs(5)).unwrap();
        assert_eq!(stored, 2);
        assert_eq!(r.resolve("a").name, "Live A");
        assert_eq!(r.resolve("b").name, "Operator B");
        assert_eq!(r.resolve("c").origin, Some(TypeOrigin::AuthoritativeQuery));
    }

    #[test]
    fn failed_lookup_keeps_cache() {
        let mut r = TypeResolver::new();
        r.insert("a", "Cached A", TypeOrigin::CachedFile);
        let diag = r.merge_authoritative(Box::new(Failing), Duration::from_secs(5)).unwrap_err();
        assert_eq!(diag.kind, DiagnosticKind::AuthoritativeLookupFailed);
        assert!(diag.message.contains("503"));
        assert_eq!(r.resolve("a").name, "Cached A");
    }

    #[test]
    fn hung_lookup_times_out() {
        let mut r = TypeResolver::new();
        let started = std::time::Instant::now();
        let diag = r
            .merge_authoritative(Box::new(Hung(Duration::from_secs(5))), Duration::from_millis(50))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(diag.kind, DiagnosticKind::AuthoritativeLookupTimeout);
        assert!(!r.resolve("late").is_mapped());
    }

    #[test]
    fn build_from_config() {
        let dir = tempfile::tempdir().unwrap();
        write_cache(dir.path(), r#"{"g1": "Cached One", "g2": "Cached Two"}"#);
        let types = TypesConfig {
            cache: Some("type-map.json".into()),
            overrides: [("g2".to_string(), "Operator Two".to_string())].into_iter().collect(),
            authoritative: None,
        };
        let (r, diags) = TypeResolver::build(&types, dir.path(), None);
        assert!(diags.is_empty());
        assert_eq!(r.resolve("g1").name, "Cached One");
        assert_eq!(r.resolve("g2").name, "Operator Two");
        assert_eq!(r.len(), 2);
    }

    proptest! {
        #[test]
        fn resolution_is_total(raw in ".{0,40}") {
            let mut r = TypeResolver::new();
            r.insert(SSN_GUID, SSN, TypeOrigin::CachedFile);
            let name = r.resolve(&raw).name;
            prop_assert!(!name.is_empty());
        }
    }
}
