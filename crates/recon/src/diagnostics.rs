//! Recoverable run diagnostics.
//!
//! Nothing in here aborts a run. Every entry ends up in the diagnostics
//! section of the summary so operators can fix data quality between runs.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Source file missing or unparseable, dropped from the run.
    SourceUnavailable,
    /// Row missing a required field, skipped.
    MalformedRecord,
    /// Raw type id with no mapping, resolved to the `Unmapped:` placeholder.
    UnresolvedIdentifier,
    /// Catalog lookup exceeded its timeout.
    AuthoritativeLookupTimeout,
    /// Catalog lookup returned an error.
    AuthoritativeLookupFailed,
    /// Type cache file present but malformed.
    CacheUnreadable,
    /// Source has no coverage file; scope inferred from its own records.
    CoverageNotDeclared,
}

impl std::fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceUnavailable => write!(f, "source_unavailable"),
            Self::MalformedRecord => write!(f, "malformed_record"),
            Self::UnresolvedIdentifier => write!(f, "unresolved_identifier"),
            Self::AuthoritativeLookupTimeout => write!(f, "authoritative_lookup_timeout"),
            Self::AuthoritativeLookupFailed => write!(f, "authoritative_lookup_failed"),
            Self::CacheUnreadable => write!(f, "cache_unreadable"),
            Self::CoverageNotDeclared => write!(f, "coverage_not_declared"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// 1-based data row (header excluded) for row-level issues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            source_id: None,
            row: None,
            message: message.into(),
        }
    }

    pub fn for_source(mut self, source_id: &str) -> Self {
        self.source_id = Some(source_id.to_string());
        self
    }

    pub fn at_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }
}

/// Accumulated diagnostics for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Diagnostic>) {
        self.entries.extend(other);
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|d| d.kind == kind).count()
    }

    pub fn has(&self, kind: DiagnosticKind) -> bool {
        self.entries.iter().any(|d| d.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deterministic order for reports, independent of load order.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            (a.kind, &a.source_id, a.row, &a.message).cmp(&(
                b.kind,
                &b.source_id,
                b.row,
                &b.message,
            ))
        });
    }
}
