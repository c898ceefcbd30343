use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::diagnostics::Diagnostics;
use crate::metrics::MetricsReport;

// ---------------------------------------------------------------------------
// Source method
// ---------------------------------------------------------------------------

/// Discovery method that produced a result set.
///
/// Drives both the per-method column table and the per-method
/// normalization rule. Unknown names become `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum SourceMethod {
    PatternMatch,
    AuthoritativeExportA,
    AuthoritativeExportB,
    Custom(String),
}

impl SourceMethod {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PatternMatch => "pattern_match",
            Self::AuthoritativeExportA => "authoritative_export_a",
            Self::AuthoritativeExportB => "authoritative_export_b",
            Self::Custom(name) => name,
        }
    }

    /// Lower = more authoritative.
    pub fn default_reliability_rank(&self) -> u32 {
        match self {
            Self::AuthoritativeExportA => 1,
            Self::AuthoritativeExportB => 2,
            Self::PatternMatch => 3,
            Self::Custom(_) => 5,
        }
    }
}

impl From<String> for SourceMethod {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pattern_match" | "patternmatch" => Self::PatternMatch,
            "authoritative_export_a" | "authoritativeexporta" => Self::AuthoritativeExportA,
            "authoritative_export_b" | "authoritativeexportb" => Self::AuthoritativeExportB,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<&str> for SourceMethod {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<SourceMethod> for String {
    fn from(m: SourceMethod) -> Self {
        m.as_str().to_string()
    }
}

impl std::fmt::Display for SourceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// File identity
// ---------------------------------------------------------------------------

/// Method-independent identity of a file.
///
/// Canonical text form is `[host]relative/path`; `normalize` parses that
/// form back to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    pub host: String,
    pub relative_path: String,
}

impl FileKey {
    pub fn new(host: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            relative_path: relative_path.into(),
        }
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]{}", self.host, self.relative_path)
    }
}

impl Serialize for FileKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// `(file_key, canonical_type_name)`: the unit every comparison is made on.
pub type DetectionKey = (FileKey, String);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A row as read by the loader: validated, not yet normalized or resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// 1-based data row within the source file.
    pub row: usize,
    pub raw_type_id: String,
    pub raw_location: String,
    pub confidence: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub extra: BTreeMap<String, String>,
}

/// One detection from one method, with identity and type resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub source_id: String,
    pub raw_type_id: String,
    pub canonical_type_name: String,
    pub raw_location: String,
    pub file_key: FileKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl DetectionRecord {
    pub fn new(
        source_id: &str,
        raw_type_id: &str,
        canonical_type_name: &str,
        raw_location: &str,
        file_key: FileKey,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            raw_type_id: raw_type_id.into(),
            canonical_type_name: canonical_type_name.into(),
            raw_location: raw_location.into(),
            file_key,
            confidence: None,
            timestamp: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn detection_key(&self) -> DetectionKey {
        (self.file_key.clone(), self.canonical_type_name.clone())
    }
}

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

/// All prepared records from one method. Read-only once built.
#[derive(Debug, Clone)]
pub struct SourceDataset {
    source_id: String,
    method: SourceMethod,
    reliability_rank: u32,
    loaded_at: DateTime<Utc>,
    records: Vec<DetectionRecord>,
    coverage: BTreeSet<FileKey>,
}

impl SourceDataset {
    /// Coverage is the given coverage plus every file the source flagged;
    /// a source always evaluated the files it reports on.
    pub fn new(
        source_id: &str,
        method: SourceMethod,
        reliability_rank: u32,
        records: Vec<DetectionRecord>,
        declared_coverage: BTreeSet<FileKey>,
    ) -> Self {
        let mut coverage = declared_coverage;
        coverage.extend(records.iter().map(|r| r.file_key.clone()));
        Self {
            source_id: source_id.into(),
            method,
            reliability_rank,
            loaded_at: Utc::now(),
            records,
            coverage,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn method(&self) -> &SourceMethod {
        &self.method
    }

    pub fn reliability_rank(&self) -> u32 {
        self.reliability_rank
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn records(&self) -> &[DetectionRecord] {
        &self.records
    }

    pub fn coverage(&self) -> &BTreeSet<FileKey> {
        &self.coverage
    }

    pub fn covers(&self, key: &FileKey) -> bool {
        self.coverage.contains(key)
    }

    /// Distinct `(file_key, type)` pairs this source flagged.
    pub fn flagged(&self) -> BTreeSet<DetectionKey> {
        self.records.iter().map(DetectionRecord::detection_key).collect()
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Outcome for one `(file_key, type)` across every configured source.
///
/// `not_detected` covered the file and did not flag the type;
/// `not_evaluated` never covered the file at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonResult {
    pub file_key: FileKey,
    pub canonical_type_name: String,
    pub detected_by: Vec<String>,
    pub not_detected: Vec<String>,
    pub not_evaluated: Vec<String>,
    /// Raw ids that resolved to this type, across all sources.
    pub raw_type_ids: Vec<String>,
}

impl ComparisonResult {
    pub fn is_agreement(&self) -> bool {
        self.not_detected.is_empty() && self.not_evaluated.is_empty()
    }

    pub fn detected_by_source(&self, source_id: &str) -> bool {
        self.detected_by.iter().any(|s| s == source_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub method: SourceMethod,
    pub reliability_rank: u32,
    pub loaded_at: DateTime<Utc>,
    pub record_count: usize,
    pub covered_files: usize,
    pub flagged_pairs: usize,
}

/// Flagged files no other source covered. Candidates for host aliases or
/// path-rule fixes; never merged by similarity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedFiles {
    pub source_id: String,
    pub count: usize,
    pub sample: Vec<FileKey>,
}

// ---------------------------------------------------------------------------
// Run output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ReconSummary {
    pub total_pairs: usize,
    /// Pairs flagged by every source.
    pub agreed: usize,
    /// Pairs flagged by exactly one source.
    pub single_source: usize,
    pub unmapped_identifiers: usize,
    pub skipped_rows: usize,
    pub dropped_sources: usize,
    /// Sources with no coverage file; their scope was inferred from the
    /// files they reported on, so their metrics are approximate.
    pub approximate_coverage: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconMeta {
    pub config_name: String,
    pub ground_truth: String,
    pub engine_version: String,
    pub run_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconResult {
    pub meta: ReconMeta,
    pub summary: ReconSummary,
    pub sources: Vec<SourceSummary>,
    pub metrics: MetricsReport,
    pub unmapped_identifiers: Vec<String>,
    pub unmatched_files: Vec<UnmatchedFiles>,
    pub diagnostics: Diagnostics,
    pub results: Vec<ComparisonResult>,
}
