//! Cross-source set algebra over `(file_key, canonical_type)` pairs.
//!
//! Pure: no IO, no logging side effects beyond data-quality warnings. All
//! outputs are ordered by key and source id so that the order in which
//! datasets were loaded never shows up in the result.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ReconError;
use crate::model::{
    ComparisonResult, DetectionKey, FileKey, SourceDataset, SourceSummary, UnmatchedFiles,
};

/// Max keys listed per source in the unmatched-files signal.
pub const UNMATCHED_SAMPLE: usize = 20;

/// Share of a source's flagged files that no other source covered above
/// which a data-quality warning is logged.
pub const UNMATCHED_WARN_RATIO: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub sources: Vec<SourceSummary>,
    pub results: Vec<ComparisonResult>,
    /// Effective coverage per source (declared + flagged files).
    pub coverage: BTreeMap<String, BTreeSet<FileKey>>,
    /// Flagged pairs per source.
    pub flagged: BTreeMap<String, BTreeSet<DetectionKey>>,
    pub unmatched_files: Vec<UnmatchedFiles>,
}

impl Reconciliation {
    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.source_id.as_str()).collect()
    }

    /// Every canonical type flagged by any source.
    pub fn types(&self) -> BTreeSet<&str> {
        self.results
            .iter()
            .map(|r| r.canonical_type_name.as_str())
            .collect()
    }

    /// Pairs flagged by every configured source.
    pub fn agreed(&self) -> impl Iterator<Item = &ComparisonResult> {
        let total = self.sources.len();
        self.results.iter().filter(move |r| r.detected_by.len() == total)
    }

    /// Pairs flagged by exactly one source.
    pub fn single_source(&self) -> impl Iterator<Item = &ComparisonResult> {
        self.results.iter().filter(|r| r.detected_by.len() == 1)
    }
}

#[derive(Default)]
struct PairAccumulator {
    sources: BTreeSet<String>,
    raw_ids: BTreeSet<String>,
}

pub fn reconcile(datasets: &[SourceDataset]) -> Result<Reconciliation, ReconError> {
    if datasets.len() < 2 {
        return Err(ReconError::InsufficientSources {
            usable: datasets.len(),
        });
    }

    let mut ordered: Vec<&SourceDataset> = datasets.iter().collect();
    ordered.sort_by(|a, b| a.source_id().cmp(b.source_id()));
    for pair in ordered.windows(2) {
        if pair[0].source_id() == pair[1].source_id() {
            return Err(ReconError::ConfigValidation(format!(
                "duplicate source id '{}'",
                pair[0].source_id()
            )));
        }
    }

    let mut pairs: BTreeMap<DetectionKey, PairAccumulator> = BTreeMap::new();
    for ds in &ordered {
        for record in ds.records() {
            let acc = pairs.entry(record.detection_key()).or_default();
            acc.sources.insert(ds.source_id().to_string());
            acc.raw_ids.insert(record.raw_type_id.clone());
        }
    }

    let results = pairs
        .into_iter()
        .map(|((file_key, canonical_type_name), acc)| {
            let mut detected_by = Vec::new();
            let mut not_detected = Vec::new();
            let mut not_evaluated = Vec::new();
            for ds in &ordered {
                let id = ds.source_id().to_string();
                if acc.sources.contains(&id) {
                    detected_by.push(id);
                } else if ds.covers(&file_key) {
                    not_detected.push(id);
                } else {
                    not_evaluated.push(id);
                }
            }
            ComparisonResult {
                file_key,
                canonical_type_name,
                detected_by,
                not_detected,
                not_evaluated,
                raw_type_ids: acc.raw_ids.into_iter().collect(),
            }
        })
        .collect();

    let coverage: BTreeMap<String, BTreeSet<FileKey>> = ordered
        .iter()
        .map(|ds| (ds.source_id().to_string(), ds.coverage().clone()))
        .collect();
    let flagged: BTreeMap<String, BTreeSet<DetectionKey>> = ordered
        .iter()
        .map(|ds| (ds.source_id().to_string(), ds.flagged()))
        .collect();

    let sources = ordered
        .iter()
        .map(|ds| SourceSummary {
            source_id: ds.source_id().to_string(),
            method: ds.method().clone(),
            reliability_rank: ds.reliability_rank(),
            loaded_at: ds.loaded_at(),
            record_count: ds.records().len(),
            covered_files: ds.coverage().len(),
            flagged_pairs: flagged[ds.source_id()].len(),
        })
        .collect();

    let unmatched_files = unmatched_files(&ordered, &coverage);

    Ok(Reconciliation {
        sources,
        results,
        coverage,
        flagged,
        unmatched_files,
    })
}

/// Files a source flagged that no other source covered. These never match
/// anything, so large counts usually mean a missing host alias or path rule.
fn unmatched_files(
    ordered: &[&SourceDataset],
    coverage: &BTreeMap<String, BTreeSet<FileKey>>,
) -> Vec<UnmatchedFiles> {
    let mut out = Vec::new();
    for ds in ordered {
        let flagged_files: BTreeSet<&FileKey> = ds.records().iter().map(|r| &r.file_key).collect();
        let orphans: Vec<FileKey> = flagged_files
            .iter()
            .filter(|key| {
                coverage
                    .iter()
                    .filter(|(id, _)| id.as_str() != ds.source_id())
                    .all(|(_, cov)| !cov.contains(**key))
            })
            .map(|key| (*key).clone())
            .collect();

        if orphans.is_empty() {
            continue;
        }

        let ratio = orphans.len() as f64 / flagged_files.len() as f64;
        if ratio > UNMATCHED_WARN_RATIO {
            tracing::warn!(
                source = ds.source_id(),
                unmatched = orphans.len(),
                flagged = flagged_files.len(),
                "most flagged files are not covered by any other source; check host aliases and path rules"
            );
        }

        out.push(UnmatchedFiles {
            source_id: ds.source_id().to_string(),
            count: orphans.len(),
            sample: orphans.into_iter().take(UNMATCHED_SAMPLE).collect(),
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
