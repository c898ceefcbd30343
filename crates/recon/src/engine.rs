use std::collections::BTreeSet;
use std::path::Path;

use rayon::prelude::*;

use crate::config::{FilterConfig, RunConfig};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::ReconError;
use crate::loader::{self, LoadedSource};
use crate::metrics::compute_metrics;
use crate::model::{
    DetectionRecord, FileKey, ReconMeta, ReconResult, ReconSummary, SourceDataset,
};
use crate::normalize::{normalize_all, NormalizerTable};
use crate::reconcile::reconcile;
use crate::resolver::{AuthoritativeSource, TypeResolver};

/// Result of one run plus whether it was degraded.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: ReconResult,
    /// Rows were skipped or a source was dropped; the result is still
    /// complete for the data that loaded.
    pub partial: bool,
}

/// Run one reconciliation. Relative paths in `config` resolve against
/// `base_dir`.
pub fn run(
    config: &RunConfig,
    base_dir: &Path,
    authoritative: Option<Box<dyn AuthoritativeSource>>,
) -> Result<RunOutcome, ReconError> {
    config.validate()?;

    let mut diagnostics = Diagnostics::default();

    // Type table is complete before any loader starts.
    let (resolver, resolver_diags) = TypeResolver::build(&config.types, base_dir, authoritative);
    diagnostics.extend(resolver_diags);
    tracing::debug!(mappings = resolver.len(), "type resolver ready");

    let table = NormalizerTable::from_config(config);

    let entries: Vec<_> = config.sources.iter().collect();
    let attempts: Vec<(String, Result<LoadedSource, ReconError>)> = entries
        .par_iter()
        .map(|(id, source)| ((*id).clone(), loader::load(id, source, base_dir)))
        .collect();

    let mut loaded = Vec::new();
    let mut dropped = Vec::new();
    for (id, attempt) in attempts {
        match attempt {
            Ok(source) => loaded.push(source),
            Err(ReconError::SourceUnavailable { source_id, reason }) => {
                tracing::warn!(source = %source_id, "dropping source: {reason}");
                diagnostics.push(
                    Diagnostic::new(DiagnosticKind::SourceUnavailable, reason.clone())
                        .for_source(&source_id),
                );
                dropped.push((id, reason));
            }
            Err(e) => return Err(e),
        }
    }

    if loaded.len() < 2 {
        return Err(ReconError::InsufficientSources {
            usable: loaded.len(),
        });
    }
    if let Some((_, reason)) = dropped.iter().find(|(id, _)| *id == config.ground_truth) {
        return Err(ReconError::SourceUnavailable {
            source_id: config.ground_truth.clone(),
            reason: reason.clone(),
        });
    }

    let mut skipped_rows = 0;
    let mut approximate_coverage = Vec::new();
    for source in &mut loaded {
        skipped_rows += source.skipped_rows();
        diagnostics.extend(std::mem::take(&mut source.diagnostics));
        if source.coverage.is_none() {
            tracing::warn!(
                source = %source.source_id,
                "no coverage file; files this source never reported are treated as not evaluated"
            );
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticKind::CoverageNotDeclared,
                    "no coverage file given; coverage inferred from reported files, \
                     metrics are approximate",
                )
                .for_source(&source.source_id),
            );
            approximate_coverage.push(source.source_id.clone());
        }
    }
    approximate_coverage.sort();

    let prepared: Vec<(SourceDataset, BTreeSet<String>)> = loaded
        .into_par_iter()
        .map(|source| prepare(source, &table, &resolver, &config.filters))
        .collect();

    let mut unmapped = BTreeSet::new();
    let mut datasets = Vec::with_capacity(prepared.len());
    for (dataset, ids) in prepared {
        unmapped.extend(ids);
        datasets.push(dataset);
    }

    for id in &unmapped {
        diagnostics.push(Diagnostic::new(
            DiagnosticKind::UnresolvedIdentifier,
            format!("no mapping for '{id}', reported as Unmapped:{id}"),
        ));
    }
    if !unmapped.is_empty() {
        tracing::warn!(count = unmapped.len(), "unmapped type identifiers");
    }

    let recon = reconcile(&datasets)?;
    let metrics = compute_metrics(&recon, &config.ground_truth)?;
    diagnostics.sort();

    let summary = ReconSummary {
        total_pairs: recon.results.len(),
        agreed: recon.agreed().count(),
        single_source: recon.single_source().count(),
        unmapped_identifiers: unmapped.len(),
        skipped_rows,
        dropped_sources: dropped.len(),
        approximate_coverage,
    };
    let partial = skipped_rows > 0 || !dropped.is_empty();

    tracing::info!(
        pairs = summary.total_pairs,
        agreed = summary.agreed,
        skipped_rows,
        dropped = summary.dropped_sources,
        "reconciliation complete"
    );

    Ok(RunOutcome {
        result: ReconResult {
            meta: ReconMeta {
                config_name: config.name.clone(),
                ground_truth: config.ground_truth.clone(),
                engine_version: env!("CARGO_PKG_VERSION").to_string(),
                run_at: chrono::Utc::now().to_rfc3339(),
            },
            summary,
            sources: recon.sources,
            metrics,
            unmapped_identifiers: unmapped.into_iter().collect(),
            unmatched_files: recon.unmatched_files,
            diagnostics,
            results: recon.results,
        },
        partial,
    })
}

/// Normalize, resolve and filter one loaded source, then freeze it.
/// Returns the raw ids that had no mapping.
fn prepare(
    source: LoadedSource,
    table: &NormalizerTable,
    resolver: &TypeResolver,
    filters: &FilterConfig,
) -> (SourceDataset, BTreeSet<String>) {
    let host = source.host.as_deref();
    let mut unmapped = BTreeSet::new();

    let total = source.records.len();
    let all: Vec<DetectionRecord> = source
        .records
        .into_iter()
        .map(|raw| {
            let canonical = resolver.resolve_tracking(&raw.raw_type_id, &mut unmapped);
            let file_key = table.normalize_with_host(&raw.raw_location, &source.method, host);
            DetectionRecord {
                source_id: source.source_id.clone(),
                raw_type_id: raw.raw_type_id,
                canonical_type_name: canonical,
                raw_location: raw.raw_location,
                file_key,
                confidence: raw.confidence,
                timestamp: raw.timestamp,
                extra: raw.extra,
            }
        })
        .collect();

    // Without a coverage file, the implied scope is every file the source
    // reported on, taken before type and confidence filters drop records.
    let coverage: BTreeSet<FileKey> = match source.coverage.as_ref() {
        Some(locations) => normalize_all(table, locations, &source.method, host)
            .into_iter()
            .filter(|key| in_prefixes(&key.to_string(), &filters.path_prefixes))
            .collect(),
        None => all
            .iter()
            .map(|r| r.file_key.clone())
            .filter(|key| in_prefixes(&key.to_string(), &filters.path_prefixes))
            .collect(),
    };

    let records: Vec<DetectionRecord> = if filters.is_empty() {
        all
    } else {
        all.into_iter().filter(|r| passes(r, filters)).collect()
    };

    if records.len() < total {
        tracing::debug!(
            source = %source.source_id,
            kept = records.len(),
            filtered = total - records.len(),
            "filters applied"
        );
    }

    let dataset = SourceDataset::new(
        &source.source_id,
        source.method,
        source.reliability_rank,
        records,
        coverage,
    );
    (dataset, unmapped)
}

fn passes(record: &DetectionRecord, filters: &FilterConfig) -> bool {
    if !filters.types.is_empty() {
        let wanted = filters.types.iter().any(|t| {
            let t = t.trim();
            t.eq_ignore_ascii_case(&record.canonical_type_name)
                || t.eq_ignore_ascii_case(record.raw_type_id.trim())
        });
        if !wanted {
            return false;
        }
    }

    if !in_prefixes(&record.file_key.to_string(), &filters.path_prefixes) {
        return false;
    }

    match (filters.min_confidence, record.confidence) {
        (Some(min), Some(c)) => c >= min,
        _ => true,
    }
}

fn in_prefixes(key: &str, prefixes: &[String]) -> bool {
    prefixes.is_empty() || prefixes.iter().any(|p| key.starts_with(p.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::model::SourceMethod;
    use crate::resolver::LookupError;
    use std::fs;

    struct FixedCatalog;

    impl AuthoritativeSource for FixedCatalog {
        fn fetch_mappings(&self) -> Result<Vec<(String, String)>, LookupError> {
            Ok(vec![("sit-1".into(), "Credit Card Number".into())])
        }
    }

    fn two_source_config(dir: &Path) -> RunConfig {
        fs::write(
            dir.join("local.csv"),
            "Location,Sensitive type,Confidence\n\
             C:\\share\\a.txt,SSN,high\n\
             C:\\share\\b.txt,Credit Card Number,0.3\n",
        )
        .unwrap();
        fs::write(
            dir.join("cloud.csv"),
            "FileUrl,SensitiveInfoTypeId\n\
             file:///C:/share/a.txt,ssn\n\
             file:///C:/share/b.txt,sit-1\n",
        )
        .unwrap();
        RunConfig::from_sources(
            "cloud",
            [
                ("local".to_string(), SourceConfig::new(SourceMethod::PatternMatch, "local.csv")),
                (
                    "cloud".to_string(),
                    SourceConfig::new(SourceMethod::AuthoritativeExportA, "cloud.csv"),
                ),
            ],
        )
    }

    #[test]
    fn end_to_end_agreement() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = two_source_config(dir.path());
        config.types.overrides.insert("SSN".into(), "U.S. Social Security Number (SSN)".into());
        config.types.authoritative = Some(crate::config::AuthoritativeConfig {
            endpoint: "test://catalog".into(),
            timeout_ms: 1_000,
            token_env: None,
        });

        let outcome = run(&config, dir.path(), Some(Box::new(FixedCatalog))).unwrap();
        assert!(!outcome.partial);
        let r = &outcome.result;
        assert_eq!(r.summary.total_pairs, 2);
        assert_eq!(r.summary.agreed, 2);
        assert!(r.unmapped_identifiers.is_empty());
        let local = r.metrics.source("local").unwrap();
        assert_eq!(local.precision, Some(1.0));
        assert_eq!(local.recall, Some(1.0));
    }

    #[test]
    fn filters_apply_before_reconciliation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = two_source_config(dir.path());
        config.types.overrides.insert("SSN".into(), "SSN".into());
        config.types.overrides.insert("Credit Card Number".into(), "Credit Card Number".into());
        config.filters.min_confidence = Some(0.5);

        let outcome = run(&config, dir.path(), None).unwrap();
        let r = &outcome.result;
        // b.txt dropped from local (confidence 0.3), cloud's b.txt stays.
        let local_flagged = r
            .sources
            .iter()
            .find(|s| s.source_id == "local")
            .unwrap()
            .flagged_pairs;
        assert_eq!(local_flagged, 1);
        // "sit-1" has no mapping without the catalog.
        assert_eq!(r.unmapped_identifiers, vec!["sit-1"]);
        assert!(r.diagnostics.has(DiagnosticKind::UnresolvedIdentifier));
    }

    #[test]
    fn filtered_records_stay_in_implied_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = two_source_config(dir.path());
        config.types.overrides.insert("SSN".into(), "SSN".into());
        config.types.overrides.insert("sit-1".into(), "Credit Card Number".into());
        config.filters.min_confidence = Some(0.5);

        let outcome = run(&config, dir.path(), None).unwrap();
        let r = &outcome.result;
        let card = r
            .results
            .iter()
            .find(|c| c.canonical_type_name == "Credit Card Number")
            .unwrap();
        // local reported b.txt below the threshold: evaluated, not missing.
        assert_eq!(card.not_detected, vec!["local"]);
        assert!(card.not_evaluated.is_empty());

        let local = r.metrics.source("local").unwrap();
        assert_eq!(local.counts.true_positive, 1);
        assert_eq!(local.counts.false_negative, 1);
        assert_eq!(local.recall, Some(0.5));
    }

    #[test]
    fn undeclared_coverage_is_reported_as_approximate() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("truth.csv"),
            "Location,Sensitive type\nshare/x.txt,SSN\nshare/y.txt,SSN\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("scan.csv"),
            "Location,Sensitive type\nshare/z.txt,CreditCard\n",
        )
        .unwrap();
        let config = RunConfig::from_sources(
            "truth",
            [
                ("truth".to_string(), SourceConfig::new(SourceMethod::PatternMatch, "truth.csv")),
                ("scan".to_string(), SourceConfig::new(SourceMethod::PatternMatch, "scan.csv")),
            ],
        );

        let outcome = run(&config, dir.path(), None).unwrap();
        let r = &outcome.result;
        assert_eq!(r.diagnostics.count(DiagnosticKind::CoverageNotDeclared), 2);
        assert_eq!(r.summary.approximate_coverage, vec!["scan", "truth"]);
        let scan = r.metrics.source("scan").unwrap();
        assert_eq!(scan.shared_files, 0);
        assert_eq!(scan.recall, None);

        // Declaring coverage turns the missed SSNs into false negatives.
        fs::write(dir.path().join("scan-cov.txt"), "share/x.txt\nshare/y.txt\nshare/z.txt\n")
            .unwrap();
        let mut config = config;
        config.sources.get_mut("scan").unwrap().coverage = Some("scan-cov.txt".into());
        let outcome = run(&config, dir.path(), None).unwrap();
        let r = &outcome.result;
        assert_eq!(r.summary.approximate_coverage, vec!["truth"]);
        let scan = r.metrics.source("scan").unwrap();
        assert_eq!(scan.counts.false_negative, 2);
        assert_eq!(scan.recall, Some(0.0));
    }

    #[test]
    fn missing_source_is_dropped_when_two_remain() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = two_source_config(dir.path());
        config
            .sources
            .insert("ghost".into(), SourceConfig::new(SourceMethod::PatternMatch, "nope.csv"));

        let outcome = run(&config, dir.path(), None).unwrap();
        assert!(outcome.partial);
        assert_eq!(outcome.result.summary.dropped_sources, 1);
        assert!(outcome.result.diagnostics.has(DiagnosticKind::SourceUnavailable));
        assert_eq!(outcome.result.sources.len(), 2);
    }

    #[test]
    fn dropping_below_two_sources_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = two_source_config(dir.path());
        fs::remove_file(dir.path().join("local.csv")).unwrap();
        let err = run(&config, dir.path(), None).unwrap_err();
        assert!(matches!(err, ReconError::InsufficientSources { usable: 1 }));
    }

    #[test]
    fn dropped_ground_truth_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = two_source_config(dir.path());
        config
            .sources
            .insert("third".into(), SourceConfig::new(SourceMethod::PatternMatch, "local.csv"));
        fs::remove_file(dir.path().join("cloud.csv")).unwrap();
        let err = run(&config, dir.path(), None).unwrap_err();
        assert!(matches!(
            err,
            ReconError::SourceUnavailable { ref source_id, .. } if source_id == "cloud"
        ));
    }
}
