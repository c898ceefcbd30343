use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossdetect_recon::config::{AuthoritativeConfig, RunConfig, SourceConfig};
use crossdetect_recon::diagnostics::DiagnosticKind;
use crossdetect_recon::model::SourceMethod;
use crossdetect_recon::report::{generate, ReportOptions};
use crossdetect_recon::resolver::{AuthoritativeSource, LookupError, TypeResolver};
use crossdetect_recon::{run, ReconError, RunOutcome};

const SSN: &str = "U.S. Social Security Number (SSN)";
const UNMAPPED_GUID: &str = "deadbeef-0000-4000-8000-000000000001";

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture_config() -> RunConfig {
    let toml = std::fs::read_to_string(fixtures_dir().join("q3-finance.recon.toml")).unwrap();
    RunConfig::from_toml(&toml).unwrap()
}

fn run_fixture() -> RunOutcome {
    run(&fixture_config(), &fixtures_dir(), None).unwrap()
}

fn close(actual: Option<f64>, expected: f64) -> bool {
    actual.is_some_and(|v| (v - expected).abs() < 1e-9)
}

// -------------------------------------------------------------------------
// Full fixture run
// -------------------------------------------------------------------------

#[test]
fn unc_and_portal_locations_align() {
    let outcome = run_fixture();
    let r = &outcome.result;

    let payroll = r
        .results
        .iter()
        .find(|c| c.file_key.relative_path == "q3/payroll.xlsx")
        .expect("payroll pair");
    assert_eq!(payroll.file_key.host, "contoso.sharepoint.com/sites/finance");
    assert_eq!(payroll.canonical_type_name, SSN);
    assert_eq!(payroll.detected_by, vec!["local", "purview"]);
    assert!(payroll.is_agreement());
}

#[test]
fn metrics_against_ground_truth() {
    let outcome = run_fixture();
    let m = &outcome.result.metrics;
    assert_eq!(m.ground_truth, "purview");
    assert_eq!(m.type_universe, 3);

    let local = m.source("local").unwrap();
    // payroll, customers, notes, hr/ssn-list are covered by both.
    assert_eq!(local.shared_files, 4);
    assert_eq!(local.counts.true_positive, 2);
    // notes.docx: local flagged a card number the ground truth did not.
    assert_eq!(local.counts.false_positive, 1);
    // hr/ssn-list.txt: local opened the file and missed the SSN.
    assert_eq!(local.counts.false_negative, 1);
    assert_eq!(local.counts.true_negative, 8);
    assert!(close(local.precision, 2.0 / 3.0));
    assert!(close(local.recall, 2.0 / 3.0));
    assert!(close(local.accuracy, 10.0 / 12.0));

    let pair = m.agreement("local", "purview").unwrap();
    assert_eq!(pair.intersection, 2);
    assert_eq!(pair.union, 5);
    assert!(close(pair.rate, 0.4));
}

#[test]
fn archive_file_only_purview_covered_is_signalled() {
    let outcome = run_fixture();
    let unmatched = &outcome.result.unmatched_files;
    assert_eq!(unmatched.len(), 1);
    assert_eq!(unmatched[0].source_id, "purview");
    assert_eq!(unmatched[0].count, 1);
    assert_eq!(unmatched[0].sample[0].relative_path, "archive/old.txt");
}

#[test]
fn unmapped_identifier_surfaces_in_report() {
    let outcome = run_fixture();
    let r = &outcome.result;
    assert_eq!(r.unmapped_identifiers, vec![UNMAPPED_GUID]);
    assert!(r.diagnostics.has(DiagnosticKind::UnresolvedIdentifier));
    assert!(r
        .results
        .iter()
        .any(|c| c.canonical_type_name == format!("Unmapped:{UNMAPPED_GUID}")));
}

#[test]
fn missing_location_row_is_skipped_and_run_is_partial() {
    let outcome = run_fixture();
    assert!(outcome.partial);
    let r = &outcome.result;
    assert_eq!(r.summary.skipped_rows, 1);
    assert_eq!(r.summary.dropped_sources, 0);
    let skipped = r
        .diagnostics
        .entries
        .iter()
        .find(|d| d.kind == DiagnosticKind::MalformedRecord)
        .unwrap();
    assert_eq!(skipped.source_id.as_deref(), Some("local"));
    assert_eq!(skipped.row, Some(4));
}

#[test]
fn report_artifacts_written() {
    let outcome = run_fixture();
    let dir = tempfile::tempdir().unwrap();
    let options = ReportOptions {
        report: dir.path().join("report.csv"),
        summary: None,
        render: true,
    };
    let written = generate(&outcome.result, &options).unwrap();

    let csv = std::fs::read_to_string(&written.report).unwrap();
    let header = csv.lines().next().unwrap();
    assert_eq!(
        header,
        "fileKey,canonicalTypeName,local,purview,unmappedSourceTypeIds"
    );
    assert!(csv.contains(
        "[contoso.sharepoint.com/sites/finance]notes.docx,Credit Card Number,true,false,"
    ));

    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&written.summary).unwrap()).unwrap();
    assert_eq!(summary["meta"]["config_name"], "Q3 finance discovery comparison");
    assert_eq!(summary["unmapped_identifiers"][0], UNMAPPED_GUID);

    let md = std::fs::read_to_string(written.rendered.unwrap()).unwrap();
    assert!(md.contains("| local |"));
}

// -------------------------------------------------------------------------
// Type resolution
// -------------------------------------------------------------------------

#[test]
fn cache_entry_resolves_without_live_lookup() {
    let types = fixture_config().types;
    let (resolver, diagnostics) = TypeResolver::build(&types, &fixtures_dir(), None);
    assert!(diagnostics.is_empty());
    let resolved = resolver.resolve("a44669fe-0d48-453d-a9b1-2cc83f2cba77");
    assert_eq!(resolved.name, SSN);
    assert!(resolved.is_mapped());
}

#[test]
fn unknown_identifier_resolves_to_placeholder() {
    let (resolver, _) = TypeResolver::build(&Default::default(), Path::new("."), None);
    assert_eq!(resolver.resolve("f00d").name, "Unmapped:f00d");
}

struct HungCatalog;

impl AuthoritativeSource for HungCatalog {
    fn describe(&self) -> String {
        "hung catalog".into()
    }

    fn fetch_mappings(&self) -> Result<Vec<(String, String)>, LookupError> {
        thread::sleep(Duration::from_secs(10));
        Ok(Vec::new())
    }
}

#[test]
fn hung_catalog_times_out_and_run_continues_cache_only() {
    let mut config = fixture_config();
    config.types.authoritative = Some(AuthoritativeConfig {
        endpoint: "https://catalog.invalid/sits".into(),
        timeout_ms: 100,
        token_env: None,
    });

    let outcome = run(&config, &fixtures_dir(), Some(Box::new(HungCatalog))).unwrap();
    let r = &outcome.result;
    assert!(r.diagnostics.has(DiagnosticKind::AuthoritativeLookupTimeout));
    // Cached mappings still apply.
    assert!(r.results.iter().any(|c| c.canonical_type_name == SSN));
}

#[test]
fn malformed_cache_is_recoverable() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["local-scan.csv", "local-coverage.txt", "purview.json", "purview-coverage.json"] {
        std::fs::copy(fixtures_dir().join(name), dir.path().join(name)).unwrap();
    }
    std::fs::write(dir.path().join("type-map.json"), "{ not json").unwrap();

    let outcome = run(&fixture_config(), dir.path(), None).unwrap();
    let r = &outcome.result;
    assert!(r.diagnostics.has(DiagnosticKind::CacheUnreadable));
    // Three purview GUIDs plus the two names the local scanner emits.
    assert_eq!(r.unmapped_identifiers.len(), 5);
}

// -------------------------------------------------------------------------
// Fatal paths
// -------------------------------------------------------------------------

#[test]
fn single_source_is_insufficient() {
    let toml = r#"
ground_truth = "purview"

[sources.purview]
method = "authoritative_export_a"
file = "purview.json"
"#;
    let err = RunConfig::from_toml(toml).unwrap_err();
    assert!(matches!(err, ReconError::InsufficientSources { usable: 1 }));
}

#[test]
fn unreadable_second_source_leaves_one_usable() {
    let config = RunConfig::from_sources(
        "purview",
        [
            (
                "purview".to_string(),
                SourceConfig::new(SourceMethod::AuthoritativeExportA, "purview.json"),
            ),
            (
                "local".to_string(),
                SourceConfig::new(SourceMethod::PatternMatch, "does-not-exist.csv"),
            ),
        ],
    );
    let err = run(&config, &fixtures_dir(), None).unwrap_err();
    assert!(matches!(err, ReconError::InsufficientSources { usable: 1 }));
}
