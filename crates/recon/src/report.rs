//! Report artifacts: consolidated CSV, JSON summary, optional Markdown.
//!
//! Every artifact is rendered fully in memory, written to `<path>.tmp` and
//! renamed into place, so a failed run never leaves a truncated file.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::diagnostics::Diagnostics;
use crate::error::ReconError;
use crate::metrics::MetricsReport;
use crate::model::{ReconMeta, ReconResult, ReconSummary, SourceSummary, UnmatchedFiles};
use crate::resolver::is_placeholder;

pub const UNDEFINED: &str = "undefined";

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub report: PathBuf,
    /// Defaults to `<report stem>.summary.json` next to the report.
    pub summary: Option<PathBuf>,
    pub render: bool,
}

impl ReportOptions {
    pub fn new(report: impl Into<PathBuf>) -> Self {
        Self {
            report: report.into(),
            summary: None,
            render: false,
        }
    }

    pub fn summary_path(&self) -> PathBuf {
        self.summary
            .clone()
            .unwrap_or_else(|| self.report.with_extension("summary.json"))
    }

    pub fn markdown_path(&self) -> PathBuf {
        self.report.with_extension("summary.md")
    }
}

/// Paths actually written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenReport {
    pub report: PathBuf,
    pub summary: PathBuf,
    pub rendered: Option<PathBuf>,
}

/// Everything in the run result except the per-pair rows, which live in
/// the CSV.
#[derive(Serialize)]
struct SummaryDocument<'a> {
    meta: &'a ReconMeta,
    summary: &'a ReconSummary,
    sources: &'a [SourceSummary],
    metrics: &'a MetricsReport,
    unmapped_identifiers: &'a [String],
    unmatched_files: &'a [UnmatchedFiles],
    diagnostics: &'a Diagnostics,
}

pub fn generate(
    result: &ReconResult,
    options: &ReportOptions,
) -> Result<WrittenReport, ReconError> {
    let csv = render_csv(result)?;
    let summary = render_summary(result)?;
    let markdown = options.render.then(|| render_markdown(result));

    write_atomic(&options.report, &csv)?;
    let summary_path = options.summary_path();
    write_atomic(&summary_path, summary.as_bytes())?;

    let rendered = match markdown {
        Some(md) => {
            let path = options.markdown_path();
            write_atomic(&path, md.as_bytes())?;
            Some(path)
        }
        None => None,
    };

    tracing::info!(
        report = %options.report.display(),
        summary = %summary_path.display(),
        rows = result.results.len(),
        "report written"
    );

    Ok(WrittenReport {
        report: options.report.clone(),
        summary: summary_path,
        rendered,
    })
}

/// `fileKey,canonicalTypeName,<source…>[,unmappedSourceTypeIds]`.
pub fn render_csv(result: &ReconResult) -> Result<Vec<u8>, ReconError> {
    let source_ids: Vec<&str> = result.sources.iter().map(|s| s.source_id.as_str()).collect();
    let with_unmapped = !result.unmapped_identifiers.is_empty();

    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());

    let mut header = vec!["fileKey", "canonicalTypeName"];
    header.extend(source_ids.iter().copied());
    if with_unmapped {
        header.push("unmappedSourceTypeIds");
    }
    writer
        .write_record(&header)
        .map_err(|e| ReconError::Io(format!("csv encode: {e}")))?;

    for r in &result.results {
        let mut row = vec![r.file_key.to_string(), r.canonical_type_name.clone()];
        row.extend(
            source_ids
                .iter()
                .map(|id| r.detected_by_source(id).to_string()),
        );
        if with_unmapped {
            if is_placeholder(&r.canonical_type_name) {
                row.push(r.raw_type_ids.join(";"));
            } else {
                row.push(String::new());
            }
        }
        writer
            .write_record(&row)
            .map_err(|e| ReconError::Io(format!("csv encode: {e}")))?;
    }

    writer
        .into_inner()
        .map_err(|e| ReconError::Io(format!("csv flush: {e}")))
}

pub fn render_summary(result: &ReconResult) -> Result<String, ReconError> {
    let doc = SummaryDocument {
        meta: &result.meta,
        summary: &result.summary,
        sources: &result.sources,
        metrics: &result.metrics,
        unmapped_identifiers: &result.unmapped_identifiers,
        unmatched_files: &result.unmatched_files,
        diagnostics: &result.diagnostics,
    };
    serde_json::to_string_pretty(&doc).map_err(|e| ReconError::Io(format!("json encode: {e}")))
}

/// Four decimals, or `undefined` for a zero denominator.
pub fn display_ratio(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.4}"),
        None => UNDEFINED.to_string(),
    }
}

pub fn render_markdown(result: &ReconResult) -> String {
    let mut md = String::new();
    let m = &result.metrics;

    // Writing to a String cannot fail.
    let _ = writeln!(md, "# {}\n", result.meta.config_name);
    let _ = writeln!(
        md,
        "Ground truth: `{}`. Run at {}. Engine {}.\n",
        m.ground_truth, result.meta.run_at, result.meta.engine_version
    );

    let s = &result.summary;
    let _ = writeln!(md, "## Summary\n");
    let _ = writeln!(
        md,
        "| Pairs | Agreed | Single source | Unmapped ids | Skipped rows | Dropped sources |"
    );
    let _ = writeln!(md, "|---|---|---|---|---|---|");
    let _ = writeln!(
        md,
        "| {} | {} | {} | {} | {} | {} |\n",
        s.total_pairs,
        s.agreed,
        s.single_source,
        s.unmapped_identifiers,
        s.skipped_rows,
        s.dropped_sources
    );
    if !s.approximate_coverage.is_empty() {
        let _ = writeln!(
            md,
            "> Approximate metrics: no coverage file for {}. Files these sources \
             never reported count as not evaluated.\n",
            s.approximate_coverage
                .iter()
                .map(|id| format!("`{id}`"))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let _ = writeln!(md, "## Metrics vs `{}`\n", m.ground_truth);
    let _ = writeln!(
        md,
        "| Source | Shared files | TP | FP | FN | TN | Precision | Recall | Accuracy | F1 | Agreement |"
    );
    let _ = writeln!(md, "|---|---|---|---|---|---|---|---|---|---|---|");
    for sm in &m.per_source {
        let c = sm.counts;
        let _ = writeln!(
            md,
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} |",
            sm.source_id,
            sm.shared_files,
            c.true_positive,
            c.false_positive,
            c.false_negative,
            c.true_negative,
            display_ratio(sm.precision),
            display_ratio(sm.recall),
            display_ratio(sm.accuracy),
            display_ratio(sm.f1),
            display_ratio(sm.agreement_rate_vs_ground_truth),
        );
    }
    md.push('\n');

    let ids: Vec<&str> = result.sources.iter().map(|s| s.source_id.as_str()).collect();
    let _ = writeln!(md, "## Pairwise agreement\n");
    let _ = writeln!(md, "| | {} |", ids.join(" | "));
    let _ = writeln!(md, "|---|{}", "---|".repeat(ids.len()));
    for a in &ids {
        let cells: Vec<String> = ids
            .iter()
            .map(|b| {
                if a == b {
                    "-".to_string()
                } else {
                    display_ratio(m.agreement(a, b).and_then(|p| p.rate))
                }
            })
            .collect();
        let _ = writeln!(md, "| {} | {} |", a, cells.join(" | "));
    }
    md.push('\n');

    if !result.unmapped_identifiers.is_empty() {
        let _ = writeln!(md, "## Unmapped identifiers\n");
        for id in &result.unmapped_identifiers {
            let _ = writeln!(md, "- `{id}`");
        }
        md.push('\n');
    }

    if !result.unmatched_files.is_empty() {
        let _ = writeln!(md, "## Files no other source covered\n");
        for u in &result.unmatched_files {
            let _ = writeln!(md, "- `{}`: {} file(s)", u.source_id, u.count);
        }
        md.push('\n');
    }

    if !result.diagnostics.is_empty() {
        let _ = writeln!(md, "## Diagnostics\n");
        for d in &result.diagnostics.entries {
            let mut line = format!("- **{}**", d.kind);
            if let Some(ref src) = d.source_id {
                let _ = write!(line, " `{src}`");
            }
            if let Some(row) = d.row {
                let _ = write!(line, " row {row}");
            }
            let _ = writeln!(md, "{line}: {}", d.message);
        }
    }

    md
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ReconError> {
    let write_err = |e: std::io::Error| ReconError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let tmp = tmp_path(path);
    std::fs::write(&tmp, bytes).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        write_err(e)
    })
}
