//! Source loading: one result set per discovery method.
//!
//! Hands raw records downstream; type resolution and key normalization
//! happen later so they stay independent of per-source formats.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::config::{SourceConfig, SourceFormat};
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::error::ReconError;
use crate::model::{RawRecord, SourceMethod};
use crate::schema::{fold_header, ColumnIndex, MethodSchema};

/// Raw output of loading one source.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub source_id: String,
    pub method: SourceMethod,
    pub reliability_rank: u32,
    /// Storage root for relative locations.
    pub host: Option<String>,
    pub records: Vec<RawRecord>,
    /// Raw locations the source evaluated, when a coverage file was given.
    pub coverage: Option<Vec<String>>,
    pub diagnostics: Vec<Diagnostic>,
}

impl LoadedSource {
    pub fn skipped_rows(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::MalformedRecord)
            .count()
    }
}

/// Load a source file (and its coverage file, if any) relative to `base_dir`.
pub fn load(
    source_id: &str,
    config: &SourceConfig,
    base_dir: &Path,
) -> Result<LoadedSource, ReconError> {
    let path = base_dir.join(&config.file);
    let data = read_text(source_id, &path)?;
    let format = config.format.unwrap_or_else(|| infer_format(&path));

    let mut schema = MethodSchema::for_method(&config.method);
    if let Some(ref overrides) = config.columns {
        schema = schema.with_overrides(overrides);
    }

    let (records, diagnostics) = parse_records(source_id, &data, format, &schema)?;

    let coverage = match config.coverage {
        Some(ref cov) => {
            let cov_path = base_dir.join(cov);
            let cov_data = read_text(source_id, &cov_path)?;
            Some(parse_coverage(source_id, &cov_data, &cov_path, &schema)?)
        }
        None => None,
    };

    tracing::info!(
        source = source_id,
        method = %config.method,
        records = records.len(),
        skipped = diagnostics.len(),
        covered = coverage.as_ref().map(|c| c.len()),
        "loaded {}",
        path.display()
    );

    Ok(LoadedSource {
        source_id: source_id.to_string(),
        method: config.method.clone(),
        reliability_rank: config.reliability_rank(),
        host: config.host.clone(),
        records,
        coverage,
        diagnostics,
    })
}

fn read_text(source_id: &str, path: &Path) -> Result<String, ReconError> {
    let bytes = std::fs::read(path).map_err(|e| {
        ReconError::unavailable(source_id, format!("cannot read {}: {e}", path.display()))
    })?;
    let text = String::from_utf8(bytes).map_err(|_| {
        ReconError::unavailable(source_id, format!("{} is not valid UTF-8", path.display()))
    })?;
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

pub fn infer_format(path: &Path) -> SourceFormat {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => SourceFormat::Json,
        Some("tsv") => SourceFormat::Tsv,
        _ => SourceFormat::Csv,
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Parse one export. Rows missing a required field are skipped and reported;
/// only a structurally unreadable file is an error.
pub fn parse_records(
    source_id: &str,
    data: &str,
    format: SourceFormat,
    schema: &MethodSchema,
) -> Result<(Vec<RawRecord>, Vec<Diagnostic>), ReconError> {
    let rows = match format {
        SourceFormat::Csv => csv_rows(source_id, data, b',', schema)?,
        SourceFormat::Tsv => csv_rows(source_id, data, b'\t', schema)?,
        SourceFormat::Json => json_rows(source_id, data, schema)?,
    };

    let mut records = Vec::with_capacity(rows.len());
    let mut diagnostics = Vec::new();
    for row in rows {
        match row {
            Ok(record) => records.push(record),
            Err(diag) => {
                tracing::warn!(
                    source = source_id,
                    row = diag.row,
                    "skipping row: {}",
                    diag.message
                );
                diagnostics.push(diag);
            }
        }
    }
    Ok((records, diagnostics))
}

type RowOutcome = Result<RawRecord, Diagnostic>;

fn csv_rows(
    source_id: &str,
    data: &str,
    delimiter: u8,
    schema: &MethodSchema,
) -> Result<Vec<RowOutcome>, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ReconError::unavailable(source_id, format!("unreadable CSV header: {e}")))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let index = schema.resolve(&headers);
    require_columns(source_id, &index, schema)?;

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let row = i + 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                rows.push(Err(malformed(source_id, row, format!("unreadable row: {e}"))));
                continue;
            }
        };
        let values: Vec<Option<String>> = (0..headers.len())
            .map(|i| record.get(i).map(|v| v.to_string()))
            .collect();
        rows.push(build_record(source_id, row, &headers, &values, &index));
    }
    Ok(rows)
}

fn json_rows(
    source_id: &str,
    data: &str,
    schema: &MethodSchema,
) -> Result<Vec<RowOutcome>, ReconError> {
    let root: Value = serde_json::from_str(data)
        .map_err(|e| ReconError::unavailable(source_id, format!("invalid JSON: {e}")))?;
    let items = json_items(&root).ok_or_else(|| {
        ReconError::unavailable(
            source_id,
            "JSON must be an array or an object with a records/value/items array",
        )
    })?;

    // Objects carry their own keys, so the column check runs over the whole
    // document: one usable object is enough, none at all is a wrong export.
    let mut usable = items.is_empty();
    let mut first_index = None;
    let mut rows = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let row = i + 1;
        let Some(obj) = item.as_object() else {
            rows.push(Err(malformed(source_id, row, "row is not a JSON object".into())));
            continue;
        };
        let headers: Vec<String> = obj.keys().cloned().collect();
        let values: Vec<Option<String>> = obj.values().map(json_scalar).collect();
        let index = schema.resolve(&headers);
        usable |= index.is_usable();
        first_index.get_or_insert(index);
        rows.push(build_record(source_id, row, &headers, &values, &index));
    }
    if !usable {
        require_columns(source_id, &first_index.unwrap_or_default(), schema)?;
    }
    Ok(rows)
}

fn json_items(root: &Value) -> Option<&Vec<Value>> {
    match root {
        Value::Array(items) => Some(items),
        Value::Object(obj) => ["records", "value", "items"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array)),
        _ => None,
    }
}

fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn require_columns(
    source_id: &str,
    index: &ColumnIndex,
    schema: &MethodSchema,
) -> Result<(), ReconError> {
    if index.raw_type_id.is_none() {
        return Err(ReconError::unavailable(
            source_id,
            format!("no type column (tried {})", schema.raw_type_id.join(", ")),
        ));
    }
    if index.raw_location.is_none() {
        return Err(ReconError::unavailable(
            source_id,
            format!("no location column (tried {})", schema.raw_location.join(", ")),
        ));
    }
    Ok(())
}

fn malformed(source_id: &str, row: usize, message: String) -> Diagnostic {
    Diagnostic::new(DiagnosticKind::MalformedRecord, message)
        .for_source(source_id)
        .at_row(row)
}

fn build_record(
    source_id: &str,
    row: usize,
    headers: &[String],
    values: &[Option<String>],
    index: &ColumnIndex,
) -> RowOutcome {
    let field = |idx: Option<usize>| -> Option<String> {
        idx.and_then(|i| values.get(i).cloned().flatten())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let raw_type_id = field(index.raw_type_id)
        .ok_or_else(|| malformed(source_id, row, "missing required field raw_type_id".into()))?;
    let raw_location = field(index.raw_location)
        .ok_or_else(|| malformed(source_id, row, "missing required field raw_location".into()))?;

    let confidence = field(index.confidence).and_then(|v| parse_confidence(&v));
    let timestamp = field(index.timestamp).and_then(|v| parse_timestamp(&v));

    let claimed = index.claimed();
    let extra: BTreeMap<String, String> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| !claimed.contains(&Some(*i)))
        .filter_map(|(i, h)| values.get(i).cloned().flatten().map(|v| (h.clone(), v)))
        .collect();

    Ok(RawRecord {
        row,
        raw_type_id,
        raw_location,
        confidence,
        timestamp,
        extra,
    })
}

/// Numeric confidences above 1 are read as percentages; ordinal labels map
/// onto fixed points.
pub fn parse_confidence(value: &str) -> Option<f64> {
    let v = value.trim().trim_end_matches('%');
    if let Ok(n) = v.parse::<f64>() {
        if !n.is_finite() || n < 0.0 {
            return None;
        }
        let n = if n > 1.0 { n / 100.0 } else { n };
        return (n <= 1.0).then_some(n);
    }
    match v.to_ascii_lowercase().as_str() {
        "low" | "unlikely" => Some(0.25),
        "medium" | "possible" => Some(0.5),
        "high" | "likely" => Some(0.75),
        "very_likely" | "very likely" => Some(0.9),
        _ => None,
    }
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let v = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(v) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(v, fmt) {
            return Some(ndt.and_utc());
        }
    }
    NaiveDate::parse_from_str(v, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

/// Parse a coverage listing: JSON (strings or objects), CSV with a location
/// header, or plain text with one location per line.
pub fn parse_coverage(
    source_id: &str,
    data: &str,
    path: &Path,
    schema: &MethodSchema,
) -> Result<Vec<String>, ReconError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let mut candidates = schema.raw_location.clone();
    candidates.extend(["location".to_string(), "path".to_string()]);

    match ext.as_deref() {
        Some("json") => coverage_json(source_id, data, &candidates),
        Some("csv") | Some("tsv") => {
            let delimiter = if ext.as_deref() == Some("tsv") { b'\t' } else { b',' };
            coverage_csv(source_id, data, delimiter, &candidates)
        }
        _ => Ok(data
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect()),
    }
}

fn coverage_json(
    source_id: &str,
    data: &str,
    candidates: &[String],
) -> Result<Vec<String>, ReconError> {
    let root: Value = serde_json::from_str(data)
        .map_err(|e| ReconError::unavailable(source_id, format!("invalid coverage JSON: {e}")))?;
    let items = json_items(&root).ok_or_else(|| {
        ReconError::unavailable(source_id, "coverage JSON must be an array")
    })?;
    let folded: Vec<String> = candidates.iter().map(|c| fold_header(c)).collect();
    Ok(items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(obj) => folded.iter().find_map(|c| {
                obj.iter()
                    .find(|(k, _)| fold_header(k) == *c)
                    .and_then(|(_, v)| v.as_str())
                    .map(|s| s.trim().to_string())
            }),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect())
}

fn coverage_csv(
    source_id: &str,
    data: &str,
    delimiter: u8,
    candidates: &[String],
) -> Result<Vec<String>, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(data.as_bytes());

    let mut out = Vec::new();
    let mut column: Option<usize> = None;
    for (i, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| {
                ReconError::unavailable(source_id, format!("unreadable coverage CSV: {e}"))
            })?;
        if i == 0 {
            let folded: Vec<String> = record.iter().map(fold_header).collect();
            column = candidates
                .iter()
                .find_map(|c| folded.iter().position(|h| *h == fold_header(c)));
            if column.is_some() {
                continue;
            }
            // Headerless single-column listing: first line is data.
            if record.len() != 1 {
                return Err(ReconError::unavailable(
                    source_id,
                    "coverage CSV has no location column",
                ));
            }
        }
        let value = record.get(column.unwrap_or(0)).unwrap_or("").trim();
        if !value.is_empty() {
            out.push(value.to_string());
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
