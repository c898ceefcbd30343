//! Per-method column table.
//!
//! Each discovery method names the same logical fields differently. The
//! table lists candidate header names per field in priority order; the
//! loader never branches on method itself.

use crate::config::ColumnOverrides;
use crate::model::SourceMethod;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSchema {
    pub raw_type_id: Vec<String>,
    pub raw_location: Vec<String>,
    pub confidence: Vec<String>,
    pub timestamp: Vec<String>,
}

/// Header positions resolved against one file (or one JSON object).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnIndex {
    pub raw_type_id: Option<usize>,
    pub raw_location: Option<usize>,
    pub confidence: Option<usize>,
    pub timestamp: Option<usize>,
}

impl ColumnIndex {
    /// Both required fields have a column.
    pub fn is_usable(&self) -> bool {
        self.raw_type_id.is_some() && self.raw_location.is_some()
    }

    /// Positions claimed by logical fields; everything else is passthrough.
    pub fn claimed(&self) -> [Option<usize>; 4] {
        [self.raw_type_id, self.raw_location, self.confidence, self.timestamp]
    }
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl MethodSchema {
    pub fn for_method(method: &SourceMethod) -> Self {
        match method {
            SourceMethod::PatternMatch => Self {
                raw_type_id: owned(&["Sensitive type", "SensitiveType", "Pattern", "Type"]),
                raw_location: owned(&["Location", "Path", "FilePath", "File"]),
                confidence: owned(&["Confidence", "Score"]),
                timestamp: owned(&["Timestamp", "ScannedAt", "Time"]),
            },
            SourceMethod::AuthoritativeExportA => Self {
                raw_type_id: owned(&[
                    "SensitiveInfoTypeId",
                    "Sensitive info type",
                    "SensitiveType",
                    "Type",
                ]),
                raw_location: owned(&["FileUrl", "Url", "Location", "ObjectId"]),
                confidence: owned(&["Confidence", "ConfidenceLevel"]),
                timestamp: owned(&["CreationTime", "LastModifiedTime", "Timestamp"]),
            },
            SourceMethod::AuthoritativeExportB => Self {
                raw_type_id: owned(&["DetectedCategory", "Category", "InfoType"]),
                raw_location: owned(&["DocumentUrl", "ResourceUrl", "Url", "Path"]),
                confidence: owned(&["Likelihood", "Confidence"]),
                timestamp: owned(&["ExportedAt", "DetectedAt", "Timestamp"]),
            },
            SourceMethod::Custom(_) => Self {
                raw_type_id: owned(&["raw_type_id", "type", "rawTypeId"]),
                raw_location: owned(&["raw_location", "location", "rawLocation", "path"]),
                confidence: owned(&["confidence"]),
                timestamp: owned(&["timestamp"]),
            },
        }
    }

    /// An explicit column replaces the candidate list for that field.
    pub fn with_overrides(mut self, overrides: &ColumnOverrides) -> Self {
        if let Some(ref c) = overrides.raw_type_id {
            self.raw_type_id = vec![c.clone()];
        }
        if let Some(ref c) = overrides.raw_location {
            self.raw_location = vec![c.clone()];
        }
        if let Some(ref c) = overrides.confidence {
            self.confidence = vec![c.clone()];
        }
        if let Some(ref c) = overrides.timestamp {
            self.timestamp = vec![c.clone()];
        }
        self
    }

    pub fn resolve<S: AsRef<str>>(&self, headers: &[S]) -> ColumnIndex {
        let folded: Vec<String> = headers.iter().map(|h| fold_header(h.as_ref())).collect();
        ColumnIndex {
            raw_type_id: find(&self.raw_type_id, &folded),
            raw_location: find(&self.raw_location, &folded),
            confidence: find(&self.confidence, &folded),
            timestamp: find(&self.timestamp, &folded),
        }
    }
}

/// First candidate (by candidate priority) present in `folded`.
fn find(candidates: &[String], folded: &[String]) -> Option<usize> {
    candidates.iter().find_map(|c| {
        let c = fold_header(c);
        folded.iter().position(|h| *h == c)
    })
}

/// Case-insensitive, whitespace-trimmed, BOM-stripped header comparison key.
pub fn fold_header(header: &str) -> String {
    header.trim_start_matches('\u{feff}').trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_match_headers() {
        let schema = MethodSchema::for_method(&SourceMethod::PatternMatch);
        let idx = schema.resolve(&["\u{feff}Location", "Sensitive type", "Confidence"]);
        assert_eq!(idx.raw_location, Some(0));
        assert_eq!(idx.raw_type_id, Some(1));
        assert_eq!(idx.confidence, Some(2));
        assert_eq!(idx.timestamp, None);
        assert!(idx.is_usable());
    }

    #[test]
    fn export_b_uses_detected_category() {
        let schema = MethodSchema::for_method(&SourceMethod::AuthoritativeExportB);
        let idx = schema.resolve(&["documenturl", "DETECTEDCATEGORY"]);
        assert_eq!(idx.raw_type_id, Some(1));
        assert_eq!(idx.raw_location, Some(0));
    }

    #[test]
    fn candidate_priority_beats_column_order() {
        let schema = MethodSchema::for_method(&SourceMethod::AuthoritativeExportA);
        // Both "Type" and "SensitiveInfoTypeId" exist; the id column wins.
        let idx = schema.resolve(&["Type", "FileUrl", "SensitiveInfoTypeId"]);
        assert_eq!(idx.raw_type_id, Some(2));
    }

    #[test]
    fn overrides_replace_candidates() {
        let overrides = ColumnOverrides {
            raw_type_id: Some("SITId".into()),
            ..Default::default()
        };
        let schema =
            MethodSchema::for_method(&SourceMethod::AuthoritativeExportA)
                .with_overrides(&overrides);
        assert_eq!(schema.raw_type_id, vec!["SITId".to_string()]);
        let idx = schema.resolve(&["SensitiveInfoTypeId", "FileUrl"]);
        assert_eq!(idx.raw_type_id, None);
        assert!(!idx.is_usable());
    }
}
