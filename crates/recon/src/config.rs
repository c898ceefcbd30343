use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::ReconError;
use crate::model::SourceMethod;

pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub ground_truth: String,
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub types: TypesConfig,
    /// Host aliases: normalized host -> canonical host.
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
    /// Per-method normalization rule overrides, keyed by method name.
    #[serde(default)]
    pub normalize: BTreeMap<String, RuleOverride>,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_name() -> String {
    "detection reconciliation".into()
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub method: SourceMethod,
    pub file: String,
    #[serde(default)]
    pub format: Option<SourceFormat>,
    #[serde(default)]
    pub columns: Option<ColumnOverrides>,
    /// Storage root for relative locations.
    #[serde(default)]
    pub host: Option<String>,
    /// File listing every location this source evaluated.
    #[serde(default)]
    pub coverage: Option<String>,
    #[serde(default)]
    pub reliability_rank: Option<u32>,
}

impl SourceConfig {
    pub fn new(method: SourceMethod, file: impl Into<String>) -> Self {
        Self {
            method,
            file: file.into(),
            format: None,
            columns: None,
            host: None,
            coverage: None,
            reliability_rank: None,
        }
    }

    pub fn reliability_rank(&self) -> u32 {
        self.reliability_rank
            .unwrap_or_else(|| self.method.default_reliability_rank())
    }

    /// Parse a command-line descriptor: `ID=METHOD:PATH[@COVERAGE]`.
    pub fn parse_descriptor(input: &str) -> Result<(String, SourceConfig), ReconError> {
        let bad = || {
            ReconError::ConfigValidation(format!(
                "invalid source descriptor '{input}' (expected ID=METHOD:PATH[@COVERAGE])"
            ))
        };
        let (id, rest) = input.split_once('=').ok_or_else(bad)?;
        let (method, path) = rest.split_once(':').ok_or_else(bad)?;
        let (file, coverage) = match path.rsplit_once('@') {
            Some((file, cov)) if !cov.is_empty() => (file, Some(cov.to_string())),
            _ => (path, None),
        };
        if id.trim().is_empty() || method.trim().is_empty() || file.trim().is_empty() {
            return Err(bad());
        }
        let mut source = SourceConfig::new(SourceMethod::from(method), file.trim());
        source.coverage = coverage;
        Ok((id.trim().to_string(), source))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Csv,
    Tsv,
    Json,
}

/// Explicit header names; any field left unset falls back to the method's
/// column table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnOverrides {
    #[serde(default)]
    pub raw_type_id: Option<String>,
    #[serde(default)]
    pub raw_location: Option<String>,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TypesConfig {
    /// Cached mapping file (JSON).
    #[serde(default)]
    pub cache: Option<String>,
    /// Operator entries; never overwritten by the catalog.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub authoritative: Option<AuthoritativeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthoritativeConfig {
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_LOOKUP_TIMEOUT_MS
}

// ---------------------------------------------------------------------------
// Normalization, filters, output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleOverride {
    #[serde(default)]
    pub case_insensitive: Option<bool>,
    #[serde(default)]
    pub noise_segments: Option<Vec<String>>,
    #[serde(default)]
    pub default_host: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    /// Allow-list of canonical names or raw ids. Empty = all.
    #[serde(default)]
    pub types: Vec<String>,
    /// Allow-list of canonical key prefixes (`[host]path`). Empty = all.
    #[serde(default)]
    pub path_prefixes: Vec<String>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

impl FilterConfig {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.path_prefixes.is_empty() && self.min_confidence.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub render: bool,
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl RunConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let config = Self::parse(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating, for callers that extend the config first.
    pub fn parse(input: &str) -> Result<Self, ReconError> {
        toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))
    }

    /// Config assembled from command-line descriptors alone.
    pub fn from_sources(
        ground_truth: &str,
        sources: impl IntoIterator<Item = (String, SourceConfig)>,
    ) -> Self {
        Self {
            name: default_name(),
            ground_truth: ground_truth.to_string(),
            sources: sources.into_iter().collect(),
            types: TypesConfig::default(),
            hosts: BTreeMap::new(),
            normalize: BTreeMap::new(),
            filters: FilterConfig::default(),
            output: OutputConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if self.sources.len() < 2 {
            return Err(ReconError::InsufficientSources {
                usable: self.sources.len(),
            });
        }

        for id in self.sources.keys() {
            if id.trim().is_empty() || id.contains(',') {
                return Err(ReconError::ConfigValidation(format!(
                    "invalid source id '{id}' (must be non-empty, no commas)"
                )));
            }
        }

        if !self.sources.contains_key(&self.ground_truth) {
            return Err(ReconError::UnknownSource(format!(
                "ground_truth '{}' is not a configured source",
                self.ground_truth
            )));
        }

        if let Some(min) = self.filters.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(ReconError::ConfigValidation(format!(
                    "filters.min_confidence must be within [0, 1], got {min}"
                )));
            }
        }

        if let Some(ref auth) = self.types.authoritative {
            if auth.timeout_ms == 0 {
                return Err(ReconError::ConfigValidation(
                    "types.authoritative.timeout_ms must be greater than 0".into(),
                ));
            }
            if auth.endpoint.trim().is_empty() {
                return Err(ReconError::ConfigValidation(
                    "types.authoritative.endpoint must not be empty".into(),
                ));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
name = "Q3 discovery"
ground_truth = "purview"

[sources.local]
method = "pattern_match"
file = "local.csv"
coverage = "local-coverage.txt"
host = "fs01/finance"

[sources.purview]
method = "authoritative_export_a"
file = "purview.json"

[sources.purview.columns]
raw_type_id = "SITId"

[types]
cache = "type-map.json"

[types.overrides]
"custom-guid" = "Project Codename"

[hosts]
"fs01/finance" = "tenant.example.com/sites/finance"

[filters]
min_confidence = 0.5
"#;

    #[test]
    fn parse_valid() {
        let config = RunConfig::from_toml(VALID).unwrap();
        assert_eq!(config.name, "Q3 discovery");
        assert_eq!(config.ground_truth, "purview");
        assert_eq!(config.sources.len(), 2);

        let local = &config.sources["local"];
        assert_eq!(local.method, SourceMethod::PatternMatch);
        assert_eq!(local.coverage.as_deref(), Some("local-coverage.txt"));
        assert_eq!(local.reliability_rank(), 3);

        let purview = &config.sources["purview"];
        assert_eq!(purview.reliability_rank(), 1);
        assert_eq!(
            purview.columns.as_ref().unwrap().raw_type_id.as_deref(),
            Some("SITId")
        );
        assert!(purview.columns.as_ref().unwrap().raw_location.is_none());

        assert_eq!(config.types.overrides["custom-guid"], "Project Codename");
        assert!(config.types.authoritative.is_none());
        assert_eq!(config.filters.min_confidence, Some(0.5));
        assert!(!config.output.render);
    }

    #[test]
    fn authoritative_timeout_defaults() {
        let input = format!(
            r#"{VALID}
[types.authoritative]
endpoint = "https://catalog.example.com/types"
"#
        );
        let config = RunConfig::from_toml(&input).unwrap();
        let auth = config.types.authoritative.unwrap();
        assert_eq!(auth.timeout_ms, DEFAULT_LOOKUP_TIMEOUT_MS);
        assert!(auth.token_env.is_none());
    }

    #[test]
    fn reject_single_source() {
        let input = r#"
ground_truth = "a"
[sources.a]
method = "pattern_match"
file = "a.csv"
"#;
        let err = RunConfig::from_toml(input).unwrap_err();
        assert!(matches!(err, ReconError::InsufficientSources { usable: 1 }));
    }

    #[test]
    fn reject_unknown_ground_truth() {
        let input = r#"
ground_truth = "c"
[sources.a]
method = "pattern_match"
file = "a.csv"
[sources.b]
method = "authoritative_export_b"
file = "b.csv"
"#;
        let err = RunConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("'c'"));
    }

    #[test]
    fn reject_confidence_out_of_range() {
        let input = VALID.replace("min_confidence = 0.5", "min_confidence = 1.5");
        let err = RunConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("min_confidence"));
    }

    #[test]
    fn custom_method_round_trips_name() {
        let input = r#"
ground_truth = "a"
[sources.a]
method = "pattern_match"
file = "a.csv"
[sources.b]
method = "macie"
file = "b.json"
"#;
        let config = RunConfig::from_toml(input).unwrap();
        assert_eq!(config.sources["b"].method, SourceMethod::Custom("macie".into()));
    }

    #[test]
    fn parse_descriptor_with_coverage() {
        let descriptor = "scan=pattern_match:data/scan.csv@data/cov.txt";
        let (id, src) = SourceConfig::parse_descriptor(descriptor).unwrap();
        assert_eq!(id, "scan");
        assert_eq!(src.method, SourceMethod::PatternMatch);
        assert_eq!(src.file, "data/scan.csv");
        assert_eq!(src.coverage.as_deref(), Some("data/cov.txt"));
    }

    #[test]
    fn parse_descriptor_windows_path() {
        let (_, src) =
            SourceConfig::parse_descriptor("b=authoritative_export_b:C:\\exports\\b.json").unwrap();
        assert_eq!(src.method, SourceMethod::AuthoritativeExportB);
        assert_eq!(src.file, "C:\\exports\\b.json");
        assert!(src.coverage.is_none());
    }

    #[test]
    fn parse_descriptor_rejects_garbage() {
        assert!(SourceConfig::parse_descriptor("no-equals").is_err());
        assert!(SourceConfig::parse_descriptor("a=pattern_match").is_err());
        assert!(SourceConfig::parse_descriptor("=pattern_match:x.csv").is_err());
    }
}
