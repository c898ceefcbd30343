//! `crossdetect run | validate | normalize`: config-driven detection
//! reconciliation.

use std::path::{Path, PathBuf};

use clap::Args;
use crossdetect_catalog::CatalogClient;
use crossdetect_recon::config::{
    AuthoritativeConfig, RunConfig, SourceConfig, DEFAULT_LOOKUP_TIMEOUT_MS,
};
use crossdetect_recon::metrics::SourceMetrics;
use crossdetect_recon::report::{display_ratio, generate, ReportOptions};
use crossdetect_recon::resolver::AuthoritativeSource;
use crossdetect_recon::{NormalizerTable, ReconError, SourceMethod};

use crate::exit_codes::{recon_exit_code, EXIT_ERROR, EXIT_PARTIAL};
use crate::CliError;

const DEFAULT_REPORT: &str = "crossdetect-report.csv";

#[derive(Args)]
pub struct RunArgs {
    /// Path to a .recon.toml config file (optional when --source is given)
    pub config: Option<PathBuf>,

    /// Add a source: ID=METHOD:PATH[@COVERAGE] (repeatable)
    #[arg(long = "source", value_name = "ID=METHOD:PATH[@COVERAGE]")]
    pub sources: Vec<String>,

    /// Ground-truth source id (defaults to the first --source without a config)
    #[arg(long)]
    pub ground_truth: Option<String>,

    /// Cached type mapping file (JSON)
    #[arg(long, value_name = "FILE")]
    pub type_cache: Option<PathBuf>,

    /// Type catalog endpoint queried once before loading
    #[arg(long, env = "CROSSDETECT_CATALOG_URL", value_name = "URL")]
    pub catalog_url: Option<String>,

    /// Catalog lookup timeout in milliseconds
    #[arg(long, value_name = "N")]
    pub catalog_timeout_ms: Option<u64>,

    /// Only compare these types (canonical name or raw id, repeatable)
    #[arg(long = "type", value_name = "T")]
    pub types: Vec<String>,

    /// Only compare files whose key starts with this prefix (repeatable)
    #[arg(long = "path-prefix", value_name = "P")]
    pub path_prefixes: Vec<String>,

    /// Drop detections below this confidence (0..=1)
    #[arg(long, value_name = "X")]
    pub min_confidence: Option<f64>,

    /// Consolidated CSV report path
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Summary JSON path (default: <report>.summary.json)
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Also write a Markdown summary next to the report
    #[arg(long)]
    pub render: bool,

    /// Print the full result as JSON to stdout
    #[arg(long)]
    pub json: bool,
}

fn recon_err(code: u8, msg: impl Into<String>) -> CliError {
    CliError {
        code,
        message: msg.into(),
        hint: None,
    }
}

/// Engine error with its exit code and, where an operator can act on it, a hint.
fn engine_err(err: ReconError) -> CliError {
    let hint = match &err {
        ReconError::InsufficientSources { .. } => {
            Some("configure at least two [sources.*] or pass --source twice".to_string())
        }
        ReconError::UnknownSource(_) => {
            Some("ground_truth must name one of the configured sources".to_string())
        }
        ReconError::SourceUnavailable { .. } => {
            Some("the ground-truth source must load for metrics to be defined".to_string())
        }
        _ => None,
    };
    CliError {
        code: recon_exit_code(&err),
        message: err.to_string(),
        hint,
    }
}

fn cwd() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Paths given on the command line are relative to the working directory,
/// while the engine resolves against the config file's directory.
fn from_cwd(path: &Path) -> String {
    if path.is_absolute() {
        path.display().to_string()
    } else {
        cwd().join(path).display().to_string()
    }
}

fn read_config(path: &Path) -> Result<RunConfig, CliError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        recon_err(EXIT_ERROR, format!("cannot read config {}: {e}", path.display()))
    })?;
    RunConfig::parse(&text).map_err(engine_err)
}

fn config_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Merge the config file (if any) with command-line overrides.
fn assemble(args: &RunArgs) -> Result<(RunConfig, PathBuf), CliError> {
    let mut descriptors = Vec::with_capacity(args.sources.len());
    for raw in &args.sources {
        let (id, mut source) = SourceConfig::parse_descriptor(raw).map_err(engine_err)?;
        source.file = from_cwd(Path::new(&source.file));
        source.coverage = source.coverage.map(|c| from_cwd(Path::new(&c)));
        descriptors.push((id, source));
    }

    let (mut config, base_dir) = match args.config {
        Some(ref path) => {
            let mut config = read_config(path)?;
            config.sources.extend(descriptors);
            (config, config_dir(path))
        }
        None => {
            let ground_truth = match (&args.ground_truth, descriptors.first()) {
                (Some(gt), _) => gt.clone(),
                (None, Some((id, _))) => id.clone(),
                (None, None) => {
                    let hint = "crossdetect run recon.toml, or --source ID=METHOD:PATH twice";
                    let err = recon_err(EXIT_ERROR, "no config file and no --source given");
                    return Err(err.with_hint(hint));
                }
            };
            (RunConfig::from_sources(&ground_truth, descriptors), cwd())
        }
    };

    if let Some(ref gt) = args.ground_truth {
        config.ground_truth = gt.clone();
    }
    if let Some(ref cache) = args.type_cache {
        config.types.cache = Some(from_cwd(cache));
    }
    if let Some(ref url) = args.catalog_url {
        let timeout_ms = config
            .types
            .authoritative
            .as_ref()
            .map_or(DEFAULT_LOOKUP_TIMEOUT_MS, |a| a.timeout_ms);
        let token_env = config.types.authoritative.as_ref().and_then(|a| a.token_env.clone());
        config.types.authoritative = Some(AuthoritativeConfig {
            endpoint: url.clone(),
            timeout_ms,
            token_env,
        });
    }
    if let Some(ms) = args.catalog_timeout_ms {
        if let Some(auth) = config.types.authoritative.as_mut() {
            auth.timeout_ms = ms;
        }
    }

    config.filters.types.extend(args.types.iter().cloned());
    config.filters.path_prefixes.extend(args.path_prefixes.iter().cloned());
    if args.min_confidence.is_some() {
        config.filters.min_confidence = args.min_confidence;
    }

    config.validate().map_err(engine_err)?;
    Ok((config, base_dir))
}

fn report_options(args: &RunArgs, config: &RunConfig, base_dir: &Path) -> ReportOptions {
    let report = match (&args.output, &config.output.report) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) => base_dir.join(path),
        (None, None) => PathBuf::from(DEFAULT_REPORT),
    };
    let summary = match (&args.summary, &config.output.summary) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(path)) => Some(base_dir.join(path)),
        (None, None) => None,
    };
    ReportOptions {
        report,
        summary,
        render: args.render || config.output.render,
    }
}

fn catalog(config: &RunConfig) -> Result<Option<Box<dyn AuthoritativeSource>>, CliError> {
    let Some(ref auth) = config.types.authoritative else {
        return Ok(None);
    };
    let client = CatalogClient::from_config(auth).map_err(|e| {
        recon_err(EXIT_ERROR, e.to_string())
            .with_hint("check [types.authoritative].endpoint or --catalog-url")
    })?;
    Ok(Some(Box::new(client)))
}

pub fn cmd_run(args: RunArgs) -> Result<(), CliError> {
    let (config, base_dir) = assemble(&args)?;
    let authoritative = catalog(&config)?;
    tracing::info!(
        sources = config.sources.len(),
        ground_truth = %config.ground_truth,
        base_dir = %base_dir.display(),
        "starting run"
    );

    let outcome = crossdetect_recon::run(&config, &base_dir, authoritative).map_err(engine_err)?;
    let result = &outcome.result;

    let options = report_options(&args, &config, &base_dir);
    let written = generate(result, &options).map_err(engine_err)?;

    if args.json {
        let json_str = serde_json::to_string_pretty(result)
            .map_err(|e| recon_err(EXIT_ERROR, format!("JSON serialization error: {e}")))?;
        println!("{json_str}");
    }

    // Human summary to stderr
    let s = &result.summary;
    eprintln!(
        "{}: {} pairs across {} sources, {} agreed, {} single-source, {} unmapped id(s)",
        result.meta.config_name,
        s.total_pairs,
        result.sources.len(),
        s.agreed,
        s.single_source,
        s.unmapped_identifiers,
    );
    for m in &result.metrics.per_source {
        eprintln!("  {}", metrics_line(m, &result.metrics.ground_truth));
    }
    if !s.approximate_coverage.is_empty() {
        eprintln!(
            "  note: no coverage file for {}; metrics are approximate",
            s.approximate_coverage.join(", ")
        );
    }
    eprintln!("wrote {}", written.report.display());
    eprintln!("wrote {}", written.summary.display());
    if let Some(ref md) = written.rendered {
        eprintln!("wrote {}", md.display());
    }

    if outcome.partial {
        return Err(CliError {
            code: EXIT_PARTIAL,
            message: format!(
                "partial run: {} row(s) skipped, {} source(s) dropped",
                s.skipped_rows, s.dropped_sources
            ),
            hint: Some(format!("see diagnostics in {}", written.summary.display())),
        });
    }

    Ok(())
}

fn metrics_line(m: &SourceMetrics, ground_truth: &str) -> String {
    format!(
        "{} vs {}: precision {}, recall {}, f1 {} (tp {}, fp {}, fn {}, shared files {})",
        m.source_id,
        ground_truth,
        display_ratio(m.precision),
        display_ratio(m.recall),
        display_ratio(m.f1),
        m.counts.true_positive,
        m.counts.false_positive,
        m.counts.false_negative,
        m.shared_files,
    )
}

pub fn cmd_validate(config_path: PathBuf) -> Result<(), CliError> {
    let config = read_config(&config_path)?;
    config.validate().map_err(engine_err)?;
    eprintln!(
        "valid: '{}' with {} source(s), ground truth '{}'",
        config.name,
        config.sources.len(),
        config.ground_truth,
    );
    Ok(())
}

pub fn cmd_normalize(
    method: String,
    host: Option<String>,
    config_path: Option<PathBuf>,
    locations: Vec<String>,
) -> Result<(), CliError> {
    let table = match config_path {
        Some(ref path) => NormalizerTable::from_config(&read_config(path)?),
        None => NormalizerTable::new(),
    };
    let method = SourceMethod::from(method);
    for location in &locations {
        let key = table.normalize_with_host(location, &method, host.as_deref());
        println!("{key}\t{location}");
    }
    Ok(())
}
