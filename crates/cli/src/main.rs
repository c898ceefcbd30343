// crossdetect CLI - reconcile sensitive-data detections across discovery methods

mod exit_codes;
mod recon;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use exit_codes::{usage_exit_code, EXIT_SUCCESS};
use recon::RunArgs;

#[derive(Parser)]
#[command(name = "crossdetect")]
#[command(about = "Reconcile sensitive-data detections across discovery methods")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every source, reconcile, and write the report
    #[command(after_help = "\
Examples:
  crossdetect run q3.recon.toml
  crossdetect run q3.recon.toml --output out/report.csv --render
  crossdetect run --source local=pattern_match:scan.csv --source purview=authoritative_export_a:purview.json
  crossdetect run q3.recon.toml --type 'Credit Card Number' --min-confidence 0.75 --json")]
    Run(RunArgs),

    /// Parse and validate a config without loading any data
    #[command(after_help = "\
Examples:
  crossdetect validate q3.recon.toml")]
    Validate {
        /// Path to the .recon.toml config file
        config: PathBuf,
    },

    /// Print the canonical file key for each location
    #[command(after_help = "\
Examples:
  crossdetect normalize --method pattern_match '\\\\fs01\\finance\\Q3\\payroll.xlsx'
  crossdetect normalize --method authoritative_export_a --config q3.recon.toml \\
      'https://contoso.sharepoint.com/sites/finance/Shared%20Documents/Q3/Payroll.xlsx'")]
    Normalize {
        /// Discovery method whose path rule applies
        #[arg(long, short = 'm')]
        method: String,

        /// Storage root for relative locations
        #[arg(long)]
        host: Option<String>,

        /// Pick up [hosts] aliases and [normalize] rules from a config
        #[arg(long)]
        config: Option<PathBuf>,

        /// Locations to normalize
        #[arg(required = true)]
        locations: Vec<String>,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .without_time(),
        )
        .init();
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(usage_exit_code(e.kind()));
        }
    };
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run(args) => recon::cmd_run(args),
        Commands::Validate { config } => recon::cmd_validate(config),
        Commands::Normalize {
            method,
            host,
            config,
            locations,
        } => recon::cmd_normalize(method, host, config, locations),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
