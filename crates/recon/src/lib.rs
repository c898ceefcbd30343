//! `crossdetect-recon`: cross-method detection reconciliation engine.
//!
//! Loads result sets from independent discovery methods, aligns them on a
//! canonical `(file, type)` identity and reports agreement and accuracy
//! against a ground-truth source. No CLI or network dependencies; the live
//! type catalog plugs in through [`resolver::AuthoritativeSource`].

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod reconcile;
pub mod report;
pub mod resolver;
pub mod schema;

pub use config::{RunConfig, SourceConfig};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use engine::{run, RunOutcome};
pub use error::ReconError;
pub use metrics::{compute_metrics, MetricsReport};
pub use model::{FileKey, ReconResult, SourceDataset, SourceMethod};
pub use normalize::{normalize, NormalizerTable};
pub use reconcile::{reconcile, Reconciliation};
pub use report::{generate, ReportOptions};
pub use resolver::{AuthoritativeSource, LookupError, TypeResolver};
