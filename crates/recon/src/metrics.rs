//! Precision/recall against a ground-truth source, plus symmetric pairwise
//! agreement between every pair of sources.
//!
//! Only files inside the shared coverage of the ground truth and the
//! evaluated source are counted. A file one side never looked at says
//! nothing about the other side's accuracy.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::ReconError;
use crate::model::{DetectionKey, FileKey};
use crate::reconcile::Reconciliation;

/// `num / den`, or `None` when the denominator is zero.
fn ratio(num: usize, den: usize) -> Option<f64> {
    if den == 0 {
        None
    } else {
        Some(num as f64 / den as f64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionCounts {
    #[serde(rename = "tp")]
    pub true_positive: usize,
    #[serde(rename = "fp")]
    pub false_positive: usize,
    #[serde(rename = "fn")]
    pub false_negative: usize,
    #[serde(rename = "tn")]
    pub true_negative: usize,
}

impl ConfusionCounts {
    pub fn precision(&self) -> Option<f64> {
        ratio(self.true_positive, self.true_positive + self.false_positive)
    }

    pub fn recall(&self) -> Option<f64> {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    pub fn accuracy(&self) -> Option<f64> {
        ratio(
            self.true_positive + self.true_negative,
            self.true_positive + self.false_positive + self.false_negative + self.true_negative,
        )
    }

    pub fn f1(&self) -> Option<f64> {
        let p = self.precision()?;
        let r = self.recall()?;
        if p + r == 0.0 {
            None
        } else {
            Some(2.0 * p * r / (p + r))
        }
    }

    /// Jaccard index of the two flagged sets inside shared coverage.
    pub fn agreement(&self) -> Option<f64> {
        ratio(
            self.true_positive,
            self.true_positive + self.false_positive + self.false_negative,
        )
    }

    fn record(&mut self, in_truth: bool, in_evaluated: bool) {
        match (in_truth, in_evaluated) {
            (true, true) => self.true_positive += 1,
            (false, true) => self.false_positive += 1,
            (true, false) => self.false_negative += 1,
            (false, false) => {}
        }
    }

    fn flagged_by_either(&self) -> usize {
        self.true_positive + self.false_positive + self.false_negative
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeMetrics {
    pub canonical_type_name: String,
    #[serde(rename = "tp")]
    pub true_positive: usize,
    #[serde(rename = "fp")]
    pub false_positive: usize,
    #[serde(rename = "fn")]
    pub false_negative: usize,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceMetrics {
    pub source_id: String,
    pub shared_files: usize,
    #[serde(flatten)]
    pub counts: ConfusionCounts,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub accuracy: Option<f64>,
    pub f1: Option<f64>,
    pub agreement_rate_vs_ground_truth: Option<f64>,
    pub per_type: Vec<TypeMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairwiseAgreement {
    pub a: String,
    pub b: String,
    pub intersection: usize,
    pub union: usize,
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub ground_truth: String,
    /// Number of distinct canonical types across all sources.
    pub type_universe: usize,
    pub per_source: Vec<SourceMetrics>,
    pub pairwise: Vec<PairwiseAgreement>,
}

impl MetricsReport {
    pub fn source(&self, source_id: &str) -> Option<&SourceMetrics> {
        self.per_source.iter().find(|m| m.source_id == source_id)
    }

    /// Order-insensitive lookup into the agreement matrix.
    pub fn agreement(&self, a: &str, b: &str) -> Option<&PairwiseAgreement> {
        self.pairwise
            .iter()
            .find(|p| (p.a == a && p.b == b) || (p.a == b && p.b == a))
    }
}

pub fn compute_metrics(
    recon: &Reconciliation,
    ground_truth: &str,
) -> Result<MetricsReport, ReconError> {
    let (Some(truth_coverage), Some(truth_flagged)) = (
        recon.coverage.get(ground_truth),
        recon.flagged.get(ground_truth),
    ) else {
        return Err(ReconError::UnknownSource(format!(
            "ground truth '{ground_truth}' is not a reconciled source"
        )));
    };

    let universe = recon.types();

    let per_source = recon
        .sources
        .iter()
        .filter(|s| s.source_id != ground_truth)
        .map(|s| {
            evaluate(
                &s.source_id,
                truth_coverage,
                truth_flagged,
                &recon.coverage[&s.source_id],
                &recon.flagged[&s.source_id],
                universe.len(),
            )
        })
        .collect();

    Ok(MetricsReport {
        ground_truth: ground_truth.to_string(),
        type_universe: universe.len(),
        per_source,
        pairwise: pairwise(&recon.flagged),
    })
}

fn evaluate(
    source_id: &str,
    truth_coverage: &BTreeSet<FileKey>,
    truth_flagged: &BTreeSet<DetectionKey>,
    coverage: &BTreeSet<FileKey>,
    flagged: &BTreeSet<DetectionKey>,
    universe: usize,
) -> SourceMetrics {
    let shared: BTreeSet<&FileKey> = truth_coverage.intersection(coverage).collect();

    let mut counts = ConfusionCounts::default();
    let mut by_type: BTreeMap<&str, ConfusionCounts> = BTreeMap::new();
    for key in truth_flagged.union(flagged) {
        if !shared.contains(&key.0) {
            continue;
        }
        let in_truth = truth_flagged.contains(key);
        let in_evaluated = flagged.contains(key);
        counts.record(in_truth, in_evaluated);
        by_type
            .entry(key.1.as_str())
            .or_default()
            .record(in_truth, in_evaluated);
    }
    counts.true_negative = (shared.len() * universe).saturating_sub(counts.flagged_by_either());

    let per_type = by_type
        .into_iter()
        .map(|(name, c)| TypeMetrics {
            canonical_type_name: name.to_string(),
            true_positive: c.true_positive,
            false_positive: c.false_positive,
            false_negative: c.false_negative,
            precision: c.precision(),
            recall: c.recall(),
        })
        .collect();

    SourceMetrics {
        source_id: source_id.to_string(),
        shared_files: shared.len(),
        counts,
        precision: counts.precision(),
        recall: counts.recall(),
        accuracy: counts.accuracy(),
        f1: counts.f1(),
        agreement_rate_vs_ground_truth: counts.agreement(),
        per_type,
    }
}

/// Jaccard index over flagged pairs for every unordered source pair.
fn pairwise(flagged: &BTreeMap<String, BTreeSet<DetectionKey>>) -> Vec<PairwiseAgreement> {
    let ids: Vec<&String> = flagged.keys().collect();
    let mut out = Vec::new();
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            let fa = &flagged[*a];
            let fb = &flagged[*b];
            let intersection = fa.intersection(fb).count();
            let union = fa.len() + fb.len() - intersection;
            out.push(PairwiseAgreement {
                a: (*a).clone(),
                b: (*b).clone(),
                intersection,
                union,
                rate: ratio(intersection, union),
            });
        }
    }
    out
}
