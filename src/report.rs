//! ROC evaluation of membership-inference features
//!
//! Every feature is treated as an attack score where *lower* means "more
//! likely a training member" (low perplexity ⇒ seen in training), so the
//! sweep runs over the negated score.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

use crate::dataset::{dump_jsonl, Example};

/// FPR bound for the low-FPR operating point
pub const LOW_FPR: f64 = 0.05;

/// Points of a receiver operating characteristic curve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// Score threshold of each point; the first is `+inf`
    #[serde(skip)]
    pub thresholds: Vec<f64>,
}

/// ROC curve for `scores` (higher ⇒ positive) against `labels`.
///
/// Collinear intermediate points are dropped; a `(0, 0)` point is prepended.
/// Needs at least one positive and one negative label.
pub fn roc_curve(scores: &[f64], labels: &[bool]) -> Result<RocCurve> {
    if scores.len() != labels.len() {
        bail!("{} scores but {} labels", scores.len(), labels.len());
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    // Cumulative counts at the last index of each distinct score
    let mut tps = Vec::new();
    let mut fps = Vec::new();
    let mut thresholds = Vec::new();
    let mut tp = 0.0;
    for (rank, &i) in order.iter().enumerate() {
        if labels[i] {
            tp += 1.0;
        }
        let last_of_run = order
            .get(rank + 1)
            .map_or(true, |&next| scores[next] != scores[i]);
        if last_of_run {
            tps.push(tp);
            fps.push((rank + 1) as f64 - tp);
            thresholds.push(scores[i]);
        }
    }

    let (Some(&total_pos), Some(&total_neg)) = (tps.last(), fps.last()) else {
        bail!("ROC curve needs at least one sample");
    };
    if total_pos == 0.0 || total_neg == 0.0 {
        bail!("ROC curve needs both positive and negative labels");
    }

    let n = tps.len();
    let keep = |k: usize| {
        k == 0
            || k == n - 1
            || fps[k + 1] - 2.0 * fps[k] + fps[k - 1] != 0.0
            || tps[k + 1] - 2.0 * tps[k] + tps[k - 1] != 0.0
    };

    let mut curve = RocCurve {
        fpr: vec![0.0],
        tpr: vec![0.0],
        thresholds: vec![f64::INFINITY],
    };
    for k in (0..n).filter(|&k| keep(k)) {
        curve.fpr.push(fps[k] / total_neg);
        curve.tpr.push(tps[k] / total_pos);
        curve.thresholds.push(thresholds[k]);
    }
    Ok(curve)
}

/// Area under a curve by the trapezoidal rule
pub fn auc(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[0] + ys[1]) / 2.0)
        .sum()
}

/// Summary of one feature's attack performance
#[derive(Debug, Clone, Serialize)]
pub struct MetricReport {
    pub metric: String,
    pub auc: f64,
    /// Best balanced accuracy over all thresholds
    pub accuracy: f64,
    /// TPR at the last operating point with FPR below [`LOW_FPR`]
    pub tpr_at_low_fpr: f64,
    pub roc: RocCurve,
}

impl MetricReport {
    /// Sweep thresholds over `-score`
    pub fn sweep(metric: &str, scores: &[f64], labels: &[bool]) -> Result<Self> {
        let negated: Vec<f64> = scores.iter().map(|s| -s).collect();
        let roc = roc_curve(&negated, labels)?;

        let accuracy = roc
            .fpr
            .iter()
            .zip(&roc.tpr)
            .map(|(f, t)| 1.0 - (f + (1.0 - t)) / 2.0)
            .fold(f64::NEG_INFINITY, f64::max);
        let tpr_at_low_fpr = roc
            .fpr
            .iter()
            .zip(&roc.tpr)
            .filter(|(f, _)| **f < LOW_FPR)
            .map(|(_, t)| *t)
            .last()
            .unwrap_or(0.0);

        Ok(Self {
            metric: metric.to_string(),
            auc: auc(&roc.fpr, &roc.tpr),
            accuracy,
            tpr_at_low_fpr,
            roc,
        })
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{}   AUC {:.4}, Accuracy {:.4}, TPR@5%FPR of {:.4}",
            self.metric, self.auc, self.accuracy, self.tpr_at_low_fpr
        )
    }
}

/// Evaluate every feature present in the annotated examples.
///
/// Features with non-finite values are skipped with a warning.
pub fn evaluate_features(outputs: &[Example]) -> Result<Vec<MetricReport>> {
    let mut labels = Vec::with_capacity(outputs.len());
    let mut by_metric: BTreeMap<&str, Vec<f64>> = BTreeMap::new();

    for (i, ex) in outputs.iter().enumerate() {
        labels.push(
            ex.label()
                .with_context(|| format!("Example {} has no usable label", i + 1))?,
        );
        let pred = ex
            .prediction()
            .with_context(|| format!("Example {} has no prediction", i + 1))?;
        for (metric, value) in pred.iter() {
            by_metric.entry(metric).or_default().push(value);
        }
    }

    let mut reports = Vec::new();
    for (metric, scores) in by_metric {
        if scores.len() != labels.len() {
            warn!("Skipping {metric}: present in only {} examples", scores.len());
            continue;
        }
        if let Some(bad) = scores.iter().find(|s| !s.is_finite()) {
            warn!("Skipping {metric}: non-finite value {bad}");
            continue;
        }
        match MetricReport::sweep(metric, &scores, &labels) {
            Ok(report) => {
                info!("Attack {}", report.summary_line());
                reports.push(report);
            }
            Err(e) => warn!("Skipping {metric}: {e}"),
        }
    }

    Ok(reports)
}

/// Persist annotated examples and per-feature ROC summaries to `dir`.
///
/// Writes `predictions.jsonl`, `auc.txt` and `roc.json`.
pub fn write_report(outputs: &[Example], dir: &Path) -> Result<Vec<MetricReport>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    dump_jsonl(outputs, dir.join("predictions.jsonl"))?;

    let reports = evaluate_features(outputs)?;

    let mut summary = String::new();
    for report in &reports {
        writeln!(summary, "{}", report.summary_line())?;
    }
    std::fs::write(dir.join("auc.txt"), summary)?;

    let curves: BTreeMap<&str, &RocCurve> = reports
        .iter()
        .map(|r| (r.metric.as_str(), &r.roc))
        .collect();
    std::fs::write(dir.join("roc.json"), serde_json::to_string_pretty(&curves)?)?;

    info!("Report written to {}", dir.display());
    Ok(reports)
}
