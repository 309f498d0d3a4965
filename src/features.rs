//! Membership-inference features derived from perplexity scores
//!
//! One [`Prediction`] per text, computed from three scoring passes:
//! the target model on the text, the target model on the lower-cased text,
//! and the reference model on the text.
//!
//! Key names follow the Min-K% Prob reporting convention. The calibration
//! key reads like a perplexity ratio but holds a likelihood *difference*.

use anyhow::{Context, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;

use crate::perplexity::mean;
use crate::scorer::{PerplexityResult, Scorer};

pub const PPL_KEY: &str = "ppl";
pub const REFERENCE_KEY: &str = "ppl/Ref_ppl (calibrate PPL to the reference model)";
pub const LOWERCASE_KEY: &str = "ppl/lowercase_ppl";
pub const ZLIB_KEY: &str = "ppl/zlib";

/// Min-k% ratios, as whole percentages
pub const MIN_K_PERCENTS: [u32; 7] = [5, 10, 20, 30, 40, 50, 60];

/// Key for the min-k% feature at `percent`
pub fn min_k_key(percent: u32) -> String {
    format!("Min_{percent}.0% Prob")
}

/// Named scalar features for one text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prediction(BTreeMap<String, f64>);

impl Prediction {
    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// The `k` smallest values, ascending
pub fn lowest_k(values: &[f64], k: usize) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.truncate(k);
    sorted
}

/// Negated mean of the lowest `floor(n * ratio)` log-probabilities.
///
/// NaN when that count is zero.
pub fn min_k_prob(log_probs: &[f64], ratio: f64) -> f64 {
    let k = (log_probs.len() as f64 * ratio) as usize;
    -mean(&lowest_k(log_probs, k))
}

/// Size in bytes of the zlib-compressed UTF-8 text
pub fn zlib_entropy(text: &str) -> Result<usize> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .context("zlib compression failed")?;
    Ok(encoder.finish().context("zlib compression failed")?.len())
}

/// Combine three scoring passes into the feature record
pub fn compute_features(
    text: &str,
    target: &PerplexityResult,
    lowercase: &PerplexityResult,
    reference: &PerplexityResult,
) -> Result<Prediction> {
    let mut pred = Prediction::default();
    let log_ppl = target.perplexity.ln();

    pred.insert(PPL_KEY, target.perplexity);
    pred.insert(REFERENCE_KEY, target.likelihood - reference.likelihood);
    pred.insert(LOWERCASE_KEY, -(lowercase.perplexity.ln() / log_ppl));
    pred.insert(ZLIB_KEY, log_ppl / zlib_entropy(text)? as f64);

    for percent in MIN_K_PERCENTS {
        let ratio = f64::from(percent) / 100.0;
        pred.insert(min_k_key(percent), min_k_prob(&target.token_log_probs, ratio));
    }

    Ok(pred)
}

/// Score `text` with both models and compute its features
pub fn infer(target: &dyn Scorer, reference: &dyn Scorer, text: &str) -> Result<Prediction> {
    let original = target
        .score(text)
        .with_context(|| format!("Scoring with {} failed", target.model_id()))?;
    let lowercase = target
        .score(&text.to_lowercase())
        .with_context(|| format!("Lower-case scoring with {} failed", target.model_id()))?;
    let calibration = reference
        .score(text)
        .with_context(|| format!("Scoring with {} failed", reference.model_id()))?;

    compute_features(text, &original, &lowercase, &calibration)
}
