//! Unified scoring interface over local and remote backends
//!
//! Both backends answer the same question: how surprised is the model by
//! this text? A [`Scorer`] returns the perplexity, the per-token
//! log-probabilities, and the backend's likelihood statistic.

use anyhow::Result;
use tracing::info;

use crate::model::ScoringModel;
use crate::remote::RemoteScorer;

/// Output of one scoring pass over one text under one model.
#[derive(Debug, Clone, PartialEq)]
pub struct PerplexityResult {
    /// `exp` of the average negative log-likelihood
    pub perplexity: f64,
    /// Per-token log-probabilities, in token order
    pub token_log_probs: Vec<f64>,
    /// Backend likelihood statistic.
    ///
    /// The local backend reports the cross-entropy loss (a positive NLL),
    /// the remote backend reports the mean log-probability. The calibration
    /// feature subtracts these values as-is.
    pub likelihood: f64,
}

/// A model that can score text.
pub trait Scorer {
    /// Identifier of the underlying model
    fn model_id(&self) -> &str;

    /// Score a text.
    fn score(&self, text: &str) -> Result<PerplexityResult>;
}

/// Which backend serves a model identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Weights loaded from the Hugging Face hub and run with candle
    Local,
    /// Completion API over HTTP
    Remote,
}

impl BackendKind {
    /// Detect backend from model ID
    pub fn from_model_id(model_id: &str) -> Self {
        if model_id.contains("davinci") {
            BackendKind::Remote
        } else {
            BackendKind::Local
        }
    }
}

/// Load the scorer for a model identifier.
///
/// `force_cpu` only affects local models.
pub fn load_scorer(model_id: &str, force_cpu: bool) -> Result<Box<dyn Scorer>> {
    let kind = BackendKind::from_model_id(model_id);
    info!("Backend for {}: {:?}", model_id, kind);
    Ok(match kind {
        BackendKind::Remote => Box::new(RemoteScorer::from_env(model_id)?),
        BackendKind::Local => Box::new(ScoringModel::from_pretrained_with_device(
            model_id,
            Some(force_cpu),
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_detection() {
        assert_eq!(
            BackendKind::from_model_id("text-davinci-003"),
            BackendKind::Remote
        );
        assert_eq!(BackendKind::from_model_id("davinci-002"), BackendKind::Remote);
        assert_eq!(
            BackendKind::from_model_id("huggyllama/llama-7b"),
            BackendKind::Local
        );
    }
}
