//! Teacher-forced log-likelihood extraction
//!
//! Given the logits of a causal LM over a token sequence, the model's
//! prediction at position `i` scores the token at position `i + 1`.
//! The first token is never scored.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor, D};

use crate::scorer::PerplexityResult;

/// Log-probability of each actual next token.
///
/// `logits` has shape `[seq_len, vocab]` and `input_ids` has `seq_len`
/// entries. Row `i` of the log-softmax is read at column `input_ids[i + 1]`;
/// the last row predicts past the text and is dropped.
///
/// # Returns
///
/// `seq_len - 1` log-probabilities in token order, empty for fewer than
/// 2 tokens. Values are computed in F32 whatever the logits dtype.
///
/// # Example
///
/// For ids `[BOS, the, cat]`:
/// ```text
/// [log p(the | BOS), log p(cat | BOS the)]
/// ```
pub fn next_token_log_probs(logits: &Tensor, input_ids: &[u32]) -> Result<Vec<f64>> {
    if input_ids.len() < 2 {
        return Ok(Vec::new());
    }
    let n = input_ids.len() - 1;

    let logits = logits.to_dtype(DType::F32)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let predictions = log_probs.narrow(0, 0, n)?.contiguous()?;

    let targets = Tensor::new(&input_ids[1..], logits.device())?.unsqueeze(1)?;
    let picked: Vec<f32> = predictions
        .gather(&targets, 1)
        .context("Failed to gather next-token log-probs")?
        .squeeze(1)?
        .to_vec1()?;

    Ok(picked.into_iter().map(f64::from).collect())
}

/// Arithmetic mean, NaN for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Local-model result: loss is the mean NLL, perplexity is `exp(loss)`.
pub fn from_loss(token_log_probs: Vec<f64>) -> PerplexityResult {
    let loss = -mean(&token_log_probs);
    PerplexityResult {
        perplexity: loss.exp(),
        token_log_probs,
        likelihood: loss,
    }
}

/// Remote-API result: perplexity is `exp(-mean)`, likelihood is the mean.
pub fn from_mean_log_prob(token_log_probs: Vec<f64>) -> PerplexityResult {
    let mean_log_prob = mean(&token_log_probs);
    PerplexityResult {
        perplexity: (-mean_log_prob).exp(),
        token_log_probs,
        likelihood: mean_log_prob,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_next_token_log_probs_uniform() {
        // Zero logits: every token has probability 1/4
        let logits = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let lp = next_token_log_probs(&logits, &[0, 1, 2]).unwrap();
        assert_eq!(lp.len(), 2);
        for v in lp {
            assert!((v - (0.25f64).ln()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_next_token_log_probs_picks_target() {
        // Position 0 strongly predicts token 2, position 1 predicts token 0
        let logits = Tensor::new(
            &[[0.0f32, 0.0, 10.0], [10.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
            &Device::Cpu,
        )
        .unwrap();
        let lp = next_token_log_probs(&logits, &[1, 2, 1]).unwrap();
        assert_eq!(lp.len(), 2);
        // Token 2 at position 1 was the favourite
        assert!(lp[0] > -0.01);
        // Token 1 at position 2 was not
        assert!(lp[1] < -9.0);
    }

    #[test]
    fn test_short_input_is_empty() {
        let logits = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(next_token_log_probs(&logits, &[3]).unwrap().is_empty());
        assert!(next_token_log_probs(&logits, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_perplexity_is_exp_loss() {
        let result = from_loss(vec![-1.0, -2.0, -3.0]);
        assert!((result.likelihood - 2.0).abs() < 1e-12);
        assert!((result.perplexity - 2.0f64.exp()).abs() < 1e-9);
        assert!(result.perplexity >= 1.0);
    }

    #[test]
    fn test_remote_likelihood_is_mean() {
        let result = from_mean_log_prob(vec![-0.5, -1.5]);
        assert!((result.likelihood + 1.0).abs() < 1e-12);
        assert!((result.perplexity - 1.0f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn test_empty_mean_is_nan() {
        assert!(mean(&[]).is_nan());
        assert!(from_loss(Vec::new()).perplexity.is_nan());
    }
}
