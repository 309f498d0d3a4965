//! Qwen2 / Qwen2.5 support
//!
//! Qwen2 is the LLaMA decoder with two differences: Q/K/V projections carry
//! a bias, and small checkpoints tie `lm_head` to the token embeddings.
//! Both are expressed through [`LlamaConfig`], so this module only maps the
//! config and loads weights.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::forward_llama::{CausalLlama, LlamaConfig};

/// Model configuration (matches HuggingFace config.json for Qwen2.5)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Qwen2Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    32768
}

fn default_tie_word_embeddings() -> bool {
    true
}

impl From<Qwen2Config> for LlamaConfig {
    fn from(c: Qwen2Config) -> Self {
        LlamaConfig {
            hidden_size: c.hidden_size,
            intermediate_size: c.intermediate_size,
            num_attention_heads: c.num_attention_heads,
            num_key_value_heads: Some(c.num_key_value_heads),
            num_hidden_layers: c.num_hidden_layers,
            vocab_size: c.vocab_size,
            rope_theta: c.rope_theta,
            rms_norm_eps: c.rms_norm_eps,
            max_position_embeddings: c.max_position_embeddings,
            attention_bias: true,
            tie_word_embeddings: c.tie_word_embeddings,
        }
    }
}

/// Load a Qwen2 model from HuggingFace
pub fn load_qwen2(model_id: &str, device: &Device, dtype: DType) -> Result<CausalLlama> {
    info!("Loading Qwen2 from: {}", model_id);

    let api = Api::new()?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

    let config_path = repo
        .get("config.json")
        .context("Failed to download config.json")?;
    let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
    let config: Qwen2Config = serde_json::from_str(&config_str)?;
    if config.tie_word_embeddings {
        info!("Using tied embeddings for lm_head");
    }

    CausalLlama::from_safetensors(&repo, &config.into(), device, dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qwen2_config_mapping() {
        let qwen: Qwen2Config = serde_json::from_str(
            r#"{"hidden_size": 896, "intermediate_size": 4864,
                "num_attention_heads": 14, "num_key_value_heads": 2,
                "num_hidden_layers": 24, "vocab_size": 151936}"#,
        )
        .unwrap();
        let config: LlamaConfig = qwen.into();

        assert!(config.attention_bias);
        assert!(config.tie_word_embeddings);
        assert_eq!(config.kv_heads(), 2);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.rope_theta, 1_000_000.0);
    }
}
