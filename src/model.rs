//! ScoringModel: a locally loaded causal LM used for perplexity scoring
//!
//! Supports LLaMA-family and Qwen2 checkpoints behind one interface.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, api::sync::ApiRepo, Repo, RepoType};
use std::path::PathBuf;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::forward_llama::CausalLlama;
use crate::forward_qwen2::load_qwen2;
use crate::perplexity::{from_loss, next_token_log_probs};
use crate::scorer::{PerplexityResult, Scorer};

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// LLaMA / Llama-2 / Mistral-style decoders
    Llama,
    /// Qwen2 / Qwen2.5 (Alibaba)
    Qwen2,
}

impl ModelArchitecture {
    /// Detect architecture from model ID
    pub fn from_model_id(model_id: &str) -> Self {
        if model_id.to_lowercase().contains("qwen") {
            ModelArchitecture::Qwen2
        } else {
            ModelArchitecture::Llama
        }
    }
}

/// A causal language model that returns logits for every input position.
pub trait CausalLm {
    fn n_layers(&self) -> usize;
    fn vocab_size(&self) -> usize;

    /// `input_ids`: `[1, seq_len]` → logits `[1, seq_len, vocab]`
    fn forward_logits(&self, input_ids: &Tensor) -> Result<Tensor>;
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Download the weight files of a repo, sharded or not
pub(crate) fn fetch_safetensors(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    let Ok(index_path) = repo.get("model.safetensors.index.json") else {
        let path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        return Ok(vec![path]);
    };

    info!("Model is sharded, loading index...");
    let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
    let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

    let mut shard_names: Vec<String> = index.weight_map.into_values().collect();
    shard_names.sort();
    shard_names.dedup();

    info!("Downloading {} shard files...", shard_names.len());
    shard_names
        .iter()
        .map(|name| {
            repo.get(name)
                .with_context(|| format!("Failed to download {name}"))
        })
        .collect()
}

/// Local model wrapper for perplexity scoring
pub struct ScoringModel {
    model: Box<dyn CausalLm>,
    tokenizer: Tokenizer,
    device: Device,
    architecture: ModelArchitecture,
    model_id: String,
}

impl ScoringModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, None)
    }

    /// Load with explicit device choice (None = auto-detect)
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: Option<bool>) -> Result<Self> {
        let architecture = ModelArchitecture::from_model_id(model_id);

        let (device, dtype) = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    (dev, DType::BF16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        info!("Loading model: {}", model_id);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}, dtype: {:?}", device, dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let model: Box<dyn CausalLm> = match architecture {
            ModelArchitecture::Llama => Box::new(CausalLlama::load(model_id, &device, dtype)?),
            ModelArchitecture::Qwen2 => Box::new(load_qwen2(model_id, &device, dtype)?),
        };

        let scoring = Self::from_parts(model, tokenizer, device, architecture, model_id);
        info!(
            "Model: {} layers, {} vocab",
            scoring.n_layers(),
            scoring.vocab_size()
        );
        Ok(scoring)
    }

    /// Assemble from an already-built model and tokenizer
    pub fn from_parts(
        model: Box<dyn CausalLm>,
        tokenizer: Tokenizer,
        device: Device,
        architecture: ModelArchitecture,
        model_id: &str,
    ) -> Self {
        Self {
            model,
            tokenizer,
            device,
            architecture,
            model_id: model_id.to_string(),
        }
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    /// Tokenize with the tokenizer's default special tokens
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Logits `[seq_len, vocab]` for a token sequence
    pub fn logits(&self, input_ids: &[u32]) -> Result<Tensor> {
        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward_logits(&input)?.squeeze(0)?)
    }
}

impl Scorer for ScoringModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn score(&self, text: &str) -> Result<PerplexityResult> {
        let input_ids = self.encode(text)?;
        debug!("Scoring {} tokens with {}", input_ids.len(), self.model_id);

        // Nothing to predict: no forward pass, NaN statistics.
        if input_ids.len() < 2 {
            return Ok(from_loss(Vec::new()));
        }

        let logits = self.logits(&input_ids)?;
        let log_probs = next_token_log_probs(&logits, &input_ids)?;
        Ok(from_loss(log_probs))
    }
}
