//! LLaMA-family causal LM forward pass
//!
//! Runs the full sequence in one pass and returns logits at every position,
//! which is what teacher-forced scoring needs. No KV-cache, no sampling.
//!
//! Covers LLaMA / Llama-2 / Mistral-style checkpoints. Qwen2 reuses the same
//! decoder with biased Q/K/V projections and tied embeddings (see
//! `forward_qwen2`).

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear_b, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{info, warn};

use crate::masks::causal_mask;
use crate::model::{fetch_safetensors, CausalLm};

/// Model configuration (matches HuggingFace config.json for LLaMA)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    /// Absent in original LLaMA configs (full MHA)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Bias on Q/K/V projections
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }
}

/// RoPE tables, `[max_position_embeddings, head_dim / 2]`
///
/// Longer inputs get tables computed for their own length, as HF's dynamic
/// rotary embedding does, instead of being rejected.
struct RotaryEmbedding {
    inv_freq: Tensor,
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &LlamaConfig, device: &Device, dtype: DType) -> Result<Self> {
        let dim = config.head_dim();
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1.0 / config.rope_theta.powf(i as f64 / dim as f64) as f32)
            .collect();
        let n_freq = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, n_freq), device)?;

        let (cos, sin) = Self::tables(&inv_freq, config.max_position_embeddings, dtype)?;
        Ok(Self { inv_freq, cos, sin })
    }

    fn tables(inv_freq: &Tensor, len: usize, dtype: DType) -> Result<(Tensor, Tensor)> {
        let positions = Tensor::arange(0u32, len as u32, inv_freq.device())?
            .to_dtype(DType::F32)?
            .reshape((len, 1))?;
        let freqs = positions.matmul(inv_freq)?;
        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }

    /// Rotate `[batch, heads, seq, head_dim]` queries or keys
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(2)?;
        let (cos, sin) = if seq_len <= self.cos.dim(0)? {
            (
                self.cos.narrow(0, 0, seq_len)?,
                self.sin.narrow(0, 0, seq_len)?,
            )
        } else {
            Self::tables(&self.inv_freq, seq_len, x.dtype())?
        };
        Ok(candle_nn::rotary_emb::rope(&x.contiguous()?, &cos, &sin)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv, seq_len, head_dim) = x.dims4()?;
    Ok(x
        .unsqueeze(2)?
        .expand((b, n_kv, n_rep, seq_len, head_dim))?
        .reshape((b, n_kv * n_rep, seq_len, head_dim))?)
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let kv_dim = config.kv_heads() * head_dim;
        let bias = config.attention_bias;

        Ok(Self {
            q_proj: linear_b(
                config.hidden_size,
                config.num_attention_heads * head_dim,
                bias,
                vb.pp("q_proj"),
            )?,
            k_proj: linear_b(config.hidden_size, kv_dim, bias, vb.pp("k_proj"))?,
            v_proj: linear_b(config.hidden_size, kv_dim, bias, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(
                config.num_attention_heads * head_dim,
                config.hidden_size,
                vb.pp("o_proj"),
            )?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.kv_heads(),
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let split_heads = |t: Tensor, heads: usize| -> Result<Tensor> {
            Ok(t.reshape((b, seq_len, heads, self.head_dim))?
                .transpose(1, 2)?)
        };
        let q = split_heads(self.q_proj.forward(x)?, self.num_heads)?;
        let k = split_heads(self.k_proj.forward(x)?, self.num_kv_heads)?;
        let v = split_heads(self.v_proj.forward(x)?, self.num_kv_heads)?;

        let q = rotary.apply(&q)?;
        let k = rotary.apply(&k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(&causal_mask(seq_len, x.device(), x.dtype())?)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;

        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

/// SwiGLU feed-forward block
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(h, i, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(h, i, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(i, h, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let attn = self
            .self_attn
            .forward(&self.input_layernorm.forward(x)?, rotary)?;
        let x = (x + attn)?;
        let mlp = self.mlp.forward(&self.post_attention_layernorm.forward(&x)?)?;
        Ok((x + mlp)?)
    }
}

/// LLaMA-family decoder producing next-token logits at every position
pub struct CausalLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// `None` when the output projection is tied to the embeddings
    lm_head: Option<Linear>,
    rotary: RotaryEmbedding,
    n_layers: usize,
    vocab_size: usize,
    max_seq_len: usize,
}

impl CausalLlama {
    /// Load model from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading LLaMA from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: LlamaConfig = serde_json::from_str(&config_str)?;

        Self::from_safetensors(&repo, &config, device, dtype)
    }

    pub(crate) fn from_safetensors(
        repo: &hf_hub::api::sync::ApiRepo,
        config: &LlamaConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );

        let weights_paths = fetch_safetensors(repo)?;
        info!("Loading weights from {} file(s)...", weights_paths.len());

        // SAFETY: the files are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        Self::from_var_builder(vb, config)
    }

    /// Build the model from any weight source
    ///
    /// Tensor names follow the HuggingFace layout (`model.embed_tokens`,
    /// `model.layers.{i}.self_attn.q_proj`, ..., `lm_head`). With
    /// `tie_word_embeddings` no `lm_head` is read and logits are projected
    /// through the embedding matrix.
    ///
    /// # Returns
    ///
    /// A model whose [`CausalLm::forward_logits`] maps `[1, seq_len]` token
    /// ids to `[1, seq_len, vocab_size]` logits.
    ///
    /// # Example
    ///
    /// A zero-weight model, whose logits are all zero:
    /// ```text
    /// let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    /// let model = CausalLlama::from_var_builder(vb, &config)?;
    /// ```
    pub fn from_var_builder(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(
                vb_model.pp(format!("layers.{i}")),
                config,
            )?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let rotary = RotaryEmbedding::new(config, vb.device(), vb.dtype())?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            n_layers: config.num_hidden_layers,
            vocab_size: config.vocab_size,
            max_seq_len: config.max_position_embeddings,
        })
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        match &self.lm_head {
            Some(lm_head) => Ok(lm_head.forward(hidden)?),
            None => Ok(hidden.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?),
        }
    }
}

impl CausalLm for CausalLlama {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn forward_logits(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(D::Minus1)?;
        if seq_len > self.max_seq_len {
            warn!(
                "Sequence of {} tokens exceeds the model context of {}",
                seq_len, self.max_seq_len
            );
        }

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &self.rotary)?;
        }
        let hidden = self.norm.forward(&hidden)?;
        self.project_to_vocab(&hidden)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_nn::VarMap;
    use serial_test::serial;

    pub(crate) fn tiny_config(vocab_size: usize) -> LlamaConfig {
        LlamaConfig {
            hidden_size: 16,
            intermediate_size: 32,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            num_hidden_layers: 2,
            vocab_size,
            rope_theta: 10_000.0,
            rms_norm_eps: 1e-6,
            max_position_embeddings: 64,
            attention_bias: false,
            tie_word_embeddings: false,
        }
    }

    #[test]
    fn test_config_defaults() {
        let config: LlamaConfig = serde_json::from_str(
            r#"{"hidden_size": 4096, "intermediate_size": 11008,
                "num_attention_heads": 32, "num_hidden_layers": 32,
                "vocab_size": 32000}"#,
        )
        .unwrap();
        assert_eq!(config.kv_heads(), 32);
        assert_eq!(config.head_dim(), 128);
        assert!(!config.attention_bias);
        assert!(!config.tie_word_embeddings);
    }

    #[test]
    #[serial]
    fn test_logits_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalLlama::from_var_builder(vb, &tiny_config(11)).unwrap();

        let ids = Tensor::new(&[1u32, 4, 2, 7, 3], &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let logits = model.forward_logits(&ids).unwrap();
        assert_eq!(logits.dims(), &[1, 5, 11]);
    }

    #[test]
    #[serial]
    fn test_tied_embeddings() {
        let mut config = tiny_config(9);
        config.tie_word_embeddings = true;
        config.attention_bias = true;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalLlama::from_var_builder(vb, &config).unwrap();
        assert!(model.lm_head.is_none());

        let ids = Tensor::new(&[0u32, 1, 2], &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        assert_eq!(model.forward_logits(&ids).unwrap().dims(), &[1, 3, 9]);
    }

    #[test]
    #[serial]
    fn test_scores_past_configured_context() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalLlama::from_var_builder(vb, &tiny_config(5)).unwrap();

        // max_position_embeddings is 64
        let long: Vec<u32> = (0..70u32).map(|i| i % 5).collect();
        let long_ids = Tensor::new(long.as_slice(), &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let logits = model.forward_logits(&long_ids).unwrap();
        assert_eq!(logits.dims(), &[1, 70, 5]);

        // Causal: the first 64 positions do not depend on what follows
        let prefix_ids = long_ids.narrow(1, 0, 64).unwrap();
        let prefix = model.forward_logits(&prefix_ids).unwrap();
        let a: Vec<f32> = logits
            .narrow(1, 0, 64)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = prefix.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    #[serial]
    fn test_mask_cache_bounded_across_lengths() {
        crate::masks::clear_mask_cache();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = CausalLlama::from_var_builder(vb, &tiny_config(5)).unwrap();

        for len in [7, 3, 40, 12, 2, 39] {
            let ids = Tensor::zeros((1, len), DType::U32, &Device::Cpu).unwrap();
            assert_eq!(model.forward_logits(&ids).unwrap().dims(), &[1, len, 5]);
        }
        assert_eq!(crate::masks::mask_cache_len(), 1);
    }
}
