// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64 for token counts
#![allow(clippy::cast_possible_truncation)] // f64→usize in min-k selection
#![allow(clippy::cast_sign_loss)] // ratio products are non-negative
#![allow(clippy::module_name_repetitions)] // ScoringModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Method style pedantic:
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)] // VarBuilder is passed by value in candle

//! mink-rs: Min-K% Prob membership inference
//!
//! Detects whether a text was part of a language model's training data by
//! scoring it under a target model and a reference model, turning the
//! scores into perplexity-based features, and evaluating each feature as a
//! membership classifier on labelled data.
//!
//! ## Architecture
//!
//! - `scorer`: The [`Scorer`] trait and backend selection
//! - `model`: Local [`ScoringModel`] (candle + hf-hub + tokenizers)
//! - `forward_llama`: LLaMA-family forward pass producing full-sequence logits
//! - `forward_qwen2`: Qwen2 checkpoints on top of the LLaMA decoder
//! - `masks`: Cached causal attention masks
//! - `perplexity`: Teacher-forced log-probs and perplexity statistics
//! - `remote`: Completion-API scorer with bounded retry
//! - `error`: Typed completion-API errors
//! - `features`: Min-k%, zlib, lowercase and reference-calibrated features
//! - `dataset`: JSONL and hub dataset loading
//! - `experiment`: Runner that scores a dataset end to end
//! - `report`: ROC / AUC / TPR@5%FPR evaluation and result files

pub mod dataset;
pub mod error;
pub mod experiment;
pub mod features;
pub mod forward_llama;
pub mod forward_qwen2;
pub mod masks;
pub mod model;
pub mod perplexity;
pub mod remote;
pub mod report;
pub mod scorer;

pub use dataset::{dump_jsonl, Dataset, Example};
pub use error::{CompletionError, FailureReason};
pub use experiment::{Experiment, ExperimentConfig};
pub use features::{compute_features, infer, min_k_prob, zlib_entropy, Prediction};
pub use forward_llama::{CausalLlama, LlamaConfig};
pub use forward_qwen2::Qwen2Config;
pub use masks::causal_mask;
pub use model::{CausalLm, ModelArchitecture, ScoringModel};
pub use remote::{CompletionTransport, HttpTransport, RemoteScorer, RetryPolicy};
pub use report::{write_report, MetricReport};
pub use scorer::{load_scorer, BackendKind, PerplexityResult, Scorer};
