//! Experiment runner for membership-inference scoring
//!
//! Scores every example of a dataset with a target and a reference model,
//! strictly in order, and attaches the feature record to each example.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use crate::dataset::Example;
use crate::features::infer;
use crate::scorer::Scorer;

/// Configuration for a scoring run
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Model whose training data is being probed
    pub target_model: String,
    /// Model used to calibrate the target's perplexity
    pub ref_model: String,
    /// Base output directory
    pub output_dir: PathBuf,
    /// JSONL path, or hub dataset name
    pub data: String,
    /// Text length of the hub split (`WikiMIA_length{length}`)
    pub length: usize,
    /// Field holding the text to score
    pub key_name: String,
    /// Force CPU for local models
    pub force_cpu: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            target_model: "text-davinci-003".to_string(),
            ref_model: "huggyllama/llama-7b".to_string(),
            output_dir: PathBuf::from("out"),
            data: "swj0419/WikiMIA".to_string(),
            length: 64,
            key_name: "input".to_string(),
            force_cpu: false,
        }
    }
}

impl ExperimentConfig {
    /// `{output_dir}/{target_model}_{ref_model}/{key_name}`
    pub fn run_dir(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}", self.target_model, self.ref_model))
            .join(&self.key_name)
    }
}

/// Dataset driver
pub struct Experiment {
    target: Box<dyn Scorer>,
    reference: Box<dyn Scorer>,
    key_name: String,
}

impl Experiment {
    pub fn new(target: Box<dyn Scorer>, reference: Box<dyn Scorer>, key_name: &str) -> Self {
        Self {
            target,
            reference,
            key_name: key_name.to_string(),
        }
    }

    /// Score one example and attach its prediction
    pub fn infer(&self, mut example: Example) -> Result<Example> {
        let text = example.text(&self.key_name)?;
        let pred = infer(self.target.as_ref(), self.reference.as_ref(), text)?;
        example.set_prediction(pred);
        Ok(example)
    }

    /// Score all examples in order. The first failure aborts the run.
    pub fn evaluate(&self, examples: Vec<Example>) -> Result<Vec<Example>> {
        let total = examples.len();
        info!("all data size: {}", total);
        info!(
            "Target: {}, reference: {}",
            self.target.model_id(),
            self.reference.model_id()
        );

        let mut outputs = Vec::with_capacity(total);
        for (i, example) in examples.into_iter().enumerate() {
            let scored = self
                .infer(example)
                .with_context(|| format!("Example {}/{} failed", i + 1, total))?;
            outputs.push(scored);
            info!("Scored {}/{}", i + 1, total);
        }

        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{PPL_KEY, REFERENCE_KEY};
    use crate::scorer::PerplexityResult;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Scores every text with a fixed log-prob per character
    struct PerChar {
        log_prob: f64,
        calls: Rc<Cell<usize>>,
    }

    impl Scorer for PerChar {
        fn model_id(&self) -> &str {
            "per-char"
        }

        fn score(&self, text: &str) -> Result<PerplexityResult> {
            self.calls.set(self.calls.get() + 1);
            Ok(crate::perplexity::from_loss(vec![self.log_prob; text.len()]))
        }
    }

    fn scorer(log_prob: f64, calls: &Rc<Cell<usize>>) -> Box<dyn Scorer> {
        Box::new(PerChar {
            log_prob,
            calls: Rc::clone(calls),
        })
    }

    fn example(text: &str, label: u8) -> Example {
        match json!({"input": text, "label": label}) {
            serde_json::Value::Object(map) => Example::new(map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ExperimentConfig::default();
        assert_eq!(config.length, 64);
        assert_eq!(config.key_name, "input");
        assert_eq!(
            config.run_dir(),
            PathBuf::from("out/text-davinci-003_huggyllama/llama-7b/input")
        );
    }

    #[test]
    fn test_empty_dataset_scores_nothing() {
        let calls = Rc::new(Cell::new(0));
        let experiment = Experiment::new(scorer(-1.0, &calls), scorer(-1.0, &calls), "input");
        let outputs = experiment.evaluate(Vec::new()).unwrap();
        assert!(outputs.is_empty());
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_order_and_passthrough() {
        let target_calls = Rc::new(Cell::new(0));
        let ref_calls = Rc::new(Cell::new(0));
        let experiment = Experiment::new(
            scorer(-2.0, &target_calls),
            scorer(-0.5, &ref_calls),
            "input",
        );
        let outputs = experiment
            .evaluate(vec![
                example("first text here", 1),
                example("second text here", 0),
            ])
            .unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].text("input").unwrap(), "first text here");
        assert_eq!(outputs[1].label(), Some(false));
        // Target scores original + lower-case, reference scores once
        assert_eq!(target_calls.get(), 4);
        assert_eq!(ref_calls.get(), 2);

        let pred = outputs[0].prediction().unwrap();
        assert!((pred.get(PPL_KEY).unwrap() - 2f64.exp()).abs() < 1e-9);
        assert!((pred.get(REFERENCE_KEY).unwrap() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_missing_text_field_aborts() {
        let calls = Rc::new(Cell::new(0));
        let experiment = Experiment::new(scorer(-1.0, &calls), scorer(-1.0, &calls), "text");
        assert!(experiment.evaluate(vec![example("x", 1)]).is_err());
        assert_eq!(calls.get(), 0);
    }
}
