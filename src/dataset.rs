//! Dataset loading for membership-inference runs
//!
//! Two sources: a local JSONL file (one JSON object per line) or a split of
//! a dataset hosted on the Hugging Face hub, fetched through the
//! datasets-server rows API.

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::features::Prediction;

/// Field the prediction record is attached under
pub const PREDICTION_FIELD: &str = "pred";

/// Field holding the ground-truth membership label
pub const LABEL_FIELD: &str = "label";

/// Seed used to shuffle JSONL datasets
pub const SHUFFLE_SEED: u64 = 0;

const ROWS_ENDPOINT: &str = "https://datasets-server.huggingface.co/rows";
const ROWS_PAGE_SIZE: usize = 100;

/// One dataset record. All fields pass through untouched; the prediction
/// is serialized alongside them under [`PREDICTION_FIELD`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    #[serde(flatten)]
    fields: Map<String, Value>,
    #[serde(rename = "pred", skip_deserializing, skip_serializing_if = "Option::is_none")]
    prediction: Option<Prediction>,
}

impl Example {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            prediction: None,
        }
    }

    /// Text stored under `key`
    pub fn text(&self, key: &str) -> Result<&str> {
        match self.fields.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => bail!("Field '{key}' is not a string: {other}"),
            None => bail!("Example has no field '{key}'"),
        }
    }

    /// Membership label: `true` for training-set members
    pub fn label(&self) -> Option<bool> {
        match self.fields.get(LABEL_FIELD)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|v| v != 0.0),
            _ => None,
        }
    }

    /// Attach a prediction, replacing any `pred` field read from input
    pub fn set_prediction(&mut self, pred: Prediction) {
        self.fields.remove(PREDICTION_FIELD);
        self.prediction = Some(pred);
    }

    pub fn prediction(&self) -> Option<&Prediction> {
        self.prediction.as_ref()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// Ordered collection of examples
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    examples: Vec<Example>,
}

#[derive(Deserialize)]
struct RowsPage {
    rows: Vec<RowEntry>,
    num_rows_total: usize,
}

#[derive(Deserialize)]
struct RowEntry {
    row: Map<String, Value>,
}

impl RowsPage {
    /// Whether this page, fetched at `offset`, ends the split.
    ///
    /// An empty page always does, so a server that under-reports rows
    /// cannot keep the loop alive.
    fn is_last(&self, offset: usize) -> bool {
        self.rows.is_empty() || offset + self.rows.len() >= self.num_rows_total
    }
}

impl Dataset {
    pub fn from_examples(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    /// Resolve a `--data` argument: JSONL path or hub dataset name
    pub fn load(data: &str, length: usize) -> Result<Self> {
        if data.contains("jsonl") {
            Self::load_jsonl(data)
        } else {
            Self::from_hub(data, &format!("WikiMIA_length{length}"))
        }
    }

    /// Read a JSONL file and shuffle it with [`SHUFFLE_SEED`]
    pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut examples = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Map<String, Value> = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: malformed record", path.display(), i + 1))?;
            examples.push(Example::new(fields));
        }
        info!("Loaded {} examples from {}", examples.len(), path.display());

        let mut dataset = Self { examples };
        dataset.shuffle(SHUFFLE_SEED);
        Ok(dataset)
    }

    /// Fetch every row of `split` from a hub dataset
    pub fn from_hub(dataset: &str, split: &str) -> Result<Self> {
        info!("Fetching {}:{} from the Hugging Face hub", dataset, split);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let token = std::env::var("HF_TOKEN").ok();

        let mut examples = Vec::new();
        loop {
            let offset = examples.len();
            let offset_param = offset.to_string();
            let length_param = ROWS_PAGE_SIZE.to_string();
            let mut request = client.get(ROWS_ENDPOINT).query(&[
                ("dataset", dataset),
                ("config", "default"),
                ("split", split),
                ("offset", offset_param.as_str()),
                ("length", length_param.as_str()),
            ]);
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }

            let response = request.send()?.error_for_status().with_context(|| {
                format!("datasets-server rejected {dataset}:{split} at offset {offset}")
            })?;
            let page: RowsPage = response.json()?;
            debug!("Fetched {} rows at offset {}", page.rows.len(), offset);

            let last = page.is_last(offset);
            examples.extend(page.rows.into_iter().map(|r| Example::new(r.row)));
            if last {
                break;
            }
        }
        info!("Loaded {} examples from {}:{}", examples.len(), dataset, split);

        Ok(Self { examples })
    }

    /// Deterministic in-place shuffle
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        self.examples.shuffle(&mut rng);
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn into_examples(self) -> Vec<Example> {
        self.examples
    }
}

/// Write examples as JSONL
pub fn dump_jsonl(examples: &[Example], path: impl AsRef<Path>) -> Result<()> {
    let mut out = String::new();
    for ex in examples {
        out.push_str(&serde_json::to_string(ex)?);
        out.push('\n');
    }
    std::fs::write(path.as_ref(), out)
        .with_context(|| format!("Failed to write {}", path.as_ref().display()))
}
