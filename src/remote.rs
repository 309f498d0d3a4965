//! Remote completion-API scorer
//!
//! Requests a single-token completion with `logprobs=5`, `echo=false` and
//! turns the returned token log-probabilities into a perplexity. Rejected
//! requests are retried under a bounded [`RetryPolicy`].

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::CompletionError;
use crate::perplexity::from_mean_log_prob;
use crate::scorer::{PerplexityResult, Scorer};

/// Default API base URL
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Highest `logprobs` value the API accepts
pub const MAX_LOGPROBS: u32 = 5;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Retired completion models and their replacement
const MODEL_ALIASES: [(&str, &str); 2] = [
    ("text-davinci-003", "gpt-3.5-turbo-instruct"),
    ("text-davinci-002", "gpt-3.5-turbo-instruct"),
];

/// Map a legacy model identifier to a currently served one
pub fn resolve_model(model_id: &str) -> &str {
    MODEL_ALIASES
        .iter()
        .find(|(old, _)| *old == model_id)
        .map_or(model_id, |(_, new)| *new)
}

/// Completion request body
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub logprobs: u32,
    pub echo: bool,
}

impl CompletionRequest {
    /// Scoring request: one token, full temperature, maximum alternatives
    pub fn for_scoring(model: &str, prompt: &str) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.replace('\0', ""),
            max_tokens: 1,
            temperature: 1.0,
            logprobs: MAX_LOGPROBS,
            echo: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub logprobs: Option<ChoiceLogprobs>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceLogprobs {
    /// `None` where the API could not score a token
    pub token_logprobs: Vec<Option<f64>>,
}

impl CompletionResponse {
    /// Scored token log-probabilities, unscored positions dropped
    pub fn token_log_probs(&self) -> Result<Vec<f64>, CompletionError> {
        let logprobs = self
            .choices
            .first()
            .ok_or_else(|| CompletionError::MalformedResponse("no choices".into()))?
            .logprobs
            .as_ref()
            .ok_or_else(|| CompletionError::MalformedResponse("no logprobs".into()))?;
        Ok(logprobs.token_logprobs.iter().flatten().copied().collect())
    }
}

/// Sends completion requests somewhere.
pub trait CompletionTransport {
    fn complete(&self, request: &CompletionRequest)
        -> Result<CompletionResponse, CompletionError>;
}

/// Blocking HTTP transport for an OpenAI-compatible completions endpoint
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl HttpTransport {
    pub fn new(api_base: &str, api_key: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/completions", api_base.trim_end_matches('/')),
            api_key,
        })
    }

    /// Read `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`
    pub fn from_env() -> Result<Self> {
        let api_key =
            std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
        let api_base =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        Self::new(&api_base, api_key)
    }
}

impl CompletionTransport for HttpTransport {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json()?);
        }

        let body = response.text().unwrap_or_default();
        Err(error_from_response(status, body))
    }
}

/// Map a non-success response onto a [`CompletionError`].
///
/// A 400 becomes the retryable [`CompletionError::BadRequest`], carrying the
/// API's `error.message` when the body parses, the raw body otherwise.
/// Every other status is a non-retryable [`CompletionError::Status`].
pub fn error_from_response(status: StatusCode, body: String) -> CompletionError {
    if status == StatusCode::BAD_REQUEST {
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or(body);
        return CompletionError::bad_request(message);
    }
    CompletionError::Status {
        status: status.as_u16(),
        body,
    }
}

/// Bounded retry for rejected requests. No backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    /// Run `attempt` until it succeeds or the policy gives up.
    ///
    /// Only [`CompletionError::BadRequest`] is retried; any other error is
    /// returned immediately.
    pub fn run<T>(
        &self,
        mut attempt: impl FnMut() -> Result<T, CompletionError>,
    ) -> Result<T, CompletionError> {
        let mut last = None;

        for n in 1..=self.max_attempts {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(CompletionError::BadRequest { reason, message }) => {
                    error!("Completion API error (attempt {n}): {message}");
                    warn!("{}", reason.hint());
                    last = Some((reason, message));
                }
                Err(other) => return Err(other),
            }
        }

        let (reason, message) = last.unwrap_or((
            crate::error::FailureReason::Other,
            "retry policy allows no attempts".to_string(),
        ));
        Err(CompletionError::RetriesExhausted {
            attempts: self.max_attempts,
            reason,
            message,
        })
    }
}

/// Scorer backed by a completion API
pub struct RemoteScorer {
    model_id: String,
    transport: Box<dyn CompletionTransport>,
    retry: RetryPolicy,
}

impl RemoteScorer {
    /// HTTP scorer configured from the environment
    pub fn from_env(model_id: &str) -> Result<Self> {
        Ok(Self::with_transport(
            model_id,
            Box::new(HttpTransport::from_env()?),
            RetryPolicy::default(),
        ))
    }

    pub fn with_transport(
        model_id: &str,
        transport: Box<dyn CompletionTransport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model_id: model_id.to_string(),
            transport,
            retry,
        }
    }
}

impl Scorer for RemoteScorer {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn score(&self, text: &str) -> Result<PerplexityResult> {
        let request = CompletionRequest::for_scoring(resolve_model(&self.model_id), text);
        debug!("Requesting completion from {}", request.model);

        let response = self.retry.run(|| self.transport.complete(&request))?;
        Ok(from_mean_log_prob(response.token_log_probs()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use std::cell::{Cell, RefCell};

    struct Canned {
        calls: Cell<u32>,
        failures_before_success: u32,
        seen: RefCell<Vec<CompletionRequest>>,
    }

    impl CompletionTransport for Canned {
        fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, CompletionError> {
            self.calls.set(self.calls.get() + 1);
            self.seen.borrow_mut().push(request.clone());
            if self.calls.get() <= self.failures_before_success {
                return Err(CompletionError::bad_request("logprobs must be <= 5"));
            }
            Ok(serde_json::from_str(
                r#"{"choices": [{"logprobs": {"token_logprobs": [null, -1.0, -3.0]}}]}"#,
            )
            .unwrap())
        }
    }

    #[test]
    fn test_resolve_model() {
        assert_eq!(resolve_model("text-davinci-003"), "gpt-3.5-turbo-instruct");
        assert_eq!(resolve_model("text-davinci-002"), "gpt-3.5-turbo-instruct");
        assert_eq!(resolve_model("davinci-002"), "davinci-002");
    }

    #[test]
    fn test_request_shape() {
        let req = CompletionRequest::for_scoring("gpt-3.5-turbo-instruct", "a\0b");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["prompt"], "ab");
        assert_eq!(json["max_tokens"], 1);
        assert_eq!(json["temperature"], 1.0);
        assert_eq!(json["logprobs"], 5);
        assert_eq!(json["echo"], false);
    }

    #[test]
    fn test_nulls_are_dropped() {
        let transport = Canned {
            calls: Cell::new(0),
            failures_before_success: 0,
            seen: RefCell::new(Vec::new()),
        };
        let scorer =
            RemoteScorer::with_transport("text-davinci-003", Box::new(transport), RetryPolicy::default());
        let result = scorer.score("hello").unwrap();

        assert_eq!(result.token_log_probs, vec![-1.0, -3.0]);
        assert!((result.likelihood + 2.0).abs() < 1e-12);
        assert!((result.perplexity - 2.0f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn test_recovers_after_transient_rejection() {
        let transport = Canned {
            calls: Cell::new(0),
            failures_before_success: 2,
            seen: RefCell::new(Vec::new()),
        };
        let result = RetryPolicy::default().run(|| {
            transport.complete(&CompletionRequest::for_scoring("m", "p"))
        });
        assert!(result.is_ok());
        assert_eq!(transport.calls.get(), 3);
        assert_eq!(transport.seen.borrow()[0].model, "m");
    }

    #[test]
    fn test_non_retryable_error_fails_fast() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::default().run(|| {
            calls.set(calls.get() + 1);
            Err(CompletionError::Status {
                status: 500,
                body: "boom".into(),
            })
        });
        assert!(matches!(result, Err(CompletionError::Status { status: 500, .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_exhaustion_keeps_last_reason() {
        let result: Result<(), _> = RetryPolicy { max_attempts: 2 }
            .run(|| Err(CompletionError::bad_request("This model's maximum context length is 4097")));
        match result {
            Err(CompletionError::RetriesExhausted {
                attempts, reason, ..
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(reason, FailureReason::ContextLength);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_bad_request_json_body_is_retryable() {
        let body = r#"{"error": {"message": "This model's maximum context length is 4097 tokens", "type": "invalid_request_error"}}"#;
        match error_from_response(StatusCode::BAD_REQUEST, body.to_string()) {
            CompletionError::BadRequest { reason, message } => {
                assert_eq!(reason, FailureReason::ContextLength);
                assert!(message.starts_with("This model's maximum context length"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_bad_request_plain_body_kept_verbatim() {
        match error_from_response(StatusCode::BAD_REQUEST, "bad logprobs value".to_string()) {
            CompletionError::BadRequest { reason, message } => {
                assert_eq!(reason, FailureReason::Logprobs);
                assert_eq!(message, "bad logprobs value");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_server_error_fails_fast_through_policy() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::default().run(|| {
            calls.set(calls.get() + 1);
            Err(error_from_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "upstream down".to_string(),
            ))
        });
        assert!(matches!(
            result,
            Err(CompletionError::Status { status: 500, ref body }) if body == "upstream down"
        ));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_mapped_bad_request_is_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::default().run(|| {
            calls.set(calls.get() + 1);
            Err(error_from_response(
                StatusCode::BAD_REQUEST,
                r#"{"error": {"message": "maximum context length exceeded"}}"#.to_string(),
            ))
        });
        assert!(matches!(
            result,
            Err(CompletionError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_missing_choices_is_error() {
        let response: CompletionResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(response.token_log_probs().is_err());
    }
}
