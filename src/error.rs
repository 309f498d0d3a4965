//! Error types for the remote completion backend.

use thiserror::Error;

/// Why a completion request was rejected by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The prompt does not fit the model's context window.
    ContextLength,
    /// The `logprobs` parameter is unsupported or above the allowed maximum.
    Logprobs,
    /// Anything else the API rejected.
    Other,
}

impl FailureReason {
    /// Classify an API error message.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("maximum context length") {
            FailureReason::ContextLength
        } else if lower.contains("logprobs") {
            FailureReason::Logprobs
        } else {
            FailureReason::Other
        }
    }

    /// Operator-facing hint for this failure
    pub fn hint(&self) -> &'static str {
        match self {
            FailureReason::ContextLength => {
                "The input text is too long for the model's context window. \
                 Consider using a shorter text or a model with a larger context window."
            }
            FailureReason::Logprobs => {
                "The logprobs parameter is not supported or exceeds the maximum value of 5."
            }
            FailureReason::Other => {
                "Please check the completion API documentation for more details about the error."
            }
        }
    }
}

/// Errors that can occur while requesting a completion.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The API rejected the request (HTTP 400). Retried by the scorer.
    #[error("Bad request ({reason:?}): {message}")]
    BadRequest {
        /// Classified reason.
        reason: FailureReason,
        /// Message returned by the API.
        message: String,
    },

    /// Any other non-success status.
    #[error("API returned error {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Transport-level failure.
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Response did not carry the expected fields.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// All attempts allowed by the retry policy failed.
    #[error("Giving up after {attempts} attempts ({reason:?}): {message}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Reason of the last failure.
        reason: FailureReason,
        /// Message of the last failure.
        message: String,
    },
}

impl CompletionError {
    /// Build a bad-request error, classifying the message.
    pub fn bad_request(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::BadRequest {
            reason: FailureReason::classify(&message),
            message,
        }
    }
}
