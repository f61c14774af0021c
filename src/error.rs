//! Error taxonomy for external service calls.
//!
//! Everything the pipeline talks to over the network (embedding service,
//! vector index, LLM) reports failures as a [`ServiceError`] so that one
//! retry policy can classify them uniformly: transient errors back off and
//! retry, validation errors fail fast.

use std::time::Duration;

use thiserror::Error;

/// Failure mode of a single external service call.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service throttled us (HTTP 429 or equivalent).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Server-side or network failure (5xx, connection reset, bad payload).
    #[error("service error: {0}")]
    Service(String),

    /// The request itself was malformed; retrying cannot help.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The call exceeded its bounded timeout. Counts as one failed attempt
    /// under the retry policy.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ServiceError {
    /// Whether a retry with backoff could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ServiceError::InvalidInput(_))
    }

    /// Map a reqwest failure into the taxonomy.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout(timeout)
        } else {
            ServiceError::Service(err.to_string())
        }
    }

    /// Classify an HTTP error status plus response body.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status.as_u16() == 429 {
            ServiceError::RateLimited(format!("HTTP 429: {}", body))
        } else if status.is_server_error() {
            ServiceError::Service(format!("HTTP {}: {}", status, body))
        } else {
            ServiceError::InvalidInput(format!("HTTP {}: {}", status, body))
        }
    }
}
