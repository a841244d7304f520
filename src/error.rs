//! Promptgate error types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Promptgate error types.
///
/// `Clone` so that a single provider outcome can be handed to every caller
/// waiting on the same fingerprint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PromptgateError {
    // Request errors
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("token budget exceeded for tenant '{tenant}': requested {requested}, remaining {remaining}")]
    BudgetExceeded {
        tenant: String,
        requested: u64,
        remaining: u64,
    },

    // Provider/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication with provider failed")]
    AuthenticationFailed,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("no healthy provider available for model '{0}'")]
    NoHealthyProvider(String),

    #[error("no provider configured")]
    NoProvider,

    #[error("empty response from model")]
    EmptyResponse,

    // Data errors
    #[error("JSON error: {0}")]
    Json(String),

    // Store errors
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("job queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Wrapped llm crate error
    #[error("LLM error: {0}")]
    Llm(String),
}

/// Stable error classification exposed to the web layer.
///
/// Each kind maps to a fixed upper-snake code and an HTTP status so that a
/// protocol layer can translate failures without inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    BudgetExceeded,
    ProviderTransient,
    ProviderPermanent,
    CacheUnavailable,
    QueueUnavailable,
    Cancelled,
    NotFound,
    Configuration,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Unauthorized => "AUTHENTICATION_ERROR",
            ErrorKind::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorKind::ProviderTransient => "PROVIDER_TRANSIENT",
            ErrorKind::ProviderPermanent => "PROVIDER_PERMANENT",
            ErrorKind::CacheUnavailable => "CACHE_UNAVAILABLE",
            ErrorKind::QueueUnavailable => "QUEUE_UNAVAILABLE",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::NotFound => "NOT_FOUND_ERROR",
            ErrorKind::Configuration => "INTERNAL_SERVER_ERROR",
        }
    }

    /// HTTP status a web layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Cancelled => 409,
            ErrorKind::BudgetExceeded => 429,
            ErrorKind::ProviderPermanent => 502,
            ErrorKind::ProviderTransient
            | ErrorKind::CacheUnavailable
            | ErrorKind::QueueUnavailable => 503,
            ErrorKind::Configuration => 500,
        }
    }
}

/// Adapter verdict on whether a failed call may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    Permanent,
}

impl PromptgateError {
    /// Default transient/permanent classification.
    ///
    /// Timeouts, rate limits, connection failures and 5xx responses are
    /// transient. Everything else, including 4xx responses, is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            PromptgateError::Http(_)
            | PromptgateError::RateLimited { .. }
            | PromptgateError::Timeout(_)
            | PromptgateError::NoHealthyProvider(_)
            | PromptgateError::EmptyResponse => true,
            PromptgateError::Api { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }

    /// Provider-supplied back-off hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PromptgateError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PromptgateError::Validation(_) | PromptgateError::Json(_) => ErrorKind::Validation,
            PromptgateError::Unauthorized(_) => ErrorKind::Unauthorized,
            PromptgateError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            PromptgateError::CacheUnavailable(_) => ErrorKind::CacheUnavailable,
            PromptgateError::QueueUnavailable(_) => ErrorKind::QueueUnavailable,
            PromptgateError::JobNotFound(_) => ErrorKind::NotFound,
            PromptgateError::Cancelled => ErrorKind::Cancelled,
            PromptgateError::Configuration(_) | PromptgateError::NoProvider => {
                ErrorKind::Configuration
            }
            e if e.is_transient() => ErrorKind::ProviderTransient,
            _ => ErrorKind::ProviderPermanent,
        }
    }
}

impl From<serde_json::Error> for PromptgateError {
    fn from(err: serde_json::Error) -> Self {
        PromptgateError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for PromptgateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return PromptgateError::Http(format!("timeout: {err}"));
        }
        match err.status() {
            Some(status) => PromptgateError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => PromptgateError::Http(err.to_string()),
        }
    }
}

#[cfg(any(feature = "openai", feature = "anthropic"))]
impl From<llm::error::LLMError> for PromptgateError {
    fn from(err: llm::error::LLMError) -> Self {
        // Map llm errors to our error types
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("rate limit") || lower.contains("429") {
            PromptgateError::RateLimited { retry_after: None }
        } else if lower.contains("authentication")
            || lower.contains("401")
            || lower.contains("invalid api key")
        {
            PromptgateError::AuthenticationFailed
        } else if lower.contains("not found") || lower.contains("404") {
            PromptgateError::ModelNotFound(msg)
        } else if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection")
            || lower.contains(" 50")
        {
            PromptgateError::Http(msg)
        } else {
            PromptgateError::Llm(msg)
        }
    }
}

/// Result type alias for Promptgate operations
pub type Result<T> = std::result::Result<T, PromptgateError>;
