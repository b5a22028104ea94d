//! Error types for turnstile.

use crate::fallback::AttemptHistory;
use crate::limits::Rejection;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Errors that end a run. Everything else the middlewares encounter is
/// absorbed (logged, flagged, or degraded to a no-op).
#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    #[error("{0}")]
    ToolCallLimitExceeded(Rejection),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error(transparent)]
    Fallback(#[from] FallbackError),

    #[error("Counter store error: {0}")]
    Counter(#[from] CounterError),

    #[error("Run cancelled")]
    Cancelled,
}

/// Failure category of a model invocation.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    Timeout,
    ProviderOutage,
    RateLimited,
    MalformedResponse,
    InvalidRequest,
    AuthenticationFailed,
    Cancelled,
}

impl ModelErrorKind {
    /// Whether another model might succeed where this one failed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ModelErrorKind::Timeout
                | ModelErrorKind::ProviderOutage
                | ModelErrorKind::RateLimited
                | ModelErrorKind::MalformedResponse
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelErrorKind::Timeout => "timeout",
            ModelErrorKind::ProviderOutage => "provider_outage",
            ModelErrorKind::RateLimited => "rate_limited",
            ModelErrorKind::MalformedResponse => "malformed_response",
            ModelErrorKind::InvalidRequest => "invalid_request",
            ModelErrorKind::AuthenticationFailed => "authentication_failed",
            ModelErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed model invocation, as reported by a [`ModelClient`](crate::fallback::ModelClient).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} from {model}: {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub model: String,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            message: message.into(),
        }
    }

    /// Build an error from a free-form provider message, inferring the kind.
    pub fn from_message(model: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = crate::fallback::classify_error_message(&message);
        Self::new(kind, model, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Outcome of a fallback chain that produced no response.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    /// A non-retryable failure, surfaced as the client reported it.
    #[error("{error}")]
    NonRetryable {
        error: ModelError,
        history: AttemptHistory,
    },

    /// Every attempt failed with a retryable error.
    #[error("All {} model attempts failed; last error: {last}. Attempts: {history}", history.len())]
    Exhausted {
        last: ModelError,
        history: AttemptHistory,
    },

    #[error("Model invocation cancelled after {} attempt(s)", history.len())]
    Cancelled { history: AttemptHistory },

    #[error("Model chain is empty")]
    EmptyChain,
}

impl FallbackError {
    /// Attempts made before the chain stopped.
    pub fn history(&self) -> &[crate::fallback::AttemptRecord] {
        match self {
            FallbackError::NonRetryable { history, .. }
            | FallbackError::Exhausted { history, .. }
            | FallbackError::Cancelled { history } => history.records(),
            FallbackError::EmptyChain => &[],
        }
    }

    /// The last model error, if any attempt was made.
    pub fn last_error(&self) -> Option<&ModelError> {
        match self {
            FallbackError::NonRetryable { error, .. } => Some(error),
            FallbackError::Exhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

/// Memory-store failures. The injector never propagates these; they only
/// reach callers that use a [`MemoryStore`](crate::memory::MemoryStore) directly.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Memory store unavailable: {0}")]
    Unavailable(String),

    #[error("Memory query timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Memory query cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid memory store response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Thread counter store failures.
#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt counter file: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Counter store unavailable: {0}")]
    Unavailable(String),
}

/// Configuration registration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Configuration for {middleware} does not match its schema:\n{}", errors.join("\n"))]
    Schema {
        middleware: String,
        errors: Vec<String>,
    },

    #[error("Invalid configuration value for {middleware}.{key}: {message}")]
    InvalidValue {
        middleware: String,
        key: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(
        middleware: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ConfigError::InvalidValue {
            middleware: middleware.into(),
            key: key.into(),
            message: message.into(),
        }
    }
}
