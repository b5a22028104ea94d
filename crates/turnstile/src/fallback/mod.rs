//! Model fallback: retry a failed model call against alternative models.
//!
//! The chain is the request's own model followed by the configured
//! `fallback_models`. Attempts run strictly one after another. A
//! non-retryable failure (bad request, authentication, cancellation) stops
//! the chain immediately; retryable failures move on to the next model until
//! the chain or `max_attempts` runs out.
//!
//! Clients are reached through two seams: [`ModelClient`] invokes a model,
//! [`ModelResolver`] turns a [`ModelSpec`] into a client.

pub mod retry;
pub mod router;

pub use retry::{BackoffConfig, classify_error_message};
pub use router::ModelFallbackRouter;

use crate::error::{ConfigError, ModelError, ModelErrorKind};
use crate::{ModelRequest, ModelResponse, ModelSpec};
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Boxed future returned by [`ModelClient::invoke`].
pub type ModelFuture<'a> = BoxFuture<'a, Result<ModelResponse, ModelError>>;

/// A chat model.
pub trait ModelClient: Send + Sync {
    fn invoke<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a>;
}

/// Builds clients for fallback models.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, spec: &ModelSpec) -> Result<Arc<dyn ModelClient>, ModelError>;
}

/// Resolver over a fixed set of pre-built clients.
#[derive(Default)]
pub struct StaticResolver {
    clients: HashMap<ModelSpec, Arc<dyn ModelClient>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, spec: ModelSpec, client: Arc<dyn ModelClient>) -> Self {
        self.clients.insert(spec, client);
        self
    }
}

impl ModelResolver for StaticResolver {
    /// Unknown models resolve to a provider-outage error, so the chain moves
    /// on to the next model.
    fn resolve(&self, spec: &ModelSpec) -> Result<Arc<dyn ModelClient>, ModelError> {
        self.clients.get(spec).cloned().ok_or_else(|| {
            ModelError::new(
                ModelErrorKind::ProviderOutage,
                spec.to_string(),
                "no client registered for model",
            )
        })
    }
}

/// Configuration for [`ModelFallbackRouter`].
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ModelFallbackConfig {
    pub enabled: bool,
    /// Models tried, in order, after the primary fails.
    pub fallback_models: Vec<ModelSpec>,
    /// Cap on total attempts, primary included. Unset: the whole chain.
    #[schemars(range(min = 1))]
    pub max_attempts: Option<usize>,
    pub backoff: BackoffConfig,
}

impl Default for ModelFallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_models: Vec::new(),
            max_attempts: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ModelFallbackConfig {
    pub fn new(fallback_models: Vec<ModelSpec>) -> Self {
        Self {
            fallback_models,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const NAME: &str = "model_fallback";
        if self.enabled && self.fallback_models.is_empty() {
            return Err(ConfigError::invalid(
                NAME,
                "fallback_models",
                "at least one fallback model is required",
            ));
        }
        if let Some(idx) = self.fallback_models.iter().position(|m| m.model.is_empty()) {
            return Err(ConfigError::invalid(
                NAME,
                format!("fallback_models[{idx}].model"),
                "must not be empty",
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::invalid(NAME, "max_attempts", "must be at least 1"));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::invalid(NAME, "backoff.multiplier", "must be at least 1.0"));
        }
        Ok(())
    }
}

/// One failed attempt in a fallback chain.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Position in the chain; the primary is 0.
    pub index: usize,
    pub model: ModelSpec,
    pub kind: ModelErrorKind,
    pub message: String,
}

/// Ordered failed attempts of one invocation.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptHistory(Vec<AttemptRecord>);

impl AttemptHistory {
    pub fn push(&mut self, index: usize, model: &ModelSpec, error: &ModelError) {
        self.0.push(AttemptRecord {
            index,
            model: model.clone(),
            kind: error.kind,
            message: error.message.clone(),
        });
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for AttemptHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, record) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(
                f,
                "#{} {}: {} ({})",
                record.index, record.model, record.kind, record.message
            )?;
        }
        Ok(())
    }
}
