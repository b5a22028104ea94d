//! Error classification and backoff between fallback attempts.
//!
//! Providers report failures as free-form strings as often as they report
//! typed errors. [`classify_error_message`] maps such strings onto a
//! [`ModelErrorKind`]: HTTP 429/5xx and network trouble are retryable,
//! 400/401/403/404/422 are not.

use crate::error::ModelErrorKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay between fallback attempts. Off by default: fallback models are
/// usually on different providers, so there is nothing to wait out.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub enabled: bool,
    /// Delay before the first fallback attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    #[schemars(range(min = 1.0))]
    pub multiplier: f64,
    /// Scale delays by a deterministic jitter factor.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Enabled backoff with default timings.
    pub fn exponential() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Delay before fallback number `attempt` (0-indexed). Zero when disabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let initial = Duration::from_millis(self.initial_delay_ms).as_secs_f64();
        let max = Duration::from_millis(self.max_delay_ms).as_secs_f64();
        let base = initial * self.multiplier.powi(attempt as i32);
        let capped = base.min(max);

        if self.jitter {
            // Deterministic jitter keyed on the attempt number.
            let jitter_factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                _ => 0.85,
            };
            Duration::from_secs_f64(capped * jitter_factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Infer the failure kind from a provider error string. Unrecognized
/// messages count as a provider outage, so they fall back.
pub fn classify_error_message(error: &str) -> ModelErrorKind {
    const STATUSES: [(&str, ModelErrorKind); 10] = [
        ("HTTP 429", ModelErrorKind::RateLimited),
        ("HTTP 401", ModelErrorKind::AuthenticationFailed),
        ("HTTP 403", ModelErrorKind::AuthenticationFailed),
        ("HTTP 400", ModelErrorKind::InvalidRequest),
        ("HTTP 404", ModelErrorKind::InvalidRequest),
        ("HTTP 422", ModelErrorKind::InvalidRequest),
        ("HTTP 500", ModelErrorKind::ProviderOutage),
        ("HTTP 502", ModelErrorKind::ProviderOutage),
        ("HTTP 503", ModelErrorKind::ProviderOutage),
        ("HTTP 504", ModelErrorKind::Timeout),
    ];
    if let Some((_, kind)) = STATUSES.iter().find(|(status, _)| error.contains(status)) {
        return *kind;
    }

    let lower = error.to_lowercase();
    let contains_any = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));

    if contains_any(&["rate limit", "too many requests"]) {
        ModelErrorKind::RateLimited
    } else if contains_any(&["timed out", "timeout", "deadline exceeded"]) {
        ModelErrorKind::Timeout
    } else if contains_any(&["cancelled", "canceled"]) {
        ModelErrorKind::Cancelled
    } else if contains_any(&["unauthorized", "forbidden", "api key", "authentication"]) {
        ModelErrorKind::AuthenticationFailed
    } else if contains_any(&["malformed", "failed to parse", "invalid json", "unexpected end"]) {
        ModelErrorKind::MalformedResponse
    } else if contains_any(&["invalid", "bad request", "context length"]) {
        ModelErrorKind::InvalidRequest
    } else {
        ModelErrorKind::ProviderOutage
    }
}
