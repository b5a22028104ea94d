//! Structured telemetry events and sinks.
//!
//! Middlewares report notable decisions (fallback transitions, context
//! edits, rejected tool calls, memory injections) to a [`TelemetrySink`].
//! Recording is fire-and-forget: sinks must not block and have no way to
//! fail the run.

use crate::ModelSpec;
use crate::error::ModelErrorKind;
use crate::limits::{ExitBehavior, LimitScope};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// A telemetry event. Every variant carries the UTC time it was created.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A model attempt failed with a retryable error and the router is
    /// moving on to the next model in the chain.
    FallbackTransition {
        failed_model: ModelSpec,
        attempt: usize,
        kind: ModelErrorKind,
        next_model: ModelSpec,
        at: DateTime<Utc>,
    },
    /// Every model in the chain failed.
    FallbackExhausted {
        attempts: usize,
        last_kind: ModelErrorKind,
        at: DateTime<Utc>,
    },
    ContextEdited {
        thread_id: String,
        tokens_before: usize,
        tokens_after: usize,
        cleared_pairs: usize,
        over_budget: bool,
        at: DateTime<Utc>,
    },
    ToolCallRejected {
        thread_id: String,
        tool_name: String,
        scope: LimitScope,
        exit_behavior: ExitBehavior,
        at: DateTime<Utc>,
    },
    MemoriesInjected {
        thread_id: String,
        count: usize,
        at: DateTime<Utc>,
    },
}

impl TelemetryEvent {
    pub fn fallback_transition(
        failed_model: &ModelSpec,
        attempt: usize,
        kind: ModelErrorKind,
        next_model: &ModelSpec,
    ) -> Self {
        TelemetryEvent::FallbackTransition {
            failed_model: failed_model.clone(),
            attempt,
            kind,
            next_model: next_model.clone(),
            at: Utc::now(),
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TelemetryEvent::FallbackTransition { at, .. }
            | TelemetryEvent::FallbackExhausted { at, .. }
            | TelemetryEvent::ContextEdited { at, .. }
            | TelemetryEvent::ToolCallRejected { at, .. }
            | TelemetryEvent::MemoriesInjected { at, .. } => *at,
        }
    }
}

/// Receives telemetry events.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &TelemetryEvent);
}

/// Discards every event.
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _event: &TelemetryEvent) {}
}

/// Logs events via `tracing`.
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::FallbackTransition {
                failed_model,
                attempt,
                kind,
                next_model,
                ..
            } => {
                warn!(
                    failed_model = %failed_model,
                    attempt,
                    kind = %kind,
                    next_model = %next_model,
                    "Model attempt failed, falling back"
                );
            }
            TelemetryEvent::FallbackExhausted {
                attempts,
                last_kind,
                ..
            } => {
                warn!("All {attempts} model attempt(s) failed; last error kind: {last_kind}");
            }
            TelemetryEvent::ContextEdited {
                thread_id,
                tokens_before,
                tokens_after,
                cleared_pairs,
                over_budget,
                ..
            } => {
                info!(
                    "[{thread_id}] context edited: {tokens_before} -> {tokens_after} tokens, \
                     {cleared_pairs} pair(s) cleared{}",
                    if *over_budget { " (still over budget)" } else { "" }
                );
            }
            TelemetryEvent::ToolCallRejected {
                thread_id,
                tool_name,
                scope,
                exit_behavior,
                ..
            } => {
                info!("[{thread_id}] tool call '{tool_name}' rejected at {scope} scope ({exit_behavior})");
            }
            TelemetryEvent::MemoriesInjected {
                thread_id, count, ..
            } => {
                debug!("[{thread_id}] injected {count} memory record(s)");
            }
        }
    }
}

/// Keeps every event in memory. Useful for tests and for callers that
/// forward events in batches.
#[derive(Default)]
pub struct CollectingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl CollectingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TelemetrySink for CollectingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Fans each event out to every registered sink, in registration order.
#[derive(Default)]
pub struct CompositeTelemetry {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl CompositeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Conditionally add a sink. When `condition` is `false`, this is a no-op.
    pub fn with_if(self, condition: bool, sink: Arc<dyn TelemetrySink>) -> Self {
        if condition { self.with(sink) } else { self }
    }

    /// Add a sink from an `Option`. `None` is a no-op.
    pub fn with_opt(self, sink: Option<Arc<dyn TelemetrySink>>) -> Self {
        match sink {
            Some(s) => self.with(s),
            None => self,
        }
    }
}

impl TelemetrySink for CompositeTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}
