//! Convenience re-exports for common `turnstile` types.
//!
//! Meant to be glob-imported when wiring middlewares into an agent loop:
//!
//! ```ignore
//! use turnstile::prelude::*;
//! ```
//!
//! Store adapters, telemetry sinks other than the tracing one, and the
//! lower-level editing and retry helpers are left out. Import those from
//! their modules directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ContentPart, Message, MessageContent, MessageRole, ModelRequest, ModelResponse, ModelSpec,
    ToolCall, Usage, json_schema_for,
};

// ── Run state ───────────────────────────────────────────────────────
pub use crate::cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use crate::state::{ConversationState, generate_run_id};

// ── Pipeline ────────────────────────────────────────────────────────
pub use crate::config::{Collaborators, MiddlewareConfig, PipelineConfig};
pub use crate::error::{
    ConfigError, FallbackError, MemoryError, MiddlewareError, ModelError, ModelErrorKind,
};
pub use crate::pipeline::{AgentMiddleware, MiddlewareFuture, Pipeline, ToolGate};

// ── Middlewares ─────────────────────────────────────────────────────
pub use crate::context::{ContextEditingConfig, ContextEditor, TokenCounter, estimate_tokens};
pub use crate::fallback::{
    ModelClient, ModelFallbackConfig, ModelFallbackRouter, ModelFuture, ModelResolver,
    StaticResolver,
};
pub use crate::limits::{
    ExitBehavior, ScopeLimit, ThreadCounterStore, ToolCallLimitConfig, ToolCallLimiter,
};
pub use crate::memory::{
    LongTermMemoryConfig, LongTermMemoryInjector, MemoryFuture, MemoryKind, MemoryRecord,
    MemoryStore,
};

// ── Telemetry ───────────────────────────────────────────────────────
pub use crate::telemetry::{TelemetryEvent, TelemetrySink, TracingTelemetry};
