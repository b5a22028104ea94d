//! Agent execution middleware for LLM tool-use loops.
//!
//! `turnstile` sits between an agent's decision loop and the chat model it
//! drives. It provides four interceptors, each with a fixed hook point and an
//! `enabled` switch:
//!
//! - **Context editing** ([`context::ContextEditor`]) prunes old tool results
//!   once the approximate token count crosses a threshold, without ever
//!   breaking the pairing between tool calls and their results.
//! - **Tool-call limits** ([`limits::ToolCallLimiter`]) count tool invocations
//!   per thread (persisted through a counter store) and per run, and refuse
//!   calls past a cap with a configurable exit behavior.
//! - **Model fallback** ([`fallback::ModelFallbackRouter`]) retries a failed
//!   model call against an ordered list of alternative models, but only for
//!   retryable failures.
//! - **Long-term memory** ([`memory::LongTermMemoryInjector`]) queries an
//!   external memory store once per run and appends the results to the system
//!   prompt inside a wrapper that marks them as data, not instructions.
//!
//! The interceptors share one [`ConversationState`](state::ConversationState)
//! and are composed into a [`Pipeline`](pipeline::Pipeline).
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use turnstile::prelude::*;
//!
//! let pipeline = Pipeline::new()
//!     .with(LongTermMemoryInjector::new(LongTermMemoryConfig::default())
//!         .with_store(Arc::new(my_store)))
//!     .with(ContextEditor::new(ContextEditingConfig::new(8_000)))
//!     .with(ToolCallLimiter::new(ToolCallLimitConfig::run_limit(10)))
//!     .with(ModelFallbackRouter::new(fallback_config, Arc::new(my_resolver)));
//!
//! let cancel = CancelSignal::never();
//! let mut state = pipeline.begin_run(state, generate_run_id(), &cancel).await?;
//! loop {
//!     state = pipeline.before_model(state, &cancel).await?;
//!     let request = ModelRequest::new(model.clone(), state.messages.clone());
//!     let response = pipeline.invoke_model(&request, primary.as_ref(), &cancel).await?;
//!     // ... dispatch tool calls through `pipeline.before_tool_call` ...
//! }
//! ```
//!
//! Pipelines can also be assembled from JSON with
//! [`PipelineConfig`](config::PipelineConfig), which validates every entry
//! against its generated JSON Schema before anything is built.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Token estimation and tool-result clearing |
//! | [`limits`] | Tool-call limiter and thread counter stores |
//! | [`fallback`] | Model client/resolver seams, error classification, fallback router |
//! | [`memory`] | Memory store seam, HTTP store adapter, memory injector |
//! | [`pipeline`] | The middleware trait and the pipeline that runs it |
//! | [`config`] | JSON registration and validation of middleware configs |
//! | [`telemetry`] | Structured events and sinks |

pub mod cancel;
pub mod config;
pub mod context;
pub mod error;
pub mod fallback;
pub mod limits;
pub mod memory;
pub mod pipeline;
pub mod prelude;
pub mod state;
pub mod telemetry;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. Used to publish and enforce the shape of every
/// middleware configuration.
///
/// # Example
///
/// ```
/// use turnstile::json_schema_for;
/// use turnstile::context::ContextEditingConfig;
///
/// let schema = json_schema_for::<ContextEditingConfig>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["properties"].get("max_tokens").is_some());
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    Human,
    Ai,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::Human => write!(f, "human"),
            MessageRole::Ai => write!(f, "ai"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// One typed part of a multi-part message. Only `text` parts carry text;
/// everything else is opaque to the middlewares.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// Message content: a plain string or a list of typed parts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// The textual content. For part lists this is the concatenation of all
    /// `text` parts; other parts contribute nothing.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            MessageContent::Text(s) => Cow::Borrowed(s.as_str()),
            MessageContent::Parts(parts) => Cow::Owned(
                parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect(),
            ),
        }
    }

    /// Number of Unicode scalar values in [`text()`](Self::text).
    pub fn char_count(&self) -> usize {
        match self {
            MessageContent::Text(s) => s.chars().count(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    _ => 0,
                })
                .sum(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// A message in the conversation. Messages are never edited in place once
/// they are part of a transcript; edits build replacement messages.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on tool results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn with_role(role: MessageRole, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    pub fn human(content: impl Into<MessageContent>) -> Self {
        Self::with_role(MessageRole::Human, content)
    }

    pub fn ai_text(content: impl Into<MessageContent>) -> Self {
        Self::with_role(MessageRole::Ai, content)
    }

    pub fn ai_tool_calls(content: impl Into<MessageContent>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::with_role(MessageRole::Ai, content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<MessageContent>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::with_role(MessageRole::Tool, content)
        }
    }

    /// Attach the tool name (used on tool results).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Convenience accessor for the textual content.
    pub fn text(&self) -> Cow<'_, str> {
        self.content.text()
    }

    /// Whether this is an AI message that requests at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.role == MessageRole::Ai && !self.tool_calls.is_empty()
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// A tool-call request carried by an AI message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// Copy of this call with its arguments replaced by `{}`.
    pub fn with_cleared_args(&self) -> Self {
        Self {
            args: empty_args(),
            ..self.clone()
        }
    }
}

// ── Model request/response ─────────────────────────────────────────

/// Identifies a chat model as `provider/model`.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
}

impl ModelSpec {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse `provider/model`. A string without a slash becomes a model with
    /// an empty provider.
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((provider, model)) => Self::new(provider, model),
            None => Self::new("", s),
        }
    }
}

impl std::fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.provider.is_empty() {
            write!(f, "{}", self.model)
        } else {
            write!(f, "{}/{}", self.provider, self.model)
        }
    }
}

/// A single model invocation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub model: ModelSpec,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ModelRequest {
    pub fn new(model: ModelSpec, messages: Vec<Message>) -> Self {
        Self {
            model,
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Copy of this request addressed to another model.
    pub fn for_model(&self, model: &ModelSpec) -> Self {
        Self {
            model: model.clone(),
            ..self.clone()
        }
    }
}

/// Token usage reported by a provider.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// The model's reply, tagged with the model that actually produced it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelResponse {
    pub model: ModelSpec,
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ModelResponse {
    pub fn new(model: ModelSpec, message: Message) -> Self {
        Self {
            model,
            message,
            usage: None,
        }
    }
}
