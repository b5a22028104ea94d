//! JSON registration of middleware pipelines.
//!
//! A pipeline file lists middlewares in the order they run, each tagged
//! with its `type`:
//!
//! ```json
//! {
//!   "middlewares": [
//!     { "type": "long_term_memory", "profile": { "limit": 3 } },
//!     { "type": "context_editing", "max_tokens": 8000 },
//!     { "type": "tool_call_limit", "run": { "limit": 10 } },
//!     { "type": "model_fallback", "fallback_models": [{ "provider": "b", "model": "two" }] }
//!   ]
//! }
//! ```
//!
//! Loading is two-pass. Every entry is first checked against the JSON Schema
//! generated for its config type, so malformed values are reported with
//! their JSON path. Entries that pass are deserialized and checked for the
//! cross-field rules a schema cannot express.

use crate::context::{ContextEditingConfig, ContextEditor};
use crate::error::ConfigError;
use crate::fallback::{ModelFallbackConfig, ModelFallbackRouter, ModelResolver};
use crate::json_schema_for;
use crate::limits::{InMemoryCounterStore, ThreadCounterStore, ToolCallLimitConfig, ToolCallLimiter};
use crate::memory::{LongTermMemoryConfig, LongTermMemoryInjector, MemoryStore};
use crate::pipeline::Pipeline;
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// One registered middleware.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MiddlewareConfig {
    ContextEditing(ContextEditingConfig),
    ToolCallLimit(ToolCallLimitConfig),
    ModelFallback(ModelFallbackConfig),
    LongTermMemory(LongTermMemoryConfig),
}

impl MiddlewareConfig {
    /// Registered `type` names.
    pub const TYPES: [&'static str; 4] = [
        "context_editing",
        "tool_call_limit",
        "model_fallback",
        "long_term_memory",
    ];

    pub fn type_name(&self) -> &'static str {
        match self {
            MiddlewareConfig::ContextEditing(_) => "context_editing",
            MiddlewareConfig::ToolCallLimit(_) => "tool_call_limit",
            MiddlewareConfig::ModelFallback(_) => "model_fallback",
            MiddlewareConfig::LongTermMemory(_) => "long_term_memory",
        }
    }

    /// JSON Schema for the config of a registered `type`.
    pub fn schema_for_type(type_name: &str) -> Option<Value> {
        match type_name {
            "context_editing" => Some(json_schema_for::<ContextEditingConfig>()),
            "tool_call_limit" => Some(json_schema_for::<ToolCallLimitConfig>()),
            "model_fallback" => Some(json_schema_for::<ModelFallbackConfig>()),
            "long_term_memory" => Some(json_schema_for::<LongTermMemoryConfig>()),
            _ => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            MiddlewareConfig::ContextEditing(c) => c.enabled,
            MiddlewareConfig::ToolCallLimit(c) => c.enabled,
            MiddlewareConfig::ModelFallback(c) => c.enabled,
            MiddlewareConfig::LongTermMemory(c) => c.enabled,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            MiddlewareConfig::ContextEditing(c) => c.validate(),
            MiddlewareConfig::ToolCallLimit(c) => c.validate(),
            MiddlewareConfig::ModelFallback(c) => c.validate(),
            MiddlewareConfig::LongTermMemory(c) => c.validate(),
        }
    }
}

/// External services the built middlewares talk to.
#[derive(Clone)]
pub struct Collaborators {
    /// Required when a `model_fallback` entry is enabled.
    pub resolver: Option<Arc<dyn ModelResolver>>,
    /// Without a store, memory injection is a no-op.
    pub memory_store: Option<Arc<dyn MemoryStore>>,
    /// Shared by every `tool_call_limit` entry. Defaults to an in-memory
    /// store.
    pub counter_store: Option<Arc<dyn ThreadCounterStore>>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            resolver: None,
            memory_store: None,
            counter_store: None,
            telemetry: Arc::new(NoopTelemetry),
        }
    }
}

impl Collaborators {
    pub fn with_resolver(mut self, resolver: Arc<dyn ModelResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_memory_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory_store = Some(store);
        self
    }

    pub fn with_counter_store(mut self, store: Arc<dyn ThreadCounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

/// An ordered list of middleware configs.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct PipelineConfig {
    #[serde(default)]
    pub middlewares: Vec<MiddlewareConfig>,
}

impl PipelineConfig {
    /// JSON Schema of a whole pipeline file.
    pub fn schema() -> Value {
        json_schema_for::<PipelineConfig>()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading pipeline config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a pipeline file.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: Value = serde_json::from_str(json)?;
        let entries = match raw.get("middlewares") {
            None => &[][..],
            Some(Value::Array(entries)) => entries.as_slice(),
            Some(_) => {
                return Err(ConfigError::invalid("pipeline", "middlewares", "must be an array"));
            }
        };

        let mut middlewares = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            check_entry(idx, entry)?;
            let config: MiddlewareConfig = serde_json::from_value(entry.clone())?;
            config.validate()?;
            middlewares.push(config);
        }
        Ok(Self { middlewares })
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build the pipeline. Disabled entries are kept so that
    /// [`Pipeline::names`] mirrors the file; the pipeline skips them at run
    /// time.
    pub fn build(&self, collaborators: Collaborators) -> Result<Pipeline, ConfigError> {
        let Collaborators {
            resolver,
            memory_store,
            counter_store,
            telemetry,
        } = collaborators;
        let counter_store =
            counter_store.unwrap_or_else(|| Arc::new(InMemoryCounterStore::new()));

        let mut pipeline = Pipeline::new();
        for config in &self.middlewares {
            config.validate()?;
            pipeline = match config {
                MiddlewareConfig::ContextEditing(c) => pipeline
                    .with(ContextEditor::new(c.clone()).with_telemetry(telemetry.clone())),
                MiddlewareConfig::ToolCallLimit(c) => pipeline.with(
                    ToolCallLimiter::new(c.clone())
                        .with_store(counter_store.clone())
                        .with_telemetry(telemetry.clone()),
                ),
                MiddlewareConfig::ModelFallback(c) => {
                    let resolver: Arc<dyn ModelResolver> = match (&resolver, c.enabled) {
                        (Some(r), _) => r.clone(),
                        (None, false) => Arc::new(crate::fallback::StaticResolver::new()),
                        (None, true) => {
                            return Err(ConfigError::invalid(
                                "model_fallback",
                                "resolver",
                                "no model resolver was provided",
                            ));
                        }
                    };
                    pipeline.with(
                        ModelFallbackRouter::new(c.clone(), resolver)
                            .with_telemetry(telemetry.clone()),
                    )
                }
                MiddlewareConfig::LongTermMemory(c) => {
                    let injector = LongTermMemoryInjector::new(c.clone())
                        .with_telemetry(telemetry.clone());
                    match &memory_store {
                        Some(store) => pipeline.with(injector.with_store(store.clone())),
                        None => pipeline.with(injector),
                    }
                }
            };
        }
        info!("Built pipeline: [{}]", pipeline.names().join(", "));
        Ok(pipeline)
    }
}

/// Check one raw entry against the schema of its `type`.
fn check_entry(idx: usize, entry: &Value) -> Result<(), ConfigError> {
    let Some(type_name) = entry.get("type").and_then(Value::as_str) else {
        return Err(ConfigError::invalid(
            "pipeline",
            format!("middlewares[{idx}].type"),
            format!("must be one of: {}", MiddlewareConfig::TYPES.join(", ")),
        ));
    };
    let Some(schema) = MiddlewareConfig::schema_for_type(type_name) else {
        return Err(ConfigError::invalid(
            "pipeline",
            format!("middlewares[{idx}].type"),
            format!(
                "unknown middleware type '{type_name}' (expected one of: {})",
                MiddlewareConfig::TYPES.join(", ")
            ),
        ));
    };
    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Schema {
        middleware: type_name.to_string(),
        errors: vec![format!("schema could not be compiled: {e}")],
    })?;
    let errors: Vec<String> = validator
        .iter_errors(entry)
        .map(|e| format!("  - middlewares[{idx}]{}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Schema {
            middleware: type_name.to_string(),
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::CollectingTelemetry;

    const FULL: &str = r#"{
        "middlewares": [
            { "type": "long_term_memory", "profile": { "limit": 3, "score_threshold": 0.5 } },
            { "type": "context_editing", "max_tokens": 8000, "exclude_tools": ["read_file"] },
            { "type": "tool_call_limit", "tool_name": "search", "run": { "limit": 2, "exit_behavior": "error" } },
            { "type": "model_fallback", "fallback_models": [{ "provider": "b", "model": "two" }] }
        ]
    }"#;

    #[test]
    fn parses_all_registered_types() {
        let config = PipelineConfig::from_json_str(FULL).unwrap();
        let types: Vec<_> = config.middlewares.iter().map(|m| m.type_name()).collect();
        assert_eq!(
            types,
            vec!["long_term_memory", "context_editing", "tool_call_limit", "model_fallback"]
        );
        let MiddlewareConfig::ContextEditing(editing) = &config.middlewares[1] else {
            panic!("expected context_editing");
        };
        assert_eq!(editing.max_tokens, 8000);
        assert!(editing.exclude_tools.contains("read_file"));
        assert_eq!(editing.keep_recent_turns, 1);
    }

    #[test]
    fn schema_errors_carry_the_path() {
        let err = PipelineConfig::from_json_str(
            r#"{"middlewares":[{"type":"context_editing","max_tokens":"lots"}]}"#,
        )
        .unwrap_err();
        let ConfigError::Schema { middleware, errors } = err else {
            panic!("expected schema error");
        };
        assert_eq!(middleware, "context_editing");
        assert!(errors[0].contains("/max_tokens"), "{errors:?}");
    }

    #[test]
    fn schema_rejects_out_of_range_values() {
        let err = PipelineConfig::from_json_str(
            r#"{"middlewares":[{"type":"long_term_memory","timeout_ms":0}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Schema { .. }), "{err}");

        let err = PipelineConfig::from_json_str(
            r#"{"middlewares":[{"type":"tool_call_limit","run":{"limit":0}}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Schema { .. }), "{err}");
    }

    #[test]
    fn context_editing_trigger_and_keep_fields() {
        let config = PipelineConfig::from_json_str(
            r#"{"middlewares":[{"type":"context_editing","trigger_messages":40,"keep_recent_tokens":2000}]}"#,
        )
        .unwrap();
        let MiddlewareConfig::ContextEditing(editing) = &config.middlewares[0] else {
            panic!("expected context_editing");
        };
        assert_eq!(editing.trigger_messages, Some(40));
        assert_eq!(editing.keep_recent_tokens, Some(2000));

        let err = PipelineConfig::from_json_str(
            r#"{"middlewares":[{"type":"context_editing","trigger_messages":0}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("trigger_messages"), "{err}");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = PipelineConfig::from_json_str(r#"{"middlewares":[{"type":"summarize"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown middleware type 'summarize'"));

        let err = PipelineConfig::from_json_str(r#"{"middlewares":[{"max_tokens":5}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("middlewares[0].type"));
    }

    #[test]
    fn semantic_rules_run_after_schema() {
        let err = PipelineConfig::from_json_str(
            r#"{"middlewares":[{"type":"tool_call_limit","thread":{"limit":2},"run":{"limit":5}}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "run.limit"), "{err}");

        let err =
            PipelineConfig::from_json_str(r#"{"middlewares":[{"type":"tool_call_limit"}]}"#)
                .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }), "{err}");
    }

    #[test]
    fn empty_file_is_an_empty_pipeline() {
        let config = PipelineConfig::from_json_str("{}").unwrap();
        assert!(config.middlewares.is_empty());
        assert!(PipelineConfig::from_json_str(r#"{"middlewares": 3}"#).is_err());
        assert!(PipelineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn build_requires_a_resolver_for_fallback() {
        let config = PipelineConfig::from_json_str(FULL).unwrap();
        assert!(config.build(Collaborators::default()).is_err());

        let telemetry = Arc::new(CollectingTelemetry::new());
        let pipeline = config
            .build(
                Collaborators::default()
                    .with_resolver(Arc::new(crate::fallback::StaticResolver::new()))
                    .with_telemetry(telemetry),
            )
            .unwrap();
        assert_eq!(
            pipeline.names(),
            vec!["long_term_memory", "context_editing", "tool_call_limit", "model_fallback"]
        );
    }

    #[test]
    fn round_trips_through_json() {
        let config = PipelineConfig::from_json_str(FULL).unwrap();
        let text = config.to_json_pretty().unwrap();
        assert_eq!(PipelineConfig::from_json_str(&text).unwrap(), config);
    }

    #[test]
    fn pipeline_schema_lists_every_type() {
        let schema = PipelineConfig::schema().to_string();
        for name in MiddlewareConfig::TYPES {
            assert!(schema.contains(name), "missing {name}");
        }
    }
}
