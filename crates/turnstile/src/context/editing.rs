//! Tool-result clearing: replace old tool results with a placeholder once the
//! transcript grows past a token threshold.
//!
//! Tool results dominate context in most agent loops and are rarely needed
//! verbatim once the model has acted on them. The editor walks AI turns from
//! oldest to newest and clears each turn's results as a unit, re-estimating
//! after every turn and stopping as soon as the transcript fits.
//!
//! A turn is only cleared when all of its results are present. Results are
//! replaced, never removed, so every tool message keeps the `tool_call_id`
//! of its originating call and no request is left without a result.

use super::estimator::{ApproxTokenCounter, TokenCounter};
use crate::cancel::CancelSignal;
use crate::error::ConfigError;
use crate::pipeline::{AgentMiddleware, MiddlewareFuture};
use crate::state::{ConversationState, orphaned_results};
use crate::telemetry::{NoopTelemetry, TelemetryEvent, TelemetrySink};
use crate::{Message, MessageRole, ToolCall};
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Content written into cleared tool results.
///
/// Both the writer and the "already cleared?" check use the configured
/// placeholder, which defaults to this value.
pub const DEFAULT_PLACEHOLDER: &str = "[cleared]";

/// Default token threshold.
pub const DEFAULT_MAX_TOKENS: usize = 100_000;

/// Pruning strategies, applied in the order configured.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EditStrategy {
    /// Replace the results of whole tool-calling turns with the placeholder.
    ClearToolUses,
}

/// Configuration for [`ContextEditor`].
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ContextEditingConfig {
    pub enabled: bool,
    /// Token threshold. The editor does nothing while the estimate is at or
    /// below this value, unless `trigger_messages` fires.
    #[schemars(range(min = 1))]
    pub max_tokens: usize,
    /// Also edit once the transcript holds at least this many messages.
    /// A pass started by this trigger alone has no token target and clears
    /// every eligible turn.
    #[schemars(range(min = 1))]
    pub trigger_messages: Option<usize>,
    #[schemars(length(min = 1))]
    pub edits: Vec<EditStrategy>,
    #[schemars(length(min = 1))]
    pub placeholder: String,
    /// Tools whose results are never cleared.
    pub exclude_tools: BTreeSet<String>,
    /// Also replace the arguments of cleared calls with `{}`.
    pub clear_tool_inputs: bool,
    /// Number of most recent tool-calling AI turns that are never cleared.
    #[schemars(range(min = 1))]
    pub keep_recent_turns: usize,
    /// Extend the protected window backwards over recent turns whose
    /// results fit in this many tokens.
    pub keep_recent_tokens: Option<usize>,
    /// Drop tool messages that reference no tool call before estimating.
    pub remove_orphans: bool,
}

impl Default for ContextEditingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: DEFAULT_MAX_TOKENS,
            trigger_messages: None,
            edits: vec![EditStrategy::ClearToolUses],
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
            exclude_tools: BTreeSet::new(),
            clear_tool_inputs: false,
            keep_recent_turns: 1,
            keep_recent_tokens: None,
            remove_orphans: true,
        }
    }
}

impl ContextEditingConfig {
    /// Default configuration with the given token threshold.
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }

    /// Never clear results of the named tool.
    pub fn exclude_tool(mut self, name: impl Into<String>) -> Self {
        self.exclude_tools.insert(name.into());
        self
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }

    pub fn with_keep_recent_turns(mut self, turns: usize) -> Self {
        self.keep_recent_turns = turns;
        self
    }

    pub fn with_trigger_messages(mut self, messages: usize) -> Self {
        self.trigger_messages = Some(messages);
        self
    }

    pub fn with_keep_recent_tokens(mut self, tokens: usize) -> Self {
        self.keep_recent_tokens = Some(tokens);
        self
    }

    pub fn with_clear_tool_inputs(mut self, clear: bool) -> Self {
        self.clear_tool_inputs = clear;
        self
    }

    pub fn with_remove_orphans(mut self, remove: bool) -> Self {
        self.remove_orphans = remove;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const NAME: &str = "context_editing";
        if self.max_tokens == 0 {
            return Err(ConfigError::invalid(NAME, "max_tokens", "must be at least 1"));
        }
        if self.edits.is_empty() {
            return Err(ConfigError::invalid(NAME, "edits", "at least one strategy is required"));
        }
        if self.placeholder.is_empty() {
            return Err(ConfigError::invalid(NAME, "placeholder", "must not be empty"));
        }
        if self.keep_recent_turns == 0 {
            return Err(ConfigError::invalid(NAME, "keep_recent_turns", "must be at least 1"));
        }
        if self.trigger_messages == Some(0) {
            return Err(ConfigError::invalid(NAME, "trigger_messages", "must be at least 1"));
        }
        Ok(())
    }
}

/// Result of one [`ContextEditor::edit`] pass.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub state: ConversationState,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub cleared_pairs: usize,
    pub removed_orphans: usize,
    /// The editor ran out of candidates while still above the threshold.
    pub over_budget: bool,
}

impl EditOutcome {
    /// Whether the transcript was modified.
    pub fn changed(&self) -> bool {
        self.cleared_pairs > 0 || self.removed_orphans > 0
    }
}

/// Prunes tool results before each model call.
pub struct ContextEditor {
    config: ContextEditingConfig,
    counter: Arc<dyn TokenCounter>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ContextEditor {
    pub fn new(config: ContextEditingConfig) -> Self {
        Self {
            config,
            counter: Arc::new(ApproxTokenCounter),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Replace the token counter.
    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &ContextEditingConfig {
        &self.config
    }

    /// Run the configured strategies over `state`. Never fails; the input
    /// state is left untouched.
    pub fn edit(&self, state: &ConversationState) -> EditOutcome {
        let tokens_before = self.counter.count(&state.messages);
        if !self.config.enabled {
            return EditOutcome {
                state: state.clone(),
                tokens_before,
                tokens_after: tokens_before,
                cleared_pairs: 0,
                removed_orphans: 0,
                over_budget: false,
            };
        }

        let mut messages = state.messages.clone();
        let mut removed_orphans = 0;
        if self.config.remove_orphans {
            let orphans = orphaned_results(&messages);
            removed_orphans = orphans.len();
            for idx in orphans.into_iter().rev() {
                messages.remove(idx);
            }
        }

        let mut tokens = if removed_orphans > 0 {
            self.counter.count(&messages)
        } else {
            tokens_before
        };
        let mut cleared_pairs = 0;
        if self.should_edit(&messages, tokens) {
            // Without a token overrun there is nothing to stop at.
            let target = (tokens > self.config.max_tokens).then_some(self.config.max_tokens);
            for strategy in &self.config.edits {
                if target.is_some_and(|max| tokens <= max) {
                    break;
                }
                cleared_pairs += match strategy {
                    EditStrategy::ClearToolUses => {
                        self.clear_tool_uses(&mut messages, &mut tokens, target)
                    }
                };
            }
        }

        let over_budget = tokens > self.config.max_tokens;
        if over_budget {
            warn!(
                "[{}] context still over budget after editing: {tokens}/{} tokens, {cleared_pairs} pair(s) cleared",
                state.thread_id, self.config.max_tokens
            );
        } else if cleared_pairs > 0 || removed_orphans > 0 {
            debug!(
                "[{}] context edited: {tokens_before} -> {tokens} tokens, {cleared_pairs} pair(s) cleared, {removed_orphans} orphan(s) removed",
                state.thread_id
            );
        }

        let mut edited = state.with_messages(messages);
        edited.run.context_over_budget = over_budget;
        EditOutcome {
            state: edited,
            tokens_before,
            tokens_after: tokens,
            cleared_pairs,
            removed_orphans,
            over_budget,
        }
    }

    fn should_edit(&self, messages: &[Message], tokens: usize) -> bool {
        tokens > self.config.max_tokens
            || self
                .config
                .trigger_messages
                .is_some_and(|n| messages.len() >= n)
    }

    /// Clear eligible turns oldest-first until `tokens` fits in `target`,
    /// or all of them when there is no target. Returns the number of turns
    /// cleared.
    fn clear_tool_uses(
        &self,
        messages: &mut [Message],
        tokens: &mut usize,
        target: Option<usize>,
    ) -> usize {
        let turns: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.has_tool_calls())
            .map(|(idx, _)| idx)
            .collect();
        let protected = self.protected_turns(messages, &turns);
        let candidates = &turns[..turns.len().saturating_sub(protected)];

        let mut cleared = 0;
        for &ai_idx in candidates {
            if target.is_some_and(|max| *tokens <= max) {
                break;
            }
            let ai = &messages[ai_idx];
            if ai
                .tool_calls
                .iter()
                .any(|c| self.config.exclude_tools.contains(&c.name))
            {
                continue;
            }
            // Skip turns with a missing result: clearing them would not
            // make the pair any more valid.
            let Some(results) = ai
                .tool_calls
                .iter()
                .map(|c| find_result(messages, ai_idx, &c.id))
                .collect::<Option<Vec<usize>>>()
            else {
                continue;
            };
            if results.iter().any(|&idx| self.is_cleared(&messages[idx])) {
                continue;
            }

            for idx in results {
                messages[idx] = self.placeholder_for(&messages[idx]);
            }
            if self.config.clear_tool_inputs {
                let ai = &messages[ai_idx];
                messages[ai_idx] = Message {
                    tool_calls: ai.tool_calls.iter().map(ToolCall::with_cleared_args).collect(),
                    ..ai.clone()
                };
            }
            cleared += 1;
            *tokens = self.counter.count(messages);
        }
        cleared
    }

    /// Size of the keep window: `keep_recent_turns`, or more when
    /// `keep_recent_tokens` covers more of the newest turns.
    fn protected_turns(&self, messages: &[Message], turns: &[usize]) -> usize {
        let by_count = self.config.keep_recent_turns.max(1);
        let Some(budget) = self.config.keep_recent_tokens else {
            return by_count;
        };
        let mut used = 0;
        let by_tokens = turns
            .iter()
            .rev()
            .take_while(|&&ai_idx| {
                let results: Vec<Message> = messages[ai_idx]
                    .tool_calls
                    .iter()
                    .filter_map(|c| find_result(messages, ai_idx, &c.id))
                    .map(|idx| messages[idx].clone())
                    .collect();
                used += self.counter.count(&results);
                used <= budget
            })
            .count();
        by_count.max(by_tokens)
    }

    fn is_cleared(&self, message: &Message) -> bool {
        message.text() == self.config.placeholder.as_str()
    }

    fn placeholder_for(&self, result: &Message) -> Message {
        Message {
            role: MessageRole::Tool,
            content: self.config.placeholder.as_str().into(),
            tool_calls: Vec::new(),
            tool_call_id: result.tool_call_id.clone(),
            name: result.name.clone(),
        }
    }
}

/// Index of the tool result answering `call_id`, searching after `ai_idx`.
fn find_result(messages: &[Message], ai_idx: usize, call_id: &str) -> Option<usize> {
    messages
        .iter()
        .enumerate()
        .skip(ai_idx + 1)
        .find(|(_, m)| m.role == MessageRole::Tool && m.tool_call_id.as_deref() == Some(call_id))
        .map(|(idx, _)| idx)
}

impl AgentMiddleware for ContextEditor {
    fn name(&self) -> &str {
        "context_editing"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn before_model<'a>(
        &'a self,
        state: ConversationState,
        _cancel: &'a CancelSignal,
    ) -> MiddlewareFuture<'a, ConversationState> {
        Box::pin(async move {
            let outcome = self.edit(&state);
            if outcome.changed() || outcome.over_budget {
                self.telemetry.record(&TelemetryEvent::ContextEdited {
                    thread_id: state.thread_id.clone(),
                    tokens_before: outcome.tokens_before,
                    tokens_after: outcome.tokens_after,
                    cleared_pairs: outcome.cleared_pairs,
                    over_budget: outcome.over_budget,
                    at: Utc::now(),
                });
            }
            Ok(outcome.state)
        })
    }
}
