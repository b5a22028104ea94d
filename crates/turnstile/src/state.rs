//! Conversation state shared by every middleware.
//!
//! [`ConversationState`] is passed by value through the pipeline. Middlewares
//! that change the transcript return a new state rather than patching
//! messages in place.

use crate::{Message, MessageRole};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Generate a unique run ID.
pub fn generate_run_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{ts:x}-{count:04x}")
}

/// Per-run bookkeeping, cleared by [`ConversationState::start_run`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunMetadata {
    /// Number of memory records injected into the system prompt this run.
    #[serde(default)]
    pub memories_injected: usize,
    /// Set when the context editor ran out of candidates while still over
    /// its token threshold.
    #[serde(default)]
    pub context_over_budget: bool,
}

/// Ordered transcript plus thread and run bookkeeping.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ConversationState {
    pub thread_id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Mirror of the persisted thread-scope counters, keyed by tool name or
    /// the aggregate key.
    #[serde(default)]
    pub thread_tool_call_counts: BTreeMap<String, u64>,
    /// Run-scope counters; reset at the start of every run.
    #[serde(default)]
    pub run_tool_call_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub run: RunMetadata,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages,
            ..Default::default()
        }
    }

    /// Copy of this state with a different transcript.
    pub fn with_messages(&self, messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..self.clone()
        }
    }

    /// Enter a new run: assign the run ID and clear run-scope counters and
    /// metadata. Thread-scope counters are left untouched.
    pub fn start_run(&mut self, run_id: impl Into<String>) {
        self.run_id = run_id.into();
        self.run_tool_call_counts.clear();
        self.run = RunMetadata::default();
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Text of the most recent human message, trimmed. Empty when there is
    /// none.
    pub fn last_human_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Human)
            .map(|m| m.text().trim().to_string())
            .unwrap_or_default()
    }

    /// Index of the first system message, if any.
    pub fn system_message_index(&self) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.role == MessageRole::System)
    }

    /// Check that every tool result references a tool call of an earlier AI
    /// message. Returns the indices of results that do not.
    pub fn orphaned_results(&self) -> Vec<usize> {
        orphaned_results(&self.messages)
    }
}

/// Indices of tool messages whose `tool_call_id` does not match a tool-call
/// request of a preceding AI message.
pub fn orphaned_results(messages: &[Message]) -> Vec<usize> {
    let mut requested: HashSet<&str> = HashSet::new();
    let mut orphans = Vec::new();
    for (idx, msg) in messages.iter().enumerate() {
        match msg.role {
            MessageRole::Ai => {
                requested.extend(msg.tool_calls.iter().map(|c| c.id.as_str()));
            }
            MessageRole::Tool => {
                let linked = msg
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| requested.contains(id));
                if !linked {
                    orphans.push(idx);
                }
            }
            _ => {}
        }
    }
    orphans
}

/// IDs of tool-call requests with no matching tool result in the transcript.
pub fn unanswered_tool_calls(messages: &[Message]) -> Vec<&str> {
    let answered: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    messages
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .map(|c| c.id.as_str())
        .filter(|id| !answered.contains(id))
        .collect()
}
