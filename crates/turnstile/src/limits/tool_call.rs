//! The tool-call limiter.

use super::store::{InMemoryCounterStore, ThreadCounterStore};
use crate::cancel::CancelSignal;
use crate::error::{ConfigError, MiddlewareError};
use crate::pipeline::{AgentMiddleware, MiddlewareFuture, ToolGate};
use crate::state::ConversationState;
use crate::telemetry::{NoopTelemetry, TelemetryEvent, TelemetrySink};
use crate::{Message, ToolCall};
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counter key used when no tool filter is configured: every tool call
/// counts towards it.
pub const ALL_TOOLS_KEY: &str = "__all__";

/// What happens to a call that exceeds a limit. Variants are ordered by
/// severity; when both scopes are exceeded the more severe one applies.
#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum ExitBehavior {
    /// Skip the call and hand the model an empty tool result.
    Block,
    /// Skip the call and hand the model a tool result explaining the limit.
    #[default]
    InjectMessage,
    /// End the run with [`MiddlewareError::ToolCallLimitExceeded`].
    Error,
}

impl std::fmt::Display for ExitBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitBehavior::Block => write!(f, "block"),
            ExitBehavior::InjectMessage => write!(f, "inject_message"),
            ExitBehavior::Error => write!(f, "error"),
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Thread,
    Run,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitScope::Thread => write!(f, "thread"),
            LimitScope::Run => write!(f, "run"),
        }
    }
}

/// Cap for one scope.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScopeLimit {
    #[schemars(range(min = 1))]
    pub limit: u64,
    #[serde(default)]
    pub exit_behavior: ExitBehavior,
}

impl ScopeLimit {
    pub fn new(limit: u64, exit_behavior: ExitBehavior) -> Self {
        Self {
            limit,
            exit_behavior,
        }
    }
}

/// Configuration for [`ToolCallLimiter`].
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ToolCallLimitConfig {
    pub enabled: bool,
    /// Only count and limit this tool. Unset: every call counts towards the
    /// aggregate key.
    pub tool_name: Option<String>,
    pub thread: Option<ScopeLimit>,
    pub run: Option<ScopeLimit>,
}

impl Default for ToolCallLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tool_name: None,
            thread: None,
            run: None,
        }
    }
}

impl ToolCallLimitConfig {
    /// Aggregate run-scope limit with the default exit behavior.
    pub fn run_limit(limit: u64) -> Self {
        Self::default().with_run(ScopeLimit::new(limit, ExitBehavior::default()))
    }

    /// Aggregate thread-scope limit with the default exit behavior.
    pub fn thread_limit(limit: u64) -> Self {
        Self::default().with_thread(ScopeLimit::new(limit, ExitBehavior::default()))
    }

    pub fn with_run(mut self, limit: ScopeLimit) -> Self {
        self.run = Some(limit);
        self
    }

    pub fn with_thread(mut self, limit: ScopeLimit) -> Self {
        self.thread = Some(limit);
        self
    }

    /// Restrict counting to one tool.
    pub fn for_tool(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const NAME: &str = "tool_call_limit";
        if self.thread.is_none() && self.run.is_none() {
            return Err(ConfigError::invalid(
                NAME,
                "thread",
                "at least one of thread or run must be set",
            ));
        }
        if self.thread.is_some_and(|l| l.limit == 0) {
            return Err(ConfigError::invalid(NAME, "thread.limit", "must be at least 1"));
        }
        if self.run.is_some_and(|l| l.limit == 0) {
            return Err(ConfigError::invalid(NAME, "run.limit", "must be at least 1"));
        }
        if let (Some(thread), Some(run)) = (self.thread, self.run)
            && run.limit > thread.limit
        {
            return Err(ConfigError::invalid(
                NAME,
                "run.limit",
                format!(
                    "run limit ({}) cannot exceed thread limit ({})",
                    run.limit, thread.limit
                ),
            ));
        }
        if self.tool_name.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::invalid(NAME, "tool_name", "must not be empty"));
        }
        Ok(())
    }
}

/// Post-increment counter values for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub thread: u64,
    pub run: u64,
}

/// Outcome of [`ToolCallLimiter::check_and_increment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The call may execute. `None` when the call is not counted by this
    /// limiter (disabled, or filtered to another tool).
    Admitted(Option<CallCounts>),
    Rejected(Rejection),
}

/// A refused tool call and the limits it ran into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// The requested tool.
    pub tool_name: String,
    /// The limiter's tool filter, if any.
    pub limited_tool: Option<String>,
    /// Scope whose exit behavior applies.
    pub scope: LimitScope,
    pub exit_behavior: ExitBehavior,
    pub counts: CallCounts,
    pub thread_limit: Option<u64>,
    pub run_limit: Option<u64>,
}

impl Rejection {
    /// Text handed to the model in place of the tool's output. Avoids
    /// thread/run vocabulary beyond the limits themselves.
    pub fn limit_message(&self) -> String {
        let mut limits = Vec::new();
        if let Some(l) = self.thread_limit {
            limits.push(format!("thread limit: {l}"));
        }
        if let Some(l) = self.run_limit {
            limits.push(format!("run limit: {l}"));
        }
        let limits = if limits.is_empty() {
            String::new()
        } else {
            format!(" ({})", limits.join(", "))
        };
        match &self.limited_tool {
            Some(tool) => format!("Tool call limit exceeded{limits}. Do not call '{tool}' again."),
            None => format!("Tool call limit exceeded{limits}. Do not make additional tool calls."),
        }
    }

    /// Synthetic tool result for a skipped call.
    pub fn tool_message(&self, call_id: &str) -> Message {
        let content = match self.exit_behavior {
            ExitBehavior::Block => String::new(),
            ExitBehavior::InjectMessage | ExitBehavior::Error => self.limit_message(),
        };
        Message::tool_result(call_id, content).with_name(self.tool_name.as_str())
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut exceeded = Vec::new();
        if let Some(l) = self.thread_limit
            && self.counts.thread > l
        {
            exceeded.push(format!("thread limit exceeded ({}/{l} calls)", self.counts.thread));
        }
        if let Some(l) = self.run_limit
            && self.counts.run > l
        {
            exceeded.push(format!("run limit exceeded ({}/{l} calls)", self.counts.run));
        }
        match &self.limited_tool {
            Some(tool) => write!(f, "'{tool}' tool call limit reached: {}.", exceeded.join(" and ")),
            None => write!(f, "Tool call limit reached: {}.", exceeded.join(" and ")),
        }
    }
}

/// Counts tool calls and refuses those past the configured caps.
pub struct ToolCallLimiter {
    config: ToolCallLimitConfig,
    store: Arc<dyn ThreadCounterStore>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ToolCallLimiter {
    /// Limiter backed by a fresh [`InMemoryCounterStore`].
    pub fn new(config: ToolCallLimitConfig) -> Self {
        Self {
            config,
            store: Arc::new(InMemoryCounterStore::new()),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ThreadCounterStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &ToolCallLimitConfig {
        &self.config
    }

    /// Key this limiter counts under: the filtered tool name, or
    /// [`ALL_TOOLS_KEY`].
    pub fn count_key(&self) -> &str {
        self.config.tool_name.as_deref().unwrap_or(ALL_TOOLS_KEY)
    }

    /// Whether calls to `tool_name` count towards this limiter.
    pub fn counts(&self, tool_name: &str) -> bool {
        self.config.enabled
            && self
                .config
                .tool_name
                .as_deref()
                .is_none_or(|filter| filter == tool_name)
    }

    /// Reset the run counter and refresh the thread-counter mirror from the
    /// store.
    pub async fn begin_run(
        &self,
        state: &mut ConversationState,
        cancel: &CancelSignal,
    ) -> Result<(), MiddlewareError> {
        if !self.config.enabled {
            return Ok(());
        }
        let key = self.count_key();
        state.run_tool_call_counts.remove(key);
        let thread_count = cancel
            .run(self.store.get(&state.thread_id, key))
            .await
            .ok_or(MiddlewareError::Cancelled)??;
        state
            .thread_tool_call_counts
            .insert(key.to_string(), thread_count);
        Ok(())
    }

    /// Count a requested call and decide whether it may run. The thread
    /// counter is incremented atomically in the store before it is compared,
    /// so denied calls are counted too. Counting never goes backwards.
    pub async fn check_and_increment(
        &self,
        state: &mut ConversationState,
        tool_name: &str,
        cancel: &CancelSignal,
    ) -> Result<Admission, MiddlewareError> {
        if !self.counts(tool_name) {
            return Ok(Admission::Admitted(None));
        }
        let key = self.count_key();

        let thread = cancel
            .run(self.store.increment(&state.thread_id, key))
            .await
            .ok_or(MiddlewareError::Cancelled)??;
        state.thread_tool_call_counts.insert(key.to_string(), thread);
        let run_slot = state.run_tool_call_counts.entry(key.to_string()).or_insert(0);
        *run_slot += 1;
        let counts = CallCounts {
            thread,
            run: *run_slot,
        };

        let thread_over = self
            .config
            .thread
            .filter(|l| counts.thread > l.limit)
            .map(|l| (LimitScope::Thread, l.exit_behavior));
        let run_over = self
            .config
            .run
            .filter(|l| counts.run > l.limit)
            .map(|l| (LimitScope::Run, l.exit_behavior));
        let Some((scope, exit_behavior)) = thread_over
            .into_iter()
            .chain(run_over)
            .max_by_key(|(_, behavior)| *behavior)
        else {
            debug!(
                "[{}] tool '{tool_name}' admitted ({key}: thread={}, run={})",
                state.thread_id, counts.thread, counts.run
            );
            return Ok(Admission::Admitted(Some(counts)));
        };

        let rejection = Rejection {
            tool_name: tool_name.to_string(),
            limited_tool: self.config.tool_name.clone(),
            scope,
            exit_behavior,
            counts,
            thread_limit: self.config.thread.map(|l| l.limit),
            run_limit: self.config.run.map(|l| l.limit),
        };
        warn!("[{}] {rejection} Exit behavior: {exit_behavior}", state.thread_id);
        self.telemetry.record(&TelemetryEvent::ToolCallRejected {
            thread_id: state.thread_id.clone(),
            tool_name: tool_name.to_string(),
            scope,
            exit_behavior,
            at: Utc::now(),
        });
        Ok(Admission::Rejected(rejection))
    }
}

impl AgentMiddleware for ToolCallLimiter {
    fn name(&self) -> &str {
        "tool_call_limit"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn before_run<'a>(
        &'a self,
        mut state: ConversationState,
        cancel: &'a CancelSignal,
    ) -> MiddlewareFuture<'a, ConversationState> {
        Box::pin(async move {
            self.begin_run(&mut state, cancel).await?;
            Ok(state)
        })
    }

    fn before_tool_call<'a>(
        &'a self,
        state: &'a mut ConversationState,
        call: &'a ToolCall,
        cancel: &'a CancelSignal,
    ) -> MiddlewareFuture<'a, ToolGate> {
        Box::pin(async move {
            match self.check_and_increment(state, &call.name, cancel).await? {
                Admission::Admitted(_) => Ok(ToolGate::Proceed),
                Admission::Rejected(rejection) => match rejection.exit_behavior {
                    ExitBehavior::Error => Err(MiddlewareError::ToolCallLimitExceeded(rejection)),
                    ExitBehavior::Block | ExitBehavior::InjectMessage => {
                        Ok(ToolGate::Skip(rejection.tool_message(&call.id)))
                    }
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use serde_json::json;

    fn state(thread: &str) -> ConversationState {
        let mut state = ConversationState::new(thread, vec![]);
        state.start_run("r1");
        state
    }

    fn run_limit(limit: u64, behavior: ExitBehavior) -> ToolCallLimitConfig {
        ToolCallLimitConfig::default().with_run(ScopeLimit::new(limit, behavior))
    }

    async fn admit(
        limiter: &ToolCallLimiter,
        state: &mut ConversationState,
        tool: &str,
    ) -> Admission {
        limiter
            .check_and_increment(state, tool, &CancelSignal::never())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fourth_call_is_denied_at_limit_three() {
        let limiter = ToolCallLimiter::new(run_limit(3, ExitBehavior::Block));
        let mut state = state("t");
        for expected in 1..=3 {
            assert_eq!(
                admit(&limiter, &mut state, "search").await,
                Admission::Admitted(Some(CallCounts {
                    thread: expected,
                    run: expected
                }))
            );
        }
        let Admission::Rejected(rejection) = admit(&limiter, &mut state, "search").await else {
            panic!("fourth call should be rejected");
        };
        assert_eq!(rejection.scope, LimitScope::Run);
        assert_eq!(rejection.counts.run, 4);
        // Denied calls are counted.
        assert!(matches!(
            admit(&limiter, &mut state, "search").await,
            Admission::Rejected(Rejection { counts: CallCounts { run: 5, .. }, .. })
        ));
        assert_eq!(state.run_tool_call_counts.get(ALL_TOOLS_KEY), Some(&5));
    }

    #[tokio::test]
    async fn run_counter_resets_but_thread_counter_persists() {
        let store: Arc<dyn ThreadCounterStore> = Arc::new(InMemoryCounterStore::new());
        let config = ToolCallLimitConfig::default()
            .with_thread(ScopeLimit::new(4, ExitBehavior::Error))
            .with_run(ScopeLimit::new(2, ExitBehavior::Block));
        let limiter = ToolCallLimiter::new(config).with_store(store.clone());
        let cancel = CancelSignal::never();

        let mut state = state("t");
        limiter.begin_run(&mut state, &cancel).await.unwrap();
        assert!(matches!(admit(&limiter, &mut state, "a").await, Admission::Admitted(_)));
        assert!(matches!(admit(&limiter, &mut state, "b").await, Admission::Admitted(_)));
        assert!(matches!(admit(&limiter, &mut state, "c").await, Admission::Rejected(_)));

        // New run: run counter starts over, thread counter continues at 3.
        state.start_run("r2");
        limiter.begin_run(&mut state, &cancel).await.unwrap();
        assert_eq!(state.thread_tool_call_counts.get(ALL_TOOLS_KEY), Some(&3));
        assert_eq!(
            admit(&limiter, &mut state, "a").await,
            Admission::Admitted(Some(CallCounts { thread: 4, run: 1 }))
        );
        let Admission::Rejected(rejection) = admit(&limiter, &mut state, "a").await else {
            panic!("thread limit should reject");
        };
        assert_eq!(rejection.scope, LimitScope::Thread);
        assert_eq!(rejection.exit_behavior, ExitBehavior::Error);
    }

    #[tokio::test]
    async fn most_severe_behavior_wins() {
        let config = ToolCallLimitConfig::default()
            .with_thread(ScopeLimit::new(1, ExitBehavior::InjectMessage))
            .with_run(ScopeLimit::new(1, ExitBehavior::Error));
        let limiter = ToolCallLimiter::new(config);
        let mut state = state("t");
        admit(&limiter, &mut state, "x").await;
        let Admission::Rejected(rejection) = admit(&limiter, &mut state, "x").await else {
            panic!("second call should be rejected");
        };
        assert_eq!(rejection.exit_behavior, ExitBehavior::Error);
        assert_eq!(rejection.scope, LimitScope::Run);
        assert_eq!(
            rejection.to_string(),
            "Tool call limit reached: thread limit exceeded (2/1 calls) and run limit exceeded (2/1 calls)."
        );
    }

    #[tokio::test]
    async fn tool_filter_counts_only_that_tool() {
        let limiter = ToolCallLimiter::new(run_limit(1, ExitBehavior::InjectMessage).for_tool("search"));
        let mut state = state("t");
        assert_eq!(admit(&limiter, &mut state, "fetch").await, Admission::Admitted(None));
        assert!(matches!(admit(&limiter, &mut state, "search").await, Admission::Admitted(Some(_))));
        assert_eq!(admit(&limiter, &mut state, "fetch").await, Admission::Admitted(None));
        let Admission::Rejected(rejection) = admit(&limiter, &mut state, "search").await else {
            panic!("second search should be rejected");
        };
        assert_eq!(
            rejection.limit_message(),
            "Tool call limit exceeded (run limit: 1). Do not call 'search' again."
        );
        assert_eq!(state.run_tool_call_counts.get("search"), Some(&2));
        assert!(state.run_tool_call_counts.get("fetch").is_none());
    }

    #[tokio::test]
    async fn aggregate_and_per_tool_limiters_count_separate_keys() {
        let store: Arc<dyn ThreadCounterStore> = Arc::new(InMemoryCounterStore::new());
        let aggregate = ToolCallLimiter::new(ToolCallLimitConfig::run_limit(3))
            .with_store(store.clone());
        let search = ToolCallLimiter::new(run_limit(1, ExitBehavior::Block).for_tool("search"))
            .with_store(store.clone());
        let mut state = state("t");

        for tool in ["search", "fetch"] {
            assert!(matches!(admit(&aggregate, &mut state, tool).await, Admission::Admitted(_)));
            assert!(matches!(admit(&search, &mut state, tool).await, Admission::Admitted(_)));
        }
        assert_eq!(state.run_tool_call_counts.get(ALL_TOOLS_KEY), Some(&2));
        assert_eq!(state.run_tool_call_counts.get("search"), Some(&1));
        assert!(state.run_tool_call_counts.get("fetch").is_none());
        assert_eq!(store.get("t", ALL_TOOLS_KEY).await.unwrap(), 2);
        assert_eq!(store.get("t", "search").await.unwrap(), 1);
        assert_eq!(store.get("t", "fetch").await.unwrap(), 0);

        // The per-tool limit trips before the aggregate one.
        assert!(matches!(admit(&aggregate, &mut state, "search").await, Admission::Admitted(_)));
        assert!(matches!(admit(&search, &mut state, "search").await, Admission::Rejected(_)));
        assert!(matches!(admit(&aggregate, &mut state, "fetch").await, Admission::Rejected(_)));
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let config = ToolCallLimitConfig {
            enabled: false,
            ..run_limit(1, ExitBehavior::Error)
        };
        let limiter = ToolCallLimiter::new(config);
        let mut state = state("t");
        for _ in 0..5 {
            assert_eq!(admit(&limiter, &mut state, "x").await, Admission::Admitted(None));
        }
    }

    #[tokio::test]
    async fn concurrent_runs_cannot_both_pass_thread_limit() {
        let store: Arc<dyn ThreadCounterStore> = Arc::new(InMemoryCounterStore::new());
        let config = ToolCallLimitConfig::thread_limit(1);
        let limiter = Arc::new(ToolCallLimiter::new(config).with_store(store));

        let mut handles = Vec::new();
        for run in 0..8 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut state = ConversationState::new("shared", vec![]);
                state.start_run(format!("r{run}"));
                limiter
                    .check_and_increment(&mut state, "x", &CancelSignal::never())
                    .await
                    .unwrap()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if matches!(h.await.unwrap(), Admission::Admitted(_)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn cancelled_request_does_not_count() {
        let store: Arc<dyn ThreadCounterStore> = Arc::new(InMemoryCounterStore::new());
        let limiter =
            ToolCallLimiter::new(ToolCallLimitConfig::thread_limit(3)).with_store(store.clone());
        let (handle, cancel) = cancel_pair();
        handle.cancel();
        let mut state = state("t");
        let result = limiter.check_and_increment(&mut state, "x", &cancel).await;
        assert!(matches!(result, Err(MiddlewareError::Cancelled)));
        assert_eq!(store.get("t", ALL_TOOLS_KEY).await.unwrap(), 0);
        assert!(state.run_tool_call_counts.is_empty());
    }

    #[tokio::test]
    async fn middleware_gate_follows_exit_behavior() {
        let cancel = CancelSignal::never();
        let call = ToolCall::new("c1", "search", json!({}));

        let block = ToolCallLimiter::new(run_limit(1, ExitBehavior::Block));
        let mut state = state("t");
        block.before_tool_call(&mut state, &call, &cancel).await.unwrap();
        let ToolGate::Skip(msg) = block.before_tool_call(&mut state, &call, &cancel).await.unwrap()
        else {
            panic!("expected skip");
        };
        assert_eq!(msg.text(), "");
        assert_eq!(msg.tool_call_id.as_deref(), Some("c1"));

        let inject = ToolCallLimiter::new(run_limit(1, ExitBehavior::InjectMessage));
        let mut state = self::state("t");
        inject.before_tool_call(&mut state, &call, &cancel).await.unwrap();
        let ToolGate::Skip(msg) = inject.before_tool_call(&mut state, &call, &cancel).await.unwrap()
        else {
            panic!("expected skip");
        };
        assert_eq!(
            msg.text(),
            "Tool call limit exceeded (run limit: 1). Do not make additional tool calls."
        );

        let error = ToolCallLimiter::new(run_limit(1, ExitBehavior::Error));
        let mut state = self::state("t");
        error.before_tool_call(&mut state, &call, &cancel).await.unwrap();
        let err = error.before_tool_call(&mut state, &call, &cancel).await.unwrap_err();
        assert!(matches!(err, MiddlewareError::ToolCallLimitExceeded(_)));
    }

    #[test]
    fn validation_rules() {
        assert!(ToolCallLimitConfig::default().validate().is_err());
        assert!(ToolCallLimitConfig::run_limit(3).validate().is_ok());
        assert!(ToolCallLimitConfig::run_limit(0).validate().is_err());
        let inverted = ToolCallLimitConfig::thread_limit(2).with_run(ScopeLimit::new(5, ExitBehavior::Block));
        assert!(inverted.validate().is_err());
        assert!(ToolCallLimitConfig::run_limit(1).for_tool("").validate().is_err());
    }

    #[test]
    fn exit_behavior_serde_and_order() {
        let b: ExitBehavior = serde_json::from_value(json!("inject_message")).unwrap();
        assert_eq!(b, ExitBehavior::InjectMessage);
        assert!(ExitBehavior::Error > ExitBehavior::InjectMessage);
        assert!(ExitBehavior::InjectMessage > ExitBehavior::Block);
        let limit: ScopeLimit = serde_json::from_value(json!({"limit": 2})).unwrap();
        assert_eq!(limit.exit_behavior, ExitBehavior::InjectMessage);
    }
}
