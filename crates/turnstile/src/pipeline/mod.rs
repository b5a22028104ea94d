//! The middleware trait and the pipeline that runs it.
//!
//! A run goes through four hook points:
//!
//! 1. [`Pipeline::begin_run`]: once, before the first model call.
//! 2. [`Pipeline::before_model`]: before every model call.
//! 3. [`Pipeline::invoke_model`]: the model call itself.
//! 4. [`Pipeline::before_tool_call`]: before every requested tool runs.
//!
//! Middlewares run in registration order. Disabled middlewares are skipped
//! entirely.

use crate::cancel::CancelSignal;
use crate::error::MiddlewareError;
use crate::fallback::ModelClient;
use crate::state::ConversationState;
use crate::{Message, ModelRequest, ModelResponse, ToolCall};
use futures::future::BoxFuture;
use tracing::{debug, trace};

/// Boxed future returned by [`AgentMiddleware`] hooks.
pub type MiddlewareFuture<'a, T> = BoxFuture<'a, Result<T, MiddlewareError>>;

/// Verdict of a [`AgentMiddleware::before_tool_call`] hook.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolGate {
    /// Run the tool.
    Proceed,
    /// Do not run the tool; record this message as its result instead.
    Skip(Message),
}

/// An interceptor around an agent's model and tool calls.
///
/// Every hook has a pass-through default, so implementors override only the
/// hook points they care about.
pub trait AgentMiddleware: Send + Sync {
    /// Name used in logs and configuration.
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Called once at the start of a run, after run-scope state is reset.
    fn before_run<'a>(
        &'a self,
        state: ConversationState,
        _cancel: &'a CancelSignal,
    ) -> MiddlewareFuture<'a, ConversationState> {
        Box::pin(async move { Ok(state) })
    }

    /// Called before every model call.
    fn before_model<'a>(
        &'a self,
        state: ConversationState,
        _cancel: &'a CancelSignal,
    ) -> MiddlewareFuture<'a, ConversationState> {
        Box::pin(async move { Ok(state) })
    }

    /// Called before each requested tool runs.
    fn before_tool_call<'a>(
        &'a self,
        _state: &'a mut ConversationState,
        _call: &'a ToolCall,
        _cancel: &'a CancelSignal,
    ) -> MiddlewareFuture<'a, ToolGate> {
        Box::pin(async { Ok(ToolGate::Proceed) })
    }

    /// Take over the model call. `None` leaves it to the next middleware,
    /// or to the primary client when no middleware claims it.
    fn wrap_model_call<'a>(
        &'a self,
        _request: &'a ModelRequest,
        _primary: &'a dyn ModelClient,
        _cancel: &'a CancelSignal,
    ) -> Option<MiddlewareFuture<'a, ModelResponse>> {
        None
    }
}

/// An ordered list of middlewares.
#[derive(Default)]
pub struct Pipeline {
    middlewares: Vec<Box<dyn AgentMiddleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware (builder pattern).
    pub fn with(self, middleware: impl AgentMiddleware + 'static) -> Self {
        self.with_boxed(Box::new(middleware))
    }

    /// Append a middleware only when `condition` is `true`.
    pub fn with_if(self, condition: bool, middleware: impl AgentMiddleware + 'static) -> Self {
        if condition { self.with(middleware) } else { self }
    }

    pub fn with_opt(self, middleware: Option<impl AgentMiddleware + 'static>) -> Self {
        match middleware {
            Some(m) => self.with(m),
            None => self,
        }
    }

    pub fn with_boxed(mut self, middleware: Box<dyn AgentMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Names of all registered middlewares, in order.
    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    fn active(&self) -> impl Iterator<Item = &dyn AgentMiddleware> {
        self.middlewares
            .iter()
            .map(|m| m.as_ref())
            .filter(|m| m.is_enabled())
    }

    /// Start a run: reset run-scope state, then run every `before_run` hook.
    pub async fn begin_run(
        &self,
        mut state: ConversationState,
        run_id: impl Into<String>,
        cancel: &CancelSignal,
    ) -> Result<ConversationState, MiddlewareError> {
        state.start_run(run_id);
        debug!(
            "[{}] run {} started ({} messages)",
            state.thread_id,
            state.run_id,
            state.messages.len()
        );
        for middleware in self.active() {
            if cancel.is_cancelled() {
                return Err(MiddlewareError::Cancelled);
            }
            trace!("before_run: {}", middleware.name());
            state = middleware.before_run(state, cancel).await?;
        }
        Ok(state)
    }

    pub async fn before_model(
        &self,
        mut state: ConversationState,
        cancel: &CancelSignal,
    ) -> Result<ConversationState, MiddlewareError> {
        for middleware in self.active() {
            if cancel.is_cancelled() {
                return Err(MiddlewareError::Cancelled);
            }
            trace!("before_model: {}", middleware.name());
            state = middleware.before_model(state, cancel).await?;
        }
        Ok(state)
    }

    /// Ask every middleware whether `call` may run. The first
    /// [`ToolGate::Skip`] wins and later middlewares are not consulted.
    pub async fn before_tool_call(
        &self,
        state: &mut ConversationState,
        call: &ToolCall,
        cancel: &CancelSignal,
    ) -> Result<ToolGate, MiddlewareError> {
        for middleware in self.active() {
            if cancel.is_cancelled() {
                return Err(MiddlewareError::Cancelled);
            }
            let gate = middleware.before_tool_call(state, call, cancel).await?;
            if let ToolGate::Skip(_) = gate {
                debug!("{} skipped tool call {} ({})", middleware.name(), call.id, call.name);
                return Ok(gate);
            }
        }
        Ok(ToolGate::Proceed)
    }

    /// Call the model. The first middleware that wraps the call handles it;
    /// otherwise `primary` is invoked directly.
    pub async fn invoke_model(
        &self,
        request: &ModelRequest,
        primary: &dyn ModelClient,
        cancel: &CancelSignal,
    ) -> Result<ModelResponse, MiddlewareError> {
        for middleware in self.active() {
            if let Some(fut) = middleware.wrap_model_call(request, primary, cancel) {
                trace!("model call wrapped by {}", middleware.name());
                return fut.await;
            }
        }
        match cancel.run(primary.invoke(request)).await {
            Some(result) => Ok(result?),
            None => Err(MiddlewareError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::error::{ModelError, ModelErrorKind};
    use crate::fallback::ModelFuture;
    use crate::{MessageRole, ModelSpec};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Appends its tag to the system prompt on every hook.
    struct Tagger {
        tag: &'static str,
        enabled: bool,
    }

    impl Tagger {
        fn mark(state: &mut ConversationState, tag: &str) {
            state.push(Message::system(tag));
        }
    }

    impl AgentMiddleware for Tagger {
        fn name(&self) -> &str {
            self.tag
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn before_run<'a>(
            &'a self,
            mut state: ConversationState,
            _cancel: &'a CancelSignal,
        ) -> MiddlewareFuture<'a, ConversationState> {
            Box::pin(async move {
                Self::mark(&mut state, &format!("run:{}", self.tag));
                Ok(state)
            })
        }

        fn before_model<'a>(
            &'a self,
            mut state: ConversationState,
            _cancel: &'a CancelSignal,
        ) -> MiddlewareFuture<'a, ConversationState> {
            Box::pin(async move {
                Self::mark(&mut state, &format!("model:{}", self.tag));
                Ok(state)
            })
        }
    }

    /// Skips every tool call, counting how often it was asked.
    struct Skipper {
        asked: AtomicUsize,
    }

    impl AgentMiddleware for Skipper {
        fn name(&self) -> &str {
            "skipper"
        }

        fn before_tool_call<'a>(
            &'a self,
            _state: &'a mut ConversationState,
            call: &'a ToolCall,
            _cancel: &'a CancelSignal,
        ) -> MiddlewareFuture<'a, ToolGate> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(ToolGate::Skip(Message::tool_result(&call.id, "skipped"))) })
        }
    }

    struct EchoClient {
        calls: Mutex<usize>,
        fail: bool,
    }

    impl ModelClient for EchoClient {
        fn invoke<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a> {
            Box::pin(async move {
                *self.calls.lock().unwrap() += 1;
                if self.fail {
                    return Err(ModelError::new(
                        ModelErrorKind::Timeout,
                        request.model.to_string(),
                        "slow",
                    ));
                }
                Ok(ModelResponse::new(request.model.clone(), Message::ai_text("hi")))
            })
        }
    }

    fn texts(state: &ConversationState) -> Vec<String> {
        state.messages.iter().map(|m| m.text().into_owned()).collect()
    }

    #[tokio::test]
    async fn hooks_run_in_order_and_skip_disabled() {
        let pipeline = Pipeline::new()
            .with(Tagger { tag: "a", enabled: true })
            .with(Tagger { tag: "off", enabled: false })
            .with(Tagger { tag: "b", enabled: true });
        assert_eq!(pipeline.names(), vec!["a", "off", "b"]);

        let cancel = CancelSignal::never();
        let state = ConversationState::new("t", vec![]);
        let state = pipeline.begin_run(state, "run-1", &cancel).await.unwrap();
        let state = pipeline.before_model(state, &cancel).await.unwrap();
        assert_eq!(state.run_id, "run-1");
        assert_eq!(texts(&state), vec!["run:a", "run:b", "model:a", "model:b"]);
    }

    #[tokio::test]
    async fn begin_run_resets_run_scope() {
        let mut state = ConversationState::new("t", vec![Message::human("hi")]);
        state.run_tool_call_counts.insert("search".into(), 3);
        state.thread_tool_call_counts.insert("search".into(), 3);
        state.run.context_over_budget = true;

        let state = Pipeline::new()
            .begin_run(state, "run-2", &CancelSignal::never())
            .await
            .unwrap();
        assert!(state.run_tool_call_counts.is_empty());
        assert_eq!(state.thread_tool_call_counts["search"], 3);
        assert!(!state.run.context_over_budget);
    }

    #[tokio::test]
    async fn first_skip_wins() {
        let first = Skipper { asked: AtomicUsize::new(0) };
        let pipeline = Pipeline::new().with(first).with(Skipper { asked: AtomicUsize::new(0) });
        let mut state = ConversationState::new("t", vec![]);
        let call = ToolCall::new("c1", "search", serde_json::json!({}));
        let gate = pipeline
            .before_tool_call(&mut state, &call, &CancelSignal::never())
            .await
            .unwrap();
        let ToolGate::Skip(msg) = gate else {
            panic!("expected skip");
        };
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn empty_pipeline_proceeds_and_calls_primary() {
        let pipeline = Pipeline::new();
        assert!(pipeline.is_empty());
        let mut state = ConversationState::new("t", vec![]);
        let call = ToolCall::new("c1", "search", serde_json::json!({}));
        let cancel = CancelSignal::never();
        assert_eq!(
            pipeline.before_tool_call(&mut state, &call, &cancel).await.unwrap(),
            ToolGate::Proceed
        );

        let client = EchoClient { calls: Mutex::new(0), fail: false };
        let request = ModelRequest::new(ModelSpec::parse("a/one"), vec![Message::human("hi")]);
        let response = pipeline.invoke_model(&request, &client, &cancel).await.unwrap();
        assert_eq!(response.message.text(), "hi");
        assert_eq!(*client.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn unwrapped_model_error_is_surfaced() {
        let client = EchoClient { calls: Mutex::new(0), fail: true };
        let request = ModelRequest::new(ModelSpec::parse("a/one"), vec![]);
        let err = Pipeline::new()
            .invoke_model(&request, &client, &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, MiddlewareError::Model(ref e) if e.kind == ModelErrorKind::Timeout));
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_hooks() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let pipeline = Pipeline::new().with(Tagger { tag: "a", enabled: true });
        let err = pipeline
            .begin_run(ConversationState::new("t", vec![]), "run-3", &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, MiddlewareError::Cancelled));

        let client = EchoClient { calls: Mutex::new(0), fail: false };
        let request = ModelRequest::new(ModelSpec::parse("a/one"), vec![]);
        let err = pipeline.invoke_model(&request, &client, &signal).await.unwrap_err();
        assert!(matches!(err, MiddlewareError::Cancelled));
        assert_eq!(*client.calls.lock().unwrap(), 0);
    }
}
