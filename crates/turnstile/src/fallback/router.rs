//! The fallback router.

use super::{AttemptHistory, ModelClient, ModelFallbackConfig, ModelResolver};
use crate::cancel::CancelSignal;
use crate::error::{FallbackError, MiddlewareError, ModelError, ModelErrorKind};
use crate::pipeline::{AgentMiddleware, MiddlewareFuture};
use crate::telemetry::{NoopTelemetry, TelemetryEvent, TelemetrySink};
use crate::{ModelRequest, ModelResponse, ModelSpec};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A chain entry: a client the caller already holds, or a spec still to be
/// resolved.
enum Candidate<'a> {
    Client(&'a dyn ModelClient, ModelSpec),
    Spec(ModelSpec),
}

impl Candidate<'_> {
    fn spec(&self) -> &ModelSpec {
        match self {
            Candidate::Client(_, spec) | Candidate::Spec(spec) => spec,
        }
    }
}

/// Retries retryable model failures against the configured fallback models.
pub struct ModelFallbackRouter {
    config: ModelFallbackConfig,
    resolver: Arc<dyn ModelResolver>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ModelFallbackRouter {
    pub fn new(config: ModelFallbackConfig, resolver: Arc<dyn ModelResolver>) -> Self {
        Self {
            config,
            resolver,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &ModelFallbackConfig {
        &self.config
    }

    /// The model chain for a request addressed to `primary`.
    pub fn chain(&self, primary: &ModelSpec) -> Vec<ModelSpec> {
        let mut chain = vec![primary.clone()];
        if self.config.enabled {
            chain.extend(self.config.fallback_models.iter().cloned());
        }
        chain
    }

    /// Invoke `primary` with `request`, falling back to the configured
    /// models on retryable failures. Fallback clients are resolved only when
    /// they are needed.
    pub async fn invoke(
        &self,
        request: &ModelRequest,
        primary: &dyn ModelClient,
        cancel: &CancelSignal,
    ) -> Result<ModelResponse, FallbackError> {
        let mut candidates = vec![Candidate::Client(primary, request.model.clone())];
        if self.config.enabled {
            candidates.extend(self.config.fallback_models.iter().cloned().map(Candidate::Spec));
        }
        self.run(request, candidates, cancel).await
    }

    /// Invoke an explicit chain of model specs, all resolved through the
    /// resolver. The first entry is the primary.
    pub async fn invoke_chain(
        &self,
        request: &ModelRequest,
        chain: &[ModelSpec],
        cancel: &CancelSignal,
    ) -> Result<ModelResponse, FallbackError> {
        let candidates = chain.iter().cloned().map(Candidate::Spec).collect();
        self.run(request, candidates, cancel).await
    }

    async fn run(
        &self,
        request: &ModelRequest,
        candidates: Vec<Candidate<'_>>,
        cancel: &CancelSignal,
    ) -> Result<ModelResponse, FallbackError> {
        if candidates.is_empty() {
            return Err(FallbackError::EmptyChain);
        }
        let limit = candidates
            .len()
            .min(self.config.max_attempts.unwrap_or(usize::MAX));
        let mut history = AttemptHistory::default();
        let mut last_error: Option<ModelError> = None;

        for (index, candidate) in candidates.iter().take(limit).enumerate() {
            let spec = candidate.spec();
            if index > 0 {
                let delay = self.config.backoff.delay_for_attempt((index - 1) as u32);
                if !delay.is_zero() {
                    debug!("Waiting {delay:?} before trying {spec}");
                    if cancel.run(tokio::time::sleep(delay)).await.is_none() {
                        return Err(FallbackError::Cancelled { history });
                    }
                }
            }

            let attempt_request = if spec == &request.model {
                request.clone()
            } else {
                request.for_model(spec)
            };
            let outcome = match candidate {
                Candidate::Client(client, _) => cancel.run(client.invoke(&attempt_request)).await,
                Candidate::Spec(spec) => match self.resolver.resolve(spec) {
                    Ok(client) => cancel.run(client.invoke(&attempt_request)).await,
                    Err(e) => Some(Err(e)),
                },
            };
            let Some(result) = outcome else {
                info!("Model invocation cancelled during attempt #{index} ({spec})");
                return Err(FallbackError::Cancelled { history });
            };

            match result {
                Ok(response) => {
                    if index > 0 {
                        info!("Model call succeeded on fallback #{index} ({spec})");
                    }
                    return Ok(response);
                }
                Err(err) if err.kind == ModelErrorKind::Cancelled => {
                    history.push(index, spec, &err);
                    return Err(FallbackError::Cancelled { history });
                }
                Err(err) if !err.is_retryable() => {
                    history.push(index, spec, &err);
                    return Err(FallbackError::NonRetryable {
                        error: err,
                        history,
                    });
                }
                Err(err) => {
                    history.push(index, spec, &err);
                    if index + 1 < limit {
                        let next = candidates[index + 1].spec();
                        warn!(
                            model = %spec,
                            error = %err,
                            next_model = %next,
                            "Model failed with retryable error, trying next model"
                        );
                        self.telemetry.record(&TelemetryEvent::fallback_transition(
                            spec, index, err.kind, next,
                        ));
                    }
                    last_error = Some(err);
                }
            }
        }

        let Some(last) = last_error else {
            return Err(FallbackError::EmptyChain);
        };
        self.telemetry.record(&TelemetryEvent::FallbackExhausted {
            attempts: history.len(),
            last_kind: last.kind,
            at: Utc::now(),
        });
        warn!("All {} model attempt(s) failed: {history}", history.len());
        Err(FallbackError::Exhausted { last, history })
    }
}

impl AgentMiddleware for ModelFallbackRouter {
    fn name(&self) -> &str {
        "model_fallback"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn wrap_model_call<'a>(
        &'a self,
        request: &'a ModelRequest,
        primary: &'a dyn ModelClient,
        cancel: &'a CancelSignal,
    ) -> Option<MiddlewareFuture<'a, ModelResponse>> {
        if !self.config.enabled {
            return None;
        }
        Some(Box::pin(async move {
            self.invoke(request, primary, cancel)
                .await
                .map_err(MiddlewareError::from)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::fallback::{BackoffConfig, ModelFuture, StaticResolver};
    use crate::telemetry::CollectingTelemetry;
    use crate::Message;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Client that replays scripted results and counts calls.
    struct ScriptedClient {
        spec: ModelSpec,
        results: Mutex<VecDeque<Result<(), ModelErrorKind>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(spec: &str, results: Vec<Result<(), ModelErrorKind>>) -> Arc<Self> {
            Arc::new(Self {
                spec: ModelSpec::parse(spec),
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn ok(spec: &str) -> Arc<Self> {
            Self::new(spec, vec![Ok(())])
        }

        fn failing(spec: &str, kind: ModelErrorKind) -> Arc<Self> {
            Self::new(spec, vec![Err(kind)])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ModelClient for ScriptedClient {
        fn invoke<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(request.model, self.spec);
                let next = self.results.lock().unwrap().pop_front().unwrap_or(Ok(()));
                match next {
                    Ok(()) => Ok(ModelResponse::new(
                        self.spec.clone(),
                        Message::ai_text(format!("from {}", self.spec)),
                    )),
                    Err(kind) => Err(ModelError::new(kind, self.spec.to_string(), "scripted failure")),
                }
            })
        }
    }

    /// Client that never answers.
    struct HangingClient;

    impl ModelClient for HangingClient {
        fn invoke<'a>(&'a self, _request: &'a ModelRequest) -> ModelFuture<'a> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ModelError::new(ModelErrorKind::Timeout, "hang", "unreachable"))
            })
        }
    }

    fn request() -> ModelRequest {
        ModelRequest::new(ModelSpec::parse("p/a"), vec![Message::human("hi")])
    }

    fn router(
        fallbacks: &[&str],
        clients: &[Arc<ScriptedClient>],
    ) -> (ModelFallbackRouter, Arc<CollectingTelemetry>) {
        let resolver = clients.iter().fold(StaticResolver::new(), |r, c| {
            r.with(c.spec.clone(), c.clone() as Arc<dyn ModelClient>)
        });
        let config =
            ModelFallbackConfig::new(fallbacks.iter().map(|s| ModelSpec::parse(s)).collect());
        let sink = Arc::new(CollectingTelemetry::new());
        let router = ModelFallbackRouter::new(config, Arc::new(resolver)).with_telemetry(sink.clone());
        (router, sink)
    }

    #[tokio::test]
    async fn primary_success_skips_fallbacks() {
        let a = ScriptedClient::ok("p/a");
        let b = ScriptedClient::ok("p/b");
        let (router, sink) = router(&["p/b"], &[b.clone()]);
        let response = router
            .invoke(&request(), a.as_ref(), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(response.model.to_string(), "p/a");
        assert_eq!(b.calls(), 0);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn falls_back_in_order() {
        let a = ScriptedClient::failing("p/a", ModelErrorKind::Timeout);
        let b = ScriptedClient::failing("p/b", ModelErrorKind::RateLimited);
        let c = ScriptedClient::ok("p/c");
        let (router, sink) = router(&["p/b", "p/c"], &[b.clone(), c.clone()]);

        let response = router
            .invoke(&request(), a.as_ref(), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(response.model.to_string(), "p/c");
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 1));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        let TelemetryEvent::FallbackTransition {
            failed_model,
            attempt,
            kind,
            next_model,
            ..
        } = &events[1]
        else {
            panic!("expected transition");
        };
        assert_eq!(failed_model.to_string(), "p/b");
        assert_eq!(*attempt, 1);
        assert_eq!(*kind, ModelErrorKind::RateLimited);
        assert_eq!(next_model.to_string(), "p/c");
    }

    #[tokio::test]
    async fn non_retryable_error_aborts_after_one_attempt() {
        let a = ScriptedClient::failing("p/a", ModelErrorKind::InvalidRequest);
        let b = ScriptedClient::ok("p/b");
        let (router, sink) = router(&["p/b"], &[b.clone()]);

        let err = router
            .invoke(&request(), a.as_ref(), &CancelSignal::never())
            .await
            .unwrap_err();
        let FallbackError::NonRetryable { error, history } = err else {
            panic!("expected non-retryable error");
        };
        assert_eq!(error.kind, ModelErrorKind::InvalidRequest);
        assert_eq!(error.message, "scripted failure");
        assert_eq!(history.len(), 1);
        assert_eq!(b.calls(), 0);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn exhausted_chain_reports_full_history() {
        let a = ScriptedClient::failing("p/a", ModelErrorKind::ProviderOutage);
        let b = ScriptedClient::failing("p/b", ModelErrorKind::MalformedResponse);
        let (router, sink) = router(&["p/b", "p/missing"], &[b.clone()]);

        let err = router
            .invoke(&request(), a.as_ref(), &CancelSignal::never())
            .await
            .unwrap_err();
        let FallbackError::Exhausted { last, history } = &err else {
            panic!("expected exhaustion");
        };
        assert_eq!(last.model, "p/missing");
        let models: Vec<String> = history.records().iter().map(|r| r.model.to_string()).collect();
        assert_eq!(models, ["p/a", "p/b", "p/missing"]);
        assert_eq!(err.history()[1].kind, ModelErrorKind::MalformedResponse);
        assert!(matches!(
            sink.events().last(),
            Some(TelemetryEvent::FallbackExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn max_attempts_caps_the_chain() {
        let a = ScriptedClient::failing("p/a", ModelErrorKind::Timeout);
        let b = ScriptedClient::failing("p/b", ModelErrorKind::Timeout);
        let c = ScriptedClient::ok("p/c");
        let (router, _) = router(&["p/b", "p/c"], &[b.clone(), c.clone()]);
        let router = ModelFallbackRouter {
            config: router.config.clone().with_max_attempts(2),
            ..router
        };
        let err = router
            .invoke(&request(), a.as_ref(), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::Exhausted { .. }));
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test]
    async fn invoke_chain_resolves_every_entry() {
        let a = ScriptedClient::failing("p/a", ModelErrorKind::Timeout);
        let b = ScriptedClient::ok("p/b");
        let (router, _) = router(&["p/b"], &[a.clone(), b.clone()]);
        let chain = [ModelSpec::parse("p/a"), ModelSpec::parse("p/b")];
        let response = router
            .invoke_chain(&request(), &chain, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(response.model.to_string(), "p/b");
        assert!(matches!(
            router.invoke_chain(&request(), &[], &CancelSignal::never()).await,
            Err(FallbackError::EmptyChain)
        ));
    }

    #[tokio::test]
    async fn disabled_router_uses_primary_only() {
        let a = ScriptedClient::failing("p/a", ModelErrorKind::Timeout);
        let b = ScriptedClient::ok("p/b");
        let (router, _) = router(&["p/b"], &[b.clone()]);
        let router = ModelFallbackRouter {
            config: ModelFallbackConfig {
                enabled: false,
                ..router.config.clone()
            },
            ..router
        };
        assert_eq!(router.chain(&ModelSpec::parse("p/a")).len(), 1);
        let err = router
            .invoke(&request(), a.as_ref(), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::Exhausted { .. }));
        assert_eq!(b.calls(), 0);
        assert!(router
            .wrap_model_call(&request(), a.as_ref(), &CancelSignal::never())
            .is_none());
    }

    #[tokio::test]
    async fn cancellation_stops_the_chain() {
        let b = ScriptedClient::ok("p/b");
        let (router, _) = router(&["p/b"], &[b.clone()]);
        let (handle, cancel) = cancel_pair();
        let task = {
            let req = request();
            async move { router.invoke(&req, &HangingClient, &cancel).await }
        };
        let (result, _) = tokio::join!(task, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });
        assert!(matches!(result, Err(FallbackError::Cancelled { .. })));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn backoff_waits_between_attempts() {
        let a = ScriptedClient::failing("p/a", ModelErrorKind::Timeout);
        let b = ScriptedClient::ok("p/b");
        let (router, _) = router(&["p/b"], &[b.clone()]);
        let router = ModelFallbackRouter {
            config: router.config.clone().with_backoff(BackoffConfig {
                jitter: false,
                initial_delay_ms: 30,
                ..BackoffConfig::exponential()
            }),
            ..router
        };
        let started = std::time::Instant::now();
        router
            .invoke(&request(), a.as_ref(), &CancelSignal::never())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
