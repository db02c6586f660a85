use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::dispatch::adapter::ProviderAdapter;
use crate::dispatch::{GenerationRequest, GenerationResult, StreamObserver};
use crate::error::{ErrorClass, RelayError};
use crate::overload::OverloadState;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::sink::{ErrorReport, ErrorSink};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Caller observer, shared by every attempt of one logical request.
type SharedObserver<'d> = Mutex<&'d mut (dyn StreamObserver + 'd)>;

/// Per-attempt handle onto the caller's observer.
struct Forward<'a, 'd>(&'a SharedObserver<'d>);

impl StreamObserver for Forward<'_, '_> {
    fn on_delta(&mut self, delta: &str, done: bool) {
        if let Ok(mut observer) = self.0.lock() {
            observer.on_delta(delta, done);
        }
    }

    fn on_thought(&mut self, thought: &str, done: bool) {
        if let Ok(mut observer) = self.0.lock() {
            observer.on_thought(thought, done);
        }
    }
}

/// One link of a provider chain: retries, overload tracking and fallback
/// around a single adapter.
pub struct RequestOrchestrator {
    adapter: ProviderAdapter,
    fallback: Option<Box<RequestOrchestrator>>,
    overload: Arc<OverloadState>,
    policy: RetryPolicy,
    sink: Arc<dyn ErrorSink>,
}

impl RequestOrchestrator {
    pub fn new(
        adapter: ProviderAdapter,
        overload: Arc<OverloadState>,
        policy: RetryPolicy,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            adapter,
            fallback: None,
            overload,
            policy,
            sink,
        }
    }

    pub fn with_fallback(mut self, fallback: RequestOrchestrator) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn adapter(&self) -> &ProviderAdapter {
        &self.adapter
    }

    pub fn fallback(&self) -> Option<&RequestOrchestrator> {
        self.fallback.as_deref()
    }

    /// Resolve `req` to a parsed result, or fail after retries and fallbacks.
    /// An unresolved failure is reported to the sink once.
    pub async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResult, RelayError> {
        let outcome = self.run(req, None).await;
        self.report(outcome)
    }

    /// Streaming variant of [`generate`](Self::generate). `observer`
    /// receives the narrative field and reasoning as they arrive, across
    /// every attempt made.
    pub async fn generate_stream(
        &self,
        req: &GenerationRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<GenerationResult, RelayError> {
        let shared: SharedObserver<'_> = Mutex::new(observer);
        let outcome = self.run(req, Some(&shared)).await;
        self.report(outcome)
    }

    fn report(
        &self,
        outcome: Result<GenerationResult, RelayError>,
    ) -> Result<GenerationResult, RelayError> {
        if let Err(e) = &outcome
            && !matches!(e, RelayError::Cancelled)
        {
            self.sink.report(&ErrorReport::from_error(e));
        }
        outcome
    }

    fn run<'a, 'd: 'a>(
        &'a self,
        req: &'a GenerationRequest,
        observer: Option<&'a SharedObserver<'d>>,
    ) -> BoxFuture<'a, Result<GenerationResult, RelayError>> {
        Box::pin(async move {
            if req.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            let provider = self.adapter.name();
            let model = self.adapter.resolve_model(req);
            let key = self.adapter.overload_key(&model);

            if let (Some(fallback), Some(key)) = (self.fallback.as_deref(), key)
                && self.overload.is_overloaded(key)
            {
                tracing::warn!(
                    provider,
                    model = %model,
                    "model marked overloaded, skipping straight to fallback"
                );
                return self.run_fallback(fallback, req, observer, None).await;
            }

            let outcome = retry_with_backoff(
                &self.policy,
                |_| self.attempt(req, observer),
                |err, attempt| {
                    tracing::debug!(
                        provider,
                        attempt,
                        class = err.class().as_str(),
                        "attempt failed"
                    );
                    if err.class() == ErrorClass::Overloaded
                        && let Some(key) = key
                    {
                        self.overload.set_overloaded(key, true);
                    }
                },
            )
            .await;

            let err = match outcome {
                Ok(result) => {
                    if let Some(key) = key {
                        self.overload.set_overloaded(key, false);
                    }
                    return Ok(result);
                }
                Err(e) => e,
            };

            let falls_back = matches!(
                err.class(),
                ErrorClass::Overloaded | ErrorClass::Network | ErrorClass::Unknown
            );
            match self.fallback.as_deref() {
                Some(fallback) if falls_back => {
                    self.run_fallback(fallback, req, observer, Some(err)).await
                }
                _ => Err(err),
            }
        })
    }

    async fn attempt(
        &self,
        req: &GenerationRequest,
        observer: Option<&SharedObserver<'_>>,
    ) -> Result<GenerationResult, RelayError> {
        match observer {
            None => self.adapter.generate(req).await,
            Some(shared) => {
                self.adapter
                    .generate_stream(req, &mut Forward(shared))
                    .await
            }
        }
    }

    async fn run_fallback<'d>(
        &self,
        fallback: &RequestOrchestrator,
        req: &GenerationRequest,
        observer: Option<&SharedObserver<'d>>,
        primary_error: Option<RelayError>,
    ) -> Result<GenerationResult, RelayError> {
        tracing::warn!(
            from = self.adapter.name(),
            to = fallback.adapter.name(),
            model = %fallback.adapter.resolve_model(req),
            "Switching to fallback provider"
        );

        match fallback.run(req, observer).await {
            Ok(mut result) => {
                let visible = req.return_fallback_property.unwrap_or(false)
                    || self.adapter.config().return_fallback_property;
                result.mark_fallback(visible);
                Ok(result)
            }
            Err(e) => {
                if let Some(primary) = primary_error {
                    tracing::warn!(
                        provider = self.adapter.name(),
                        "fallback failed too; primary error was: {primary}"
                    );
                }
                Err(e)
            }
        }
    }
}
