use std::sync::Mutex;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderConfig, ProviderKind};
use crate::dispatch::gemini::GeminiAdapter;
use crate::dispatch::openai::OpenAiAdapter;
use crate::dispatch::{
    GenerationRequest, GenerationResult, MAX_RESPONSE_BYTES, RawCompletion, StreamObserver,
};
use crate::error::RelayError;
use crate::extract::StreamFieldExtractor;
use crate::overload::{ModelClass, OverloadKey};
use crate::parse::parse_document;
use crate::repair::JsonRepairAgent;

/// Shared HTTP client for every adapter built by one factory.
pub fn build_client() -> Result<Client, RelayError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {e}")))
}

/// One provider behind the common request/response contract.
///
/// The set of providers is closed: Pollinations speaks the OpenAI chat
/// completions dialect and is served by the OpenAI adapter.
pub enum ProviderAdapter {
    Gemini(GeminiAdapter),
    OpenAi(OpenAiAdapter),
}

impl ProviderAdapter {
    pub fn new(config: ProviderConfig, client: Client) -> Self {
        match config.kind {
            ProviderKind::Gemini => Self::Gemini(GeminiAdapter::new(client, config)),
            ProviderKind::OpenAi | ProviderKind::Pollinations => {
                Self::OpenAi(OpenAiAdapter::new(client, config))
            }
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        match self {
            Self::Gemini(a) => a.config(),
            Self::OpenAi(a) => a.config(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.config().kind
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Request model if set, else the configured one.
    pub fn resolve_model(&self, req: &GenerationRequest) -> String {
        req.model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.config().model)
            .to_string()
    }

    /// Overload flag guarding `model`, for providers that track overload.
    pub fn overload_key(&self, model: &str) -> Option<OverloadKey> {
        let config = self.config();
        if !config.kind.tracks_overload() {
            return None;
        }
        let class = if config.reasoning.is_thinking_model(model) {
            ModelClass::Thinking
        } else {
            ModelClass::Standard
        };
        Some(OverloadKey::new(config.kind, class))
    }

    pub fn supports_thinking_budget(&self, model: &str) -> bool {
        self.config().reasoning.supports_thinking_budget(model)
    }

    pub fn supports_thoughts(&self, model: &str) -> bool {
        self.config().reasoning.supports_thoughts(model)
    }

    /// Single non-streaming call. Returns the raw text, unparsed.
    pub async fn complete(&self, req: &GenerationRequest) -> Result<RawCompletion, RelayError> {
        let model = self.resolve_model(req);
        match self {
            Self::Gemini(a) => a.complete(req, &model).await,
            Self::OpenAi(a) => a.complete(req, &model).await,
        }
    }

    /// Single streaming call. `on_text` sees each raw text fragment in order,
    /// `on_thought` each reasoning fragment.
    pub async fn complete_stream(
        &self,
        req: &GenerationRequest,
        on_text: &mut (dyn FnMut(&str) + Send),
        on_thought: &mut (dyn FnMut(&str) + Send),
    ) -> Result<RawCompletion, RelayError> {
        let model = self.resolve_model(req);
        match self {
            Self::Gemini(a) => a.stream(req, &model, on_text, on_thought).await,
            Self::OpenAi(a) => a.stream(req, &model, on_text, on_thought).await,
        }
    }

    /// One attempt: call, then run the parse ladder.
    pub async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResult, RelayError> {
        let raw = self.complete(req).await?;
        self.finish(req, raw).await
    }

    /// One streaming attempt. Deltas of the narrative field and reasoning
    /// reach `observer` as they arrive; the accumulated text then goes
    /// through the parse ladder. Both channels are closed before returning,
    /// on every outcome.
    pub async fn generate_stream(
        &self,
        req: &GenerationRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<GenerationResult, RelayError> {
        let observer = Mutex::new(observer);
        let field = self.config().narrative_field.clone();
        let mut extractor = StreamFieldExtractor::new(field, |delta: &str, done: bool| {
            if let Ok(mut o) = observer.lock() {
                o.on_delta(delta, done);
            }
        });

        let outcome = {
            let mut feed = |text: &str| extractor.process_chunk(text);
            let mut think = |thought: &str| {
                if let Ok(mut o) = observer.lock() {
                    o.on_thought(thought, false);
                }
            };
            self.complete_stream(req, &mut feed, &mut think).await
        };

        extractor.force_complete();
        if let Ok(mut o) = observer.lock() {
            o.on_thought("", true);
        }

        match outcome {
            Ok(raw) => self.finish(req, raw).await,
            Err(e) => {
                if !matches!(e, RelayError::Cancelled) {
                    tracing::debug!(
                        provider = self.name(),
                        error = %e,
                        "stream attempt failed, closed partial output"
                    );
                }
                Err(e)
            }
        }
    }

    fn auto_repair_enabled(&self, req: &GenerationRequest) -> bool {
        req.try_auto_fix_json_error.unwrap_or(true) && self.config().try_auto_fix_json
    }

    async fn finish(
        &self,
        req: &GenerationRequest,
        raw: RawCompletion,
    ) -> Result<GenerationResult, RelayError> {
        match parse_document(&raw.text) {
            Ok(content) => Ok(GenerationResult::new(raw.thoughts, content)),
            Err(RelayError::Parse { message }) if self.auto_repair_enabled(req) => {
                tracing::warn!(
                    provider = self.name(),
                    error = %message,
                    "response is not valid JSON, asking the model to repair it"
                );
                let content = JsonRepairAgent::new(self).repair(&raw.text, &message).await?;
                Ok(GenerationResult::new(raw.thoughts, content))
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers shared by the adapters
// ---------------------------------------------------------------------------

/// Transport failures before any response arrived.
pub(crate) fn send_error(error: reqwest::Error, provider: &str) -> RelayError {
    if error.is_connect() || error.is_timeout() {
        RelayError::Network {
            provider: provider.to_string(),
            message: error.to_string(),
        }
    } else {
        RelayError::Request(error)
    }
}

/// Read a success body, refusing anything over `MAX_RESPONSE_BYTES`.
pub(crate) async fn read_body(response: Response, provider: &str) -> Result<Vec<u8>, RelayError> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| RelayError::Network {
            provider: provider.to_string(),
            message: format!("failed to read response body: {e}"),
        })?;
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(RelayError::InvalidResponse {
                provider: provider.to_string(),
                message: format!("response too large (max {MAX_RESPONSE_BYTES} bytes)"),
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Turn a non-success response into a classified error.
pub(crate) async fn error_from_response(
    response: Response,
    config: &ProviderConfig,
    model: &str,
) -> RelayError {
    let status = response.status();
    let bytes = read_error_body(response).await;
    let text = String::from_utf8_lossy(&bytes);
    status_error(config.kind, model, status, &text)
}

/// First `MAX_RESPONSE_BYTES` of an error body. The rest is never read, and
/// a body cut short by the transport keeps what arrived.
async fn read_error_body(response: Response) -> Vec<u8> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(Ok(chunk)) = stream.next().await {
        let room = MAX_RESPONSE_BYTES - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    body
}

pub(crate) fn status_error(
    kind: ProviderKind,
    model: &str,
    status: StatusCode,
    body: &str,
) -> RelayError {
    let provider = kind.as_str().to_string();
    let detail = match kind {
        ProviderKind::Gemini => format!("{status}: {}", error_detail(body)),
        ProviderKind::OpenAi | ProviderKind::Pollinations => {
            format!("OpenAI API Error: {} - {}", status.as_u16(), error_detail(body))
        }
    };

    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || body.contains("API key not valid")
    {
        return RelayError::AuthFailed {
            provider,
            message: detail,
        };
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return RelayError::RateLimited { provider };
    }
    if status.is_server_error() && kind.tracks_overload() {
        return RelayError::Overloaded {
            provider,
            model: model.to_string(),
            message: detail,
        };
    }
    RelayError::Upstream {
        provider,
        message: detail,
        status: Some(status.as_u16()),
    }
}

/// `error.message` of a JSON error body, else the raw body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamControl {
    Continue,
    Stop,
}

/// Feed each SSE `data` payload of `response` to `on_data` until the stream
/// ends, `on_data` stops it, or `cancel` fires.
pub(crate) async fn drive_sse<F>(
    response: Response,
    provider: &str,
    cancel: Option<&CancellationToken>,
    mut on_data: F,
) -> Result<(), RelayError>
where
    F: FnMut(&str) -> Result<StreamControl, RelayError>,
{
    let mut events = Box::pin(response.bytes_stream().eventsource());

    loop {
        let next = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::info!(provider, "stream cancelled by caller");
                    return Err(RelayError::Cancelled);
                }
                event = events.next() => event,
            },
            None => events.next().await,
        };

        let Some(event) = next else {
            return Ok(());
        };
        let event = event.map_err(|e| RelayError::Network {
            provider: provider.to_string(),
            message: format!("stream interrupted: {e}"),
        })?;
        if event.data.is_empty() {
            continue;
        }
        if on_data(&event.data)? == StreamControl::Stop {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn status_mapping() {
        let gemini = ProviderKind::Gemini;
        let openai = ProviderKind::OpenAi;

        let e = status_error(gemini, "m", StatusCode::UNAUTHORIZED, "");
        assert_eq!(e.class(), ErrorClass::Auth);

        let body = r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key."}}"#;
        let e = status_error(gemini, "m", StatusCode::BAD_REQUEST, body);
        assert_eq!(e.class(), ErrorClass::Auth);

        let e = status_error(openai, "m", StatusCode::TOO_MANY_REQUESTS, "");
        assert_eq!(e.class(), ErrorClass::RateLimited);

        let e = status_error(gemini, "m", StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert_eq!(e.class(), ErrorClass::Overloaded);

        let e = status_error(openai, "m", StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert_eq!(e.class(), ErrorClass::Unknown);
        assert!(e.is_retryable());
    }

    #[test]
    fn error_detail_prefers_json_message() {
        assert_eq!(
            error_detail(r#"{"error":{"message":"quota"}}"#),
            "quota"
        );
        assert_eq!(error_detail(" plain text "), "plain text");
    }
}
