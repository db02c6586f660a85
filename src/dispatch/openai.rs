use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::dispatch::adapter::{StreamControl, drive_sse, error_from_response, read_body, send_error};
use crate::dispatch::gemini::effective_language;
use crate::dispatch::{GenerationRequest, LANGUAGE_PROMPT, RawCompletion, Role};
use crate::error::RelayError;

const MAX_TOKENS: u32 = 4000;

/// OpenAI-compatible `/chat/completions` endpoint. Also serves keyless
/// compatible services such as Pollinations.
pub struct OpenAiAdapter {
    client: Client,
    config: ProviderConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
    frequency_penalty: f64,
    presence_penalty: f64,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ChunkError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkError {
    message: String,
}

impl OpenAiAdapter {
    pub fn new(client: Client, config: ProviderConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn build_messages(&self, req: &GenerationRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(req.history_messages.len() + 2);

        if let Some(system) = &req.system_instruction {
            messages.push(ChatMessage {
                role: "system",
                content: system.joined(),
            });
        }

        messages.extend(
            req.history_messages
                .iter()
                .filter(|m| !m.content.is_empty())
                .map(|m| ChatMessage {
                    role: match m.role {
                        Role::User => "user",
                        Role::Model => "assistant",
                        Role::System => "system",
                    },
                    content: m.content.clone(),
                }),
        );

        let content = match effective_language(req, &self.config) {
            Some(language) => format!("{LANGUAGE_PROMPT}{language}\n\n{}", req.user_message),
            None => req.user_message.clone(),
        };
        messages.push(ChatMessage {
            role: "user",
            content,
        });
        messages
    }

    async fn send(
        &self,
        req: &GenerationRequest,
        model: &str,
        stream: bool,
    ) -> Result<reqwest::Response, RelayError> {
        let provider = self.config.kind.as_str();
        let api_key = self.config.require_api_key()?;
        let body = ChatRequest {
            model,
            messages: self.build_messages(req),
            temperature: self.config.resolve_temperature(req.temperature),
            max_tokens: MAX_TOKENS,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stream,
        };
        tracing::debug!(
            provider,
            model,
            stream,
            messages = body.messages.len(),
            "sending chat completion request"
        );

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut request = self.client.post(url).json(&body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| send_error(e, provider))?;

        if !response.status().is_success() {
            return Err(error_from_response(response, &self.config, model).await);
        }
        Ok(response)
    }

    pub async fn complete(
        &self,
        req: &GenerationRequest,
        model: &str,
    ) -> Result<RawCompletion, RelayError> {
        let provider = self.config.kind.as_str();
        let response = self.send(req, model, false).await?;
        let bytes = read_body(response, provider).await?;

        let completion: ChatCompletion =
            serde_json::from_slice(&bytes).map_err(|e| RelayError::InvalidResponse {
                provider: provider.to_string(),
                message: format!("unreadable body: {e}"),
            })?;

        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| RelayError::InvalidResponse {
                provider: provider.to_string(),
                message: "empty choices".to_string(),
            })?;

        Ok(RawCompletion {
            text: message.content.unwrap_or_default(),
            thoughts: message.reasoning_content.unwrap_or_default(),
        })
    }

    pub async fn stream(
        &self,
        req: &GenerationRequest,
        model: &str,
        on_text: &mut (dyn FnMut(&str) + Send),
        on_thought: &mut (dyn FnMut(&str) + Send),
    ) -> Result<RawCompletion, RelayError> {
        let provider = self.config.kind.as_str();
        let response = self.send(req, model, true).await?;

        let mut out = RawCompletion::default();
        drive_sse(
            response,
            provider,
            req.cancellation_token.as_ref(),
            |data| {
                if data.trim() == "[DONE]" {
                    return Ok(StreamControl::Stop);
                }
                let chunk: ChatChunk = match serde_json::from_str(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(provider, "skipping unreadable stream chunk: {e}");
                        return Ok(StreamControl::Continue);
                    }
                };
                if let Some(err) = chunk.error {
                    return Err(RelayError::Upstream {
                        provider: provider.to_string(),
                        message: format!("OpenAI API Error: {}", err.message),
                        status: None,
                    });
                }
                for delta in chunk.choices.into_iter().filter_map(|c| c.delta) {
                    if let Some(thought) = delta.reasoning_content
                        && !thought.is_empty()
                    {
                        on_thought(&thought);
                        out.thoughts.push_str(&thought);
                    }
                    if let Some(text) = delta.content
                        && !text.is_empty()
                    {
                        on_text(&text);
                        out.text.push_str(&text);
                    }
                }
                Ok(StreamControl::Continue)
            },
        )
        .await?;

        tracing::debug!(provider, len = out.text.len(), "chat completion stream completed");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::dispatch::{HistoryMessage, SystemInstruction};

    #[test]
    fn messages_join_system_and_prefix_language() {
        let mut config = ProviderConfig::new(ProviderKind::OpenAi).with_api_key("k");
        config.language = Some("French".to_string());
        let adapter = OpenAiAdapter::new(Client::new(), config);

        let req = GenerationRequest::new("look around")
            .with_system_instruction(SystemInstruction::Parts(vec![
                "one".to_string(),
                "two".to_string(),
            ]))
            .with_history(vec![HistoryMessage::new(Role::Model, "a cave")]);
        let messages = adapter.build_messages(&req);

        let roles: Vec<&str> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, ["system", "assistant", "user"]);
        assert_eq!(messages[0].content, "one\ntwo");
        assert_eq!(
            messages[2].content,
            format!("{LANGUAGE_PROMPT}French\n\nlook around")
        );
    }

    #[test]
    fn request_language_overrides_config() {
        let mut config = ProviderConfig::new(ProviderKind::Pollinations);
        config.language = Some("French".to_string());
        let adapter = OpenAiAdapter::new(Client::new(), config);

        let mut req = GenerationRequest::new("hi");
        req.language = Some(String::new());
        assert_eq!(adapter.build_messages(&req)[0].content, "hi");
    }
}
