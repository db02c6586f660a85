use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::dispatch::adapter::{StreamControl, drive_sse, error_from_response, read_body, send_error};
use crate::dispatch::{GenerationRequest, LANGUAGE_PROMPT, RawCompletion, Role};
use crate::error::RelayError;

const SAFETY_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_CIVIC_INTEGRITY",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Google Gemini `generateContent` API.
pub struct GeminiAdapter {
    client: Client,
    config: ProviderConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    response_mime_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_thoughts: Option<bool>,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<u16>,
    message: String,
    status: Option<String>,
}

impl GenerateContentResponse {
    /// Append answer text and thought text of the first candidate.
    fn collect_into(
        self,
        out: &mut RawCompletion,
        mut on_text: impl FnMut(&str),
        mut on_thought: impl FnMut(&str),
    ) {
        let parts = self
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content)
            .map(|c| c.parts)
            .unwrap_or_default();

        for part in parts {
            let Some(text) = part.text else { continue };
            if part.thought {
                on_thought(&text);
                out.thoughts.push_str(&text);
            } else {
                on_text(&text);
                out.text.push_str(&text);
            }
        }
    }
}

impl ApiError {
    fn into_relay_error(self, provider: &str) -> RelayError {
        let code = self.code.map(|c| c.to_string()).unwrap_or_default();
        let status = self.status.unwrap_or_default();
        RelayError::Upstream {
            provider: provider.to_string(),
            message: format!("{code} {status}: {}", self.message).trim().to_string(),
            status: None,
        }
    }
}

impl GeminiAdapter {
    pub fn new(client: Client, config: ProviderConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn url(&self, model: &str, stream: bool) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if stream {
            format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/v1beta/models/{model}:generateContent")
        }
    }

    fn build_body(&self, req: &GenerationRequest, model: &str) -> GenerateContentRequest {
        let mut contents: Vec<Content> = req
            .history_messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| Content {
                role: Some(match m.role {
                    Role::Model => "model",
                    Role::User | Role::System => "user",
                }),
                parts: vec![Part {
                    text: m.content.clone(),
                }],
            })
            .collect();
        if !req.user_message.is_empty() {
            contents.push(Content {
                role: Some("user"),
                parts: vec![Part {
                    text: req.user_message.clone(),
                }],
            });
        }

        let mut instruction_parts: Vec<Part> = req
            .system_instruction
            .as_ref()
            .map(|s| {
                s.parts()
                    .into_iter()
                    .map(|p| Part {
                        text: p.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(language) = effective_language(req, &self.config) {
            instruction_parts.push(Part {
                text: format!("{LANGUAGE_PROMPT}{language}"),
            });
        }
        let system_instruction = (!instruction_parts.is_empty()).then_some(Content {
            role: None,
            parts: instruction_parts,
        });

        let reasoning = &self.config.reasoning;
        let thinking_budget = reasoning
            .supports_thinking_budget(model)
            .then(|| req.thinking_budget.or(self.config.thinking_budget))
            .flatten();
        let include_thoughts = reasoning.supports_thoughts(model).then_some(true);
        let thinking_config = (thinking_budget.is_some() || include_thoughts.is_some()).then_some(
            ThinkingConfig {
                thinking_budget,
                include_thoughts,
            },
        );

        GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: self.config.resolve_temperature(req.temperature),
                response_mime_type: "text/plain",
                thinking_config,
            },
            safety_settings: SAFETY_CATEGORIES
                .into_iter()
                .map(|category| SafetySetting {
                    category,
                    threshold: "BLOCK_NONE",
                })
                .collect(),
        }
    }

    async fn send(
        &self,
        req: &GenerationRequest,
        model: &str,
        stream: bool,
    ) -> Result<reqwest::Response, RelayError> {
        let provider = self.config.kind.as_str();
        let api_key = self.config.require_api_key()?.unwrap_or_default();
        let body = self.build_body(req, model);
        tracing::debug!(
            provider,
            model,
            stream,
            messages = body.contents.len(),
            "sending gemini request"
        );

        let response = self
            .client
            .post(self.url(model, stream))
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(e, provider))?;

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

        let parsed: GenerateContentResponse =
            serde_json::from_slice(&bytes).map_err(|e| RelayError::InvalidResponse {
                provider: provider.to_string(),
                message: format!("unreadable body: {e}"),
            })?;
        if let Some(err) = parsed.error {
            return Err(err.into_relay_error(provider));
        }

        let mut out = RawCompletion::default();
        parsed.collect_into(&mut out, |_| {}, |_| {});
        if out.text.is_empty() {
            return Err(RelayError::InvalidResponse {
                provider: provider.to_string(),
                message: "Gemini did not send a response".to_string(),
            });
        }
        Ok(out)
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
                let chunk: GenerateContentResponse = match serde_json::from_str(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(provider, "skipping unreadable stream chunk: {e}");
                        return Ok(StreamControl::Continue);
                    }
                };
                if let Some(err) = chunk.error {
                    return Err(err.into_relay_error(provider));
                }
                chunk.collect_into(&mut out, |text| on_text(text), |thought| on_thought(thought));
                Ok(StreamControl::Continue)
            },
        )
        .await?;

        tracing::debug!(
            provider,
            len = out.text.len(),
            thoughts = out.thoughts.len(),
            "gemini stream completed"
        );
        Ok(out)
    }
}

/// Request language, else configured language. Empty disables injection.
pub(crate) fn effective_language<'a>(
    req: &'a GenerationRequest,
    config: &'a ProviderConfig,
) -> Option<&'a str> {
    req.language
        .as_deref()
        .or(config.language.as_deref())
        .filter(|l| !l.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GEMINI_FLASH_2_0, GEMINI_FLASH_THINKING_2_5, ProviderKind};
    use crate::dispatch::{HistoryMessage, SystemInstruction};

    fn adapter() -> GeminiAdapter {
        let mut config = ProviderConfig::new(ProviderKind::Gemini).with_api_key("k");
        config.language = Some("German".to_string());
        GeminiAdapter::new(Client::new(), config)
    }

    #[test]
    fn body_maps_roles_and_injects_language() {
        let req = GenerationRequest::new("go north")
            .with_history(vec![
                HistoryMessage::new(Role::User, "hi"),
                HistoryMessage::new(Role::Model, "hello"),
                HistoryMessage::new(Role::User, ""),
            ])
            .with_system_instruction(SystemInstruction::Parts(vec![
                "be terse".to_string(),
                "answer in JSON".to_string(),
            ]));
        let body = serde_json::to_value(adapter().build_body(&req, GEMINI_FLASH_2_0)).unwrap();

        let roles: Vec<&str> = body["contents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, ["user", "model", "user"]);
        assert_eq!(body["contents"][2]["parts"][0]["text"], "go north");

        let parts = body["systemInstruction"]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2]["text"], format!("{LANGUAGE_PROMPT}German"));
        assert!(body["generationConfig"].get("thinkingConfig").is_none());
        assert_eq!(body["safetySettings"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn thinking_model_gets_budget_and_thoughts() {
        let mut req = GenerationRequest::new("x");
        req.thinking_budget = Some(256);
        let body =
            serde_json::to_value(adapter().build_body(&req, GEMINI_FLASH_THINKING_2_5)).unwrap();
        let thinking = &body["generationConfig"]["thinkingConfig"];
        assert_eq!(thinking["thinkingBudget"], 256);
        assert_eq!(thinking["includeThoughts"], true);
    }

    #[test]
    fn temperature_is_clamped_to_maximum() {
        let req = GenerationRequest::new("x").with_temperature(5.0);
        let body = serde_json::to_value(adapter().build_body(&req, GEMINI_FLASH_2_0)).unwrap();
        assert_eq!(body["generationConfig"]["temperature"], 2.0);
    }
}
