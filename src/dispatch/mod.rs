pub mod adapter;
pub mod gemini;
pub mod openai;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Prefix of the instruction injected when a target language is configured.
pub const LANGUAGE_PROMPT: &str = "Respond in the following language: ";

/// Max size of a non-streaming response or error body.
pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// Earlier replies of the model. Also accepts "assistant".
    #[serde(alias = "assistant")]
    Model,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A single instruction or an ordered list of instruction parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemInstruction {
    Single(String),
    Parts(Vec<String>),
}

impl SystemInstruction {
    pub fn parts(&self) -> Vec<&str> {
        match self {
            Self::Single(s) => vec![s.as_str()],
            Self::Parts(parts) => parts.iter().map(String::as_str).collect(),
        }
    }

    pub fn joined(&self) -> String {
        self.parts().join("\n")
    }
}

/// Canonical request accepted by every provider. Not mutated once submitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationRequest {
    pub user_message: String,
    pub history_messages: Vec<HistoryMessage>,
    pub system_instruction: Option<SystemInstruction>,
    pub temperature: Option<f64>,
    pub model: Option<String>,
    pub stream: bool,
    pub language: Option<String>,
    #[serde(rename = "tryAutoFixJSONError")]
    pub try_auto_fix_json_error: Option<bool>,
    pub return_fallback_property: Option<bool>,
    /// Thinking budget in tokens for models that support one.
    pub thinking_budget: Option<u32>,
    /// Caller-driven cancellation. Streaming calls stop reading when cancelled.
    #[serde(skip)]
    pub cancellation_token: Option<CancellationToken>,
}

impl GenerationRequest {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            ..Default::default()
        }
    }

    pub fn with_system_instruction(mut self, instruction: SystemInstruction) -> Self {
        self.system_instruction = Some(instruction);
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryMessage>) -> Self {
        self.history_messages = history;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Final value of one logical request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub thoughts: String,
    pub content: serde_json::Value,
    /// True when a fallback provider produced this result.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fallback_used: bool,
}

impl GenerationResult {
    pub fn new(thoughts: String, content: serde_json::Value) -> Self {
        Self {
            thoughts,
            content,
            fallback_used: false,
        }
    }

    /// Record that a substitute answered. With `visible`, the marker is also
    /// written into the content object for downstream consumers.
    pub fn mark_fallback(&mut self, visible: bool) {
        self.fallback_used = true;
        if visible && let Some(obj) = self.content.as_object_mut() {
            obj.insert("fallbackUsed".to_string(), serde_json::Value::Bool(true));
        }
    }
}

/// Live output of a streaming request.
///
/// Every streaming attempt ends with exactly one `done` call on each
/// channel, whether it succeeded, failed or was cancelled. Text arriving
/// after a `done` belongs to a retry or fallback attempt that started over.
/// Plain `FnMut(&str, bool)` closures observe the narrative field only.
pub trait StreamObserver: Send {
    /// Next piece of the narrative field, already unescaped.
    fn on_delta(&mut self, delta: &str, done: bool);

    /// Next piece of the model's reasoning, for providers that stream it.
    fn on_thought(&mut self, _thought: &str, _done: bool) {}
}

impl<F> StreamObserver for F
where
    F: FnMut(&str, bool) + Send,
{
    fn on_delta(&mut self, delta: &str, done: bool) {
        self(delta, done)
    }
}

/// Observer made of a narrative callback and a reasoning callback.
pub struct WithThoughts<D, T> {
    on_delta: D,
    on_thought: T,
}

impl<D, T> WithThoughts<D, T>
where
    D: FnMut(&str, bool) + Send,
    T: FnMut(&str, bool) + Send,
{
    pub fn new(on_delta: D, on_thought: T) -> Self {
        Self {
            on_delta,
            on_thought,
        }
    }
}

impl<D, T> StreamObserver for WithThoughts<D, T>
where
    D: FnMut(&str, bool) + Send,
    T: FnMut(&str, bool) + Send,
{
    fn on_delta(&mut self, delta: &str, done: bool) {
        (self.on_delta)(delta, done)
    }

    fn on_thought(&mut self, thought: &str, done: bool) {
        (self.on_thought)(thought, done)
    }
}

/// Unparsed text a provider returned, before the parse ladder runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCompletion {
    pub text: String,
    pub thoughts: String,
}
