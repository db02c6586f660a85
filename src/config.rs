use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;

pub const GEMINI_FLASH_THINKING_2_5: &str = "gemini-2.5-flash-preview-05-20";
pub const GEMINI_FLASH_THINKING_2_0: &str = "gemini-2.0-flash-thinking-exp-01-21";
pub const GEMINI_FLASH_2_0: &str = "gemini-2.0-flash";
pub const OPENAI_GPT_4O: &str = "gpt-4o";
pub const POLLINATIONS_MODEL: &str = "openai";

/// Small thinking budget (tokens) for quick replies.
pub const THINKING_BUDGET_FAST: u32 = 256;

/// Closed set of supported providers.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Gemini,
    #[serde(alias = "open_ai")]
    OpenAi,
    Pollinations,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::Pollinations => "pollinations",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gemini" => Some(Self::Gemini),
            "openai" | "open_ai" => Some(Self::OpenAi),
            "pollinations" => Some(Self::Pollinations),
            _ => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Pollinations => "https://text.pollinations.ai/openai",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Gemini => GEMINI_FLASH_THINKING_2_5,
            Self::OpenAi => OPENAI_GPT_4O,
            Self::Pollinations => POLLINATIONS_MODEL,
        }
    }

    pub fn default_temperature(&self) -> f64 {
        1.0
    }

    pub fn max_temperature(&self) -> f64 {
        2.0
    }

    /// Environment variable holding the credential, if the provider needs one.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Pollinations => None,
        }
    }

    /// Providers whose 5xx responses are treated as "overloaded" and tracked.
    pub fn tracks_overload(&self) -> bool {
        matches!(self, Self::Gemini)
    }
}

/// Retry-with-backoff knobs shared by every orchestrator in a chain.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_jitter_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Per-provider settings as written in the config file. Unset fields fall
/// back to the provider defaults when the chain is built.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub temperature: Option<f64>,
    pub max_temperature: Option<f64>,
    pub thinking_budget: Option<u32>,
    pub thinking_budget_models: Option<Vec<String>>,
    pub thoughts_models: Option<Vec<String>>,
}

/// Per-agent override. Every unset field inherits the global configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentOverride {
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub language: Option<String>,
    pub try_auto_fix_json: Option<bool>,
    pub use_fallback: Option<bool>,
}

/// Which models support a thinking budget and which return thoughts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReasoningCapabilities {
    pub budget_models: Vec<String>,
    pub thoughts_models: Vec<String>,
}

impl ReasoningCapabilities {
    pub fn defaults_for(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Gemini => Self {
                budget_models: vec![GEMINI_FLASH_THINKING_2_5.to_string()],
                thoughts_models: vec![
                    GEMINI_FLASH_THINKING_2_5.to_string(),
                    GEMINI_FLASH_THINKING_2_0.to_string(),
                ],
            },
            ProviderKind::OpenAi | ProviderKind::Pollinations => Self::default(),
        }
    }

    pub fn supports_thinking_budget(&self, model: &str) -> bool {
        self.budget_models.iter().any(|m| m == model)
    }

    pub fn supports_thoughts(&self, model: &str) -> bool {
        self.thoughts_models.iter().any(|m| m == model)
    }

    /// Thinking models are the ones tracked under their own overload flag.
    pub fn is_thinking_model(&self, model: &str) -> bool {
        self.supports_thinking_budget(model)
    }
}

/// Resolved configuration handed to one adapter. Never mutated after build.
#[derive(Clone, PartialEq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub default_temperature: f64,
    pub max_temperature: f64,
    pub thinking_budget: Option<u32>,
    pub reasoning: ReasoningCapabilities,
    pub language: Option<String>,
    pub try_auto_fix_json: bool,
    pub return_fallback_property: bool,
    pub narrative_field: String,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_temperature", &self.max_temperature)
            .field("language", &self.language)
            .field("try_auto_fix_json", &self.try_auto_fix_json)
            .finish_non_exhaustive()
    }
}

impl ProviderConfig {
    /// Defaults for `kind` with no credential and no overrides.
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            api_key: None,
            base_url: kind.default_base_url().to_string(),
            model: kind.default_model().to_string(),
            temperature: None,
            default_temperature: kind.default_temperature(),
            max_temperature: kind.max_temperature(),
            thinking_budget: None,
            reasoning: ReasoningCapabilities::defaults_for(kind),
            language: None,
            try_auto_fix_json: true,
            return_fallback_property: false,
            narrative_field: DEFAULT_NARRATIVE_FIELD.to_string(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Request override, then configured value, then provider default.
    /// An explicit zero on either side wins; the result is kept within
    /// `0..=max_temperature`, and NaN on either side resolves to 0.
    pub fn resolve_temperature(&self, requested: Option<f64>) -> f64 {
        if requested == Some(0.0) || self.temperature == Some(0.0) {
            return 0.0;
        }
        let max = self.max_temperature.max(0.0);
        requested
            .or(self.temperature)
            .unwrap_or(self.default_temperature)
            .max(0.0)
            .min(max)
    }

    /// Credential or a fail-fast error for providers that need one.
    pub fn require_api_key(&self) -> Result<Option<&str>, RelayError> {
        match (self.kind.api_key_env(), self.api_key.as_deref()) {
            (None, key) => Ok(key.filter(|k| !k.is_empty())),
            (Some(_), Some(key)) if !key.trim().is_empty() => Ok(Some(key)),
            (Some(setting), _) => Err(RelayError::MissingCredential {
                provider: self.kind.as_str().to_string(),
                setting: setting.to_string(),
            }),
        }
    }
}

pub const DEFAULT_NARRATIVE_FIELD: &str = "story";

fn default_narrative_field() -> String {
    DEFAULT_NARRATIVE_FIELD.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub primary: ProviderKind,
    pub use_fallback: bool,
    /// Provider used after the primary's own chain when `use_fallback` is on
    /// and the primary is not Gemini.
    pub fallback_provider: Option<ProviderKind>,
    #[serde(default = "default_narrative_field")]
    pub narrative_field: String,
    pub language: Option<String>,
    #[serde(default = "default_true")]
    pub try_auto_fix_json: bool,
    pub return_fallback_property: bool,
    pub retry: RetryConfig,
    /// Keyed by provider name (`gemini`, `openai`, `pollinations`).
    pub providers: HashMap<String, ProviderSettings>,
    pub agents: HashMap<String, AgentOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary: ProviderKind::default(),
            use_fallback: false,
            fallback_provider: None,
            narrative_field: default_narrative_field(),
            language: None,
            try_auto_fix_json: true,
            return_fallback_property: false,
            retry: RetryConfig::default(),
            providers: HashMap::new(),
            agents: HashMap::new(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, RelayError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| RelayError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject temperatures that are negative or not finite.
    pub fn validate(&self) -> Result<(), RelayError> {
        let providers = self.providers.iter().flat_map(|(name, settings)| {
            [
                (name, "temperature", settings.temperature),
                (name, "max_temperature", settings.max_temperature),
            ]
        });
        let agents = self
            .agents
            .iter()
            .map(|(name, over)| (name, "temperature", over.temperature));

        for (owner, field, value) in providers.chain(agents) {
            if let Some(v) = value
                && !(v.is_finite() && v >= 0.0)
            {
                return Err(RelayError::Config(format!(
                    "{owner}.{field} must be a finite number >= 0, got {v}"
                )));
            }
        }
        Ok(())
    }

    /// Load the config file (if any) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, RelayError> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| {
                    RelayError::Config(format!("failed to read {}: {e}", p.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment wins over the file for credentials and endpoint overrides.
    pub fn apply_env(&mut self) {
        if let Some(kind) = env::var("STORYRELAY_PROVIDER")
            .ok()
            .and_then(|p| ProviderKind::parse(&p))
        {
            self.primary = kind;
        }

        for kind in [ProviderKind::Gemini, ProviderKind::OpenAi] {
            if let Some(var) = kind.api_key_env()
                && let Ok(key) = env::var(var)
                && !key.trim().is_empty()
            {
                self.providers_mut(kind).api_key = Some(key);
            }
        }

        if let Ok(url) = env::var("OPENAI_BASE_URL") {
            self.providers_mut(ProviderKind::OpenAi).base_url = Some(url);
        }
        if let Ok(model) = env::var("OPENAI_MODEL") {
            self.providers_mut(ProviderKind::OpenAi).model = Some(model);
        }

        let primary = self.primary;
        if let Some(var) = primary.api_key_env()
            && self
                .provider_settings(primary)
                .and_then(|s| s.api_key.as_ref())
                .is_none()
        {
            tracing::warn!("{var} not set, {} requests will fail", primary.as_str());
        }
    }

    pub fn provider_settings(&self, kind: ProviderKind) -> Option<&ProviderSettings> {
        self.providers.get(kind.as_str())
    }

    fn providers_mut(&mut self, kind: ProviderKind) -> &mut ProviderSettings {
        self.providers.entry(kind.as_str().to_string()).or_default()
    }

    /// Resolve the adapter config for `kind`, applying file settings over defaults.
    pub fn provider_config(&self, kind: ProviderKind) -> ProviderConfig {
        let mut resolved = ProviderConfig::new(kind);
        resolved.language = self.language.clone();
        resolved.try_auto_fix_json = self.try_auto_fix_json;
        resolved.return_fallback_property = self.return_fallback_property;
        resolved.narrative_field = self.narrative_field.clone();

        if let Some(settings) = self.provider_settings(kind) {
            resolved.api_key = settings.api_key.clone();
            if let Some(url) = &settings.base_url {
                resolved.base_url = url.trim_end_matches('/').to_string();
            }
            if let Some(model) = &settings.model {
                resolved.model = model.clone();
            }
            resolved.temperature = settings.temperature;
            if let Some(max) = settings.max_temperature {
                resolved.max_temperature = max;
            }
            resolved.thinking_budget = settings.thinking_budget;
            if let Some(models) = &settings.thinking_budget_models {
                resolved.reasoning.budget_models = models.clone();
            }
            if let Some(models) = &settings.thoughts_models {
                resolved.reasoning.thoughts_models = models.clone();
            }
        }
        resolved
    }

    /// Model used by the tertiary link of a Gemini chain.
    pub fn fallback_model(&self, kind: ProviderKind) -> String {
        self.provider_settings(kind)
            .and_then(|s| s.fallback_model.clone())
            .unwrap_or_else(|| match kind {
                ProviderKind::Gemini => GEMINI_FLASH_2_0.to_string(),
                other => other.default_model().to_string(),
            })
    }

    /// Global config with the named agent's overrides applied on top.
    /// Unknown agent names yield the global configuration unchanged.
    pub fn for_agent(&self, agent: &str) -> Config {
        let mut merged = self.clone();
        let Some(over) = self.agents.get(agent) else {
            return merged;
        };

        if let Some(kind) = over.provider {
            merged.primary = kind;
        }
        let primary = merged.primary;
        let settings = merged.providers_mut(primary);
        if let Some(model) = &over.model {
            settings.model = Some(model.clone());
        }
        if let Some(temperature) = over.temperature {
            settings.temperature = Some(temperature);
        }
        if let Some(language) = &over.language {
            merged.language = Some(language.clone());
        }
        if let Some(fix) = over.try_auto_fix_json {
            merged.try_auto_fix_json = fix;
        }
        if let Some(use_fallback) = over.use_fallback {
            merged.use_fallback = use_fallback;
        }
        merged
    }
}
