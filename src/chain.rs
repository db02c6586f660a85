use std::sync::Arc;

use reqwest::Client;

use crate::config::{Config, ProviderConfig, ProviderKind};
use crate::dispatch::adapter::{ProviderAdapter, build_client};
use crate::dispatch::{GenerationRequest, GenerationResult, StreamObserver};
use crate::error::RelayError;
use crate::orchestrator::RequestOrchestrator;
use crate::overload::OverloadState;
use crate::retry::RetryPolicy;
use crate::sink::{ErrorSink, TracingSink};

/// Builds provider chains from configuration. Every chain built by one
/// factory shares the HTTP client, the overload flags and the error sink.
pub struct ProviderFactory {
    config: Config,
    client: Client,
    overload: Arc<OverloadState>,
    sink: Arc<dyn ErrorSink>,
}

impl ProviderFactory {
    pub fn new(config: Config) -> Result<Self, RelayError> {
        Ok(Self::with_client(config, build_client()?))
    }

    pub fn with_client(config: Config, client: Client) -> Self {
        Self {
            config,
            client,
            overload: Arc::new(OverloadState::new()),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_overload_state(mut self, overload: Arc<OverloadState>) -> Self {
        self.overload = overload;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn overload_state(&self) -> &Arc<OverloadState> {
        &self.overload
    }

    /// Chain for the global configuration.
    pub fn chain(&self) -> ProviderChain {
        self.build(&self.config)
    }

    /// Chain for a named agent: its overrides on top of the global config.
    pub fn chain_for(&self, agent: &str) -> ProviderChain {
        self.build(&self.config.for_agent(agent))
    }

    fn link(&self, provider: ProviderConfig, config: &Config) -> RequestOrchestrator {
        RequestOrchestrator::new(
            ProviderAdapter::new(provider, self.client.clone()),
            self.overload.clone(),
            RetryPolicy::from(&config.retry),
            self.sink.clone(),
        )
    }

    fn build(&self, config: &Config) -> ProviderChain {
        let primary = config.provider_config(config.primary);

        let head = match config.primary {
            // Gemini retries the same model once more as a secondary, then
            // optionally drops to the lighter fallback model.
            ProviderKind::Gemini => {
                let mut secondary = self.link(primary.clone(), config);
                if config.use_fallback {
                    let tertiary = primary
                        .clone()
                        .with_model(config.fallback_model(ProviderKind::Gemini));
                    secondary = secondary.with_fallback(self.link(tertiary, config));
                }
                self.link(primary, config).with_fallback(secondary)
            }
            ProviderKind::OpenAi => {
                let head = self.link(primary, config);
                match config.fallback_provider {
                    Some(kind) if config.use_fallback && kind != config.primary => {
                        head.with_fallback(self.link(config.provider_config(kind), config))
                    }
                    _ => head,
                }
            }
            ProviderKind::Pollinations => self.link(primary, config),
        };

        let chain = ProviderChain {
            head,
            overload: self.overload.clone(),
        };
        tracing::debug!(links = ?chain.links(), "provider chain built");
        chain
    }
}

/// Entry point callers use: the head orchestrator of a linked chain.
pub struct ProviderChain {
    head: RequestOrchestrator,
    overload: Arc<OverloadState>,
}

impl ProviderChain {
    pub async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResult, RelayError> {
        self.head.generate(req).await
    }

    pub async fn generate_stream(
        &self,
        req: &GenerationRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<GenerationResult, RelayError> {
        self.head.generate_stream(req, observer).await
    }

    /// Dispatch on `req.stream`. Streaming output goes to `observer`.
    pub async fn submit(
        &self,
        req: &GenerationRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<GenerationResult, RelayError> {
        if req.stream {
            self.generate_stream(req, observer).await
        } else {
            self.generate(req).await
        }
    }

    pub fn head(&self) -> &RequestOrchestrator {
        &self.head
    }

    /// Provider and model of each link, primary first.
    pub fn links(&self) -> Vec<(ProviderKind, String)> {
        let mut links = Vec::new();
        let mut current = Some(&self.head);
        while let Some(link) = current {
            let config = link.adapter().config();
            links.push((config.kind, config.model.clone()));
            current = link.fallback();
        }
        links
    }

    /// Forget every overload flag, e.g. after the user changed providers.
    pub fn clear_overload(&self) {
        self.overload.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GEMINI_FLASH_2_0, GEMINI_FLASH_THINKING_2_5, POLLINATIONS_MODEL};

    fn factory(toml: &str) -> ProviderFactory {
        let config = Config::from_toml_str(toml).unwrap();
        ProviderFactory::with_client(config, Client::new())
    }

    #[test]
    fn gemini_chain_without_fallback_repeats_model() {
        let chain = factory("primary = \"gemini\"").chain();
        let links = chain.links();
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|(k, m)| *k == ProviderKind::Gemini
            && m == GEMINI_FLASH_THINKING_2_5));
    }

    #[test]
    fn gemini_chain_with_fallback_ends_on_flash() {
        let chain = factory("primary = \"gemini\"\nuse_fallback = true").chain();
        let links = chain.links();
        assert_eq!(links.len(), 3);
        assert_eq!(links[2], (ProviderKind::Gemini, GEMINI_FLASH_2_0.to_string()));
    }

    #[test]
    fn openai_chain_uses_configured_fallback_provider() {
        let alone = factory("primary = \"openai\"\nuse_fallback = true").chain();
        assert_eq!(alone.links().len(), 1);

        let chained = factory(
            "primary = \"openai\"\nuse_fallback = true\nfallback_provider = \"pollinations\"",
        )
        .chain();
        assert_eq!(
            chained.links(),
            vec![
                (ProviderKind::OpenAi, "gpt-4o".to_string()),
                (ProviderKind::Pollinations, POLLINATIONS_MODEL.to_string()),
            ]
        );
    }

    #[test]
    fn agent_override_changes_primary() {
        let f = factory(
            r#"
primary = "gemini"

[agents.summary]
provider = "openai"
model = "gpt-4o-mini"
"#,
        );
        assert_eq!(
            f.chain_for("summary").links(),
            vec![(ProviderKind::OpenAi, "gpt-4o-mini".to_string())]
        );
        assert_eq!(f.chain_for("unknown").links().len(), 2);
    }
}
