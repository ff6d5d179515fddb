//! Panel configuration: TOML file, environment keys and CLI overrides.
//!
//! ```toml
//! arbiter_token_threshold = 6000
//!
//! [arbiter]
//! provider = "groq"
//! model = "llama-3.1-8b-instant"
//! verbosity = "low"
//!
//! [[agents]]
//! id = "physicist"
//! provider = "gemini"
//! model = "gemini-2.5-pro"
//! persona = "You are a careful physicist."
//! generation_strategy = "online-confidence"
//! trace_count = 6
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use moe_coordination::config::validate_agents;
use moe_coordination::{
    AgentConfig, ArbiterSettings, ClientRegistry, DispatchConfig, Effort, OrchestratorConfig,
    Provider, Verbosity,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::providers::{http_client, AnthropicClient, GeminiClient, OpenAiCompatibleClient};

/// Environment variable holding the API key for `provider`.
pub fn api_key_var(provider: Provider) -> &'static str {
    match provider {
        Provider::Gemini => "GEMINI_API_KEY",
        Provider::OpenAi => "OPENAI_API_KEY",
        Provider::Anthropic => "ANTHROPIC_API_KEY",
        Provider::Groq => "GROQ_API_KEY",
    }
}

/// Environment variable overriding the API base URL for `provider`.
pub fn base_url_var(provider: Provider) -> String {
    format!("MOE_{}_BASE_URL", provider.as_str().to_ascii_uppercase())
}

/// On-disk panel description.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelFile {
    pub arbiter: ArbiterSettings,
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub arbiter_token_threshold: Option<usize>,
}

impl PanelFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read panel config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid panel config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let panel: Self = toml::from_str(text).context("Failed to parse TOML")?;
        panel.validate()?;
        Ok(panel)
    }

    pub fn validate(&self) -> Result<()> {
        validate_agents(&self.agents).map_err(|e| anyhow!(e))?;
        self.orchestrator_config().validate().map_err(|e| anyhow!(e))?;
        if self.arbiter.model.trim().is_empty() {
            return Err(anyhow!("arbiter model must not be empty"));
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        OrchestratorConfig {
            dispatch: self.dispatch.clone(),
            arbiter_token_threshold: self
                .arbiter_token_threshold
                .unwrap_or(defaults.arbiter_token_threshold),
        }
    }

    /// Providers the panel will call, agents and arbiter together.
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.agents.iter().map(AgentConfig::provider).collect();
        providers.push(self.arbiter.provider);
        providers.sort();
        providers.dedup();
        providers
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(provider) = overrides.arbiter_provider {
            self.arbiter.provider = provider;
        }
        if let Some(model) = &overrides.arbiter_model {
            self.arbiter.model = model.clone();
        }
        if let Some(verbosity) = overrides.verbosity {
            self.arbiter.verbosity = verbosity;
        }
        if let Some(effort) = overrides.effort {
            self.arbiter.effort = effort;
        }
        if let Some(secs) = overrides.timeout_secs {
            self.dispatch.call_timeout_secs = secs;
        }
    }
}

/// Command-line overrides layered on top of the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub arbiter_provider: Option<Provider>,
    pub arbiter_model: Option<String>,
    pub verbosity: Option<Verbosity>,
    pub effort: Option<Effort>,
    pub timeout_secs: Option<u64>,
}

/// API keys and base-URL overrides per provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderEnv {
    api_keys: BTreeMap<Provider, String>,
    base_urls: BTreeMap<Provider, String>,
}

impl ProviderEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut env = Self::default();
        for provider in Provider::all() {
            if let Some(key) = lookup(api_key_var(provider)).filter(|k| !k.trim().is_empty()) {
                env.api_keys.insert(provider, key);
            }
            if let Some(url) = lookup(&base_url_var(provider)).filter(|u| !u.trim().is_empty()) {
                env.base_urls.insert(provider, url);
            }
        }
        env
    }

    pub fn api_key(&self, provider: Provider) -> Option<String> {
        self.api_keys.get(&provider).cloned()
    }

    pub fn base_url(&self, provider: Provider) -> Option<&str> {
        self.base_urls.get(&provider).map(String::as_str)
    }
}

/// Build one client per provider in `providers`. A provider without a key
/// still gets a client; its calls fail with a missing-key error so the run
/// reports that agent as failed instead of refusing to start.
pub fn build_registry(providers: &[Provider], env: &ProviderEnv) -> Result<ClientRegistry> {
    let http = http_client().context("Failed to create HTTP client")?;
    let mut registry = ClientRegistry::new();
    for &provider in providers {
        let key = env.api_key(provider);
        if key.is_none() {
            warn!(%provider, var = api_key_var(provider), "API key not set");
        }
        let base_url = env.base_url(provider);
        if let Some(url) = base_url {
            debug!(%provider, url, "base URL override");
        }
        registry = match provider {
            Provider::Gemini => {
                let mut client = GeminiClient::new(http.clone(), key);
                if let Some(url) = base_url {
                    client = client.with_base_url(url);
                }
                registry.with_client(Arc::new(client))
            }
            Provider::OpenAi | Provider::Groq => {
                let mut client = if provider == Provider::OpenAi {
                    OpenAiCompatibleClient::openai(http.clone(), key)
                } else {
                    OpenAiCompatibleClient::groq(http.clone(), key)
                };
                if let Some(url) = base_url {
                    client = client.with_base_url(url);
                }
                registry.with_client(Arc::new(client))
            }
            Provider::Anthropic => {
                let mut client = AnthropicClient::new(http.clone(), key);
                if let Some(url) = base_url {
                    client = client.with_base_url(url);
                }
                registry.with_client(Arc::new(client))
            }
        };
    }
    Ok(registry)
}
