//! Provider capability contract.
//!
//! Each provider implementation exposes the same two calls: a single
//! full-text generation and a lazy stream of text increments. Handles are
//! built once by the caller and passed in through [`ClientRegistry`]; the
//! engine never constructs clients itself.
//!
//! A [`TextStream`] is finite, single-pass and not restartable. Dropping it
//! stops generation and releases the underlying connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, Effort, ProviderSettings, Verbosity};
use crate::errors::GenerationError;
use crate::types::{ImageInput, Provider, Step};

/// Lazy sequence of text fragments in generation order.
pub type TextStream = BoxStream<'static, Result<String, GenerationError>>;

/// Lazy sequence of token steps carrying top-k log-probabilities.
pub type StepStream = BoxStream<'static, Result<Step, GenerationError>>;

// ── Request shape ────────────────────────────────────────────────────────────

/// Provider-native reasoning control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningControl {
    /// Token allowance for internal thinking (Gemini, Anthropic).
    ThinkingBudget(u32),
    /// Named effort level (OpenAI reasoning models).
    Effort(Effort),
}

/// Map the small effort vocabulary onto a provider's native reasoning shape.
pub fn reasoning_for(provider: Provider, effort: Effort) -> Option<ReasoningControl> {
    match provider {
        Provider::Gemini => Some(ReasoningControl::ThinkingBudget(match effort {
            Effort::Low => 1_024,
            Effort::Medium => 8_192,
            Effort::High => 24_576,
        })),
        Provider::Anthropic => Some(ReasoningControl::ThinkingBudget(match effort {
            Effort::Low => 2_048,
            Effort::Medium => 8_192,
            Effort::High => 16_384,
        })),
        Provider::OpenAi => Some(ReasoningControl::Effort(effort)),
        Provider::Groq => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub reasoning: Option<ReasoningControl>,
    /// Native output-length control where the provider has one.
    pub verbosity: Option<Verbosity>,
}

impl SamplingParams {
    /// Per-agent parameters: the agent's knobs plus its effort level.
    pub fn for_agent(settings: &ProviderSettings, effort: Effort) -> Self {
        let reasoning = reasoning_for(settings.provider(), effort);
        match *settings {
            ProviderSettings::Gemini {
                temperature,
                top_p,
                top_k,
                max_output_tokens,
            } => Self {
                temperature,
                top_p,
                top_k,
                max_output_tokens,
                reasoning,
                verbosity: None,
            },
            ProviderSettings::OpenAi {
                temperature,
                top_p,
                max_output_tokens,
            }
            | ProviderSettings::Groq {
                temperature,
                top_p,
                max_output_tokens,
            } => Self {
                temperature,
                top_p,
                top_k: None,
                max_output_tokens,
                reasoning,
                verbosity: None,
            },
            ProviderSettings::Anthropic {
                temperature,
                max_output_tokens,
            } => Self {
                temperature,
                top_p: None,
                top_k: None,
                max_output_tokens,
                reasoning,
                verbosity: None,
            },
        }
    }
}

/// One generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    #[serde(default)]
    pub images: Vec<ImageInput>,
    #[serde(default)]
    pub params: SamplingParams,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            user_prompt: user_prompt.into(),
            images: Vec::new(),
            params: SamplingParams::default(),
        }
    }

    /// Request for one agent: persona as system prompt, agent knobs as params.
    pub fn for_agent(agent: &AgentConfig, prompt: &str, images: &[ImageInput]) -> Self {
        let persona = agent.persona.trim();
        Self {
            model: agent.model.clone(),
            system_prompt: (!persona.is_empty()).then(|| persona.to_string()),
            user_prompt: prompt.to_string(),
            images: images.to_vec(),
            params: SamplingParams::for_agent(&agent.settings, agent.effort),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    /// Same request with a different user prompt.
    pub fn with_user_prompt(&self, user_prompt: impl Into<String>) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            ..self.clone()
        }
    }
}

// ── Capability traits ────────────────────────────────────────────────────────

/// Minimal capability every provider client exposes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Generate a complete response.
    async fn generate_once(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError>;

    /// Start a streaming generation. Errors before the first fragment are
    /// returned directly; later errors arrive as stream items.
    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<TextStream, GenerationError>;
}

/// Token-level streaming with top-k log-probabilities.
///
/// No currently integrated provider exposes this; the confidence engine's
/// token-level scorers stay usable for one that does.
#[async_trait]
pub trait LogprobClient: Send + Sync {
    async fn stream_steps(
        &self,
        request: &GenerationRequest,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<StepStream, GenerationError>;
}

// ── ClientRegistry ───────────────────────────────────────────────────────────

/// Explicit per-provider client handles.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<Provider, Arc<dyn LlmClient>>,
    logprob_clients: HashMap<Provider, Arc<dyn LogprobClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under the provider it reports.
    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.clients.insert(client.provider(), client);
        self
    }

    pub fn with_logprob_client(mut self, provider: Provider, client: Arc<dyn LogprobClient>) -> Self {
        self.logprob_clients.insert(provider, client);
        self
    }

    pub fn client(&self, provider: Provider) -> Option<Arc<dyn LlmClient>> {
        self.clients.get(&provider).cloned()
    }

    pub fn logprob_client(&self, provider: Provider) -> Option<Arc<dyn LogprobClient>> {
        self.logprob_clients.get(&provider).cloned()
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.clients.keys().copied().collect();
        providers.sort();
        providers
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut logprob: Vec<Provider> = self.logprob_clients.keys().copied().collect();
        logprob.sort();
        f.debug_struct("ClientRegistry")
            .field("clients", &self.providers())
            .field("logprob_clients", &logprob)
            .finish()
    }
}
