//! Orchestrator: agents → drafts → token check → arbiter stream.
//!
//! ```text
//! run(request)
//!   1. validate, map agents to experts, observer.on_initial_agents
//!   2. Dispatcher::dispatch          (observer.on_draft_complete per draft)
//!   3. all FAILED?                   → AllAgentsFailed, arbiter never called
//!   4. estimate synthesis prompt     (exact counter or chars/4)
//!   5. over threshold + small-context arbiter family?
//!                                    → substitute, observer.on_arbiter_switched
//!   6. Arbiter::arbitrate            → OrchestrationResult { drafts, stream, .. }
//! ```
//!
//! The size check runs after dispatch because it depends on what the
//! agents actually wrote.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::arbiter::{build_synthesis_prompt, Arbiter};
use crate::config::{
    validate_agents, AgentConfig, ArbiterSettings, OrchestratorConfig, ProviderPolicy,
};
use crate::dispatch::Dispatcher;
use crate::errors::OrchestrationError;
use crate::provider::{ClientRegistry, TextStream};
use crate::tokens::{estimate_tokens, TokenCounter, TokenEstimate};
use crate::types::{Draft, ExpertDispatch, ImageInput, ModelRef};

/// Progress notifications for the calling layer. Every method defaults to
/// a no-op.
pub trait RunObserver: Send {
    /// Fired once, before any generation begins.
    fn on_initial_agents(&mut self, _experts: &[ExpertDispatch]) {}

    /// Fired once per agent, in completion order.
    fn on_draft_complete(&mut self, _draft: &Draft) {}

    /// Fired at most once per run, when a larger-context arbiter is substituted.
    fn on_arbiter_switched(&mut self, _from: &ModelRef, _to: &ModelRef) {}
}

impl RunObserver for () {}

/// One orchestration request.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub images: Vec<ImageInput>,
    pub agents: Vec<AgentConfig>,
    pub arbiter: ArbiterSettings,
}

pub struct OrchestrationResult {
    /// One terminal draft per agent, in configured order.
    pub drafts: Vec<Draft>,
    /// Lazy arbiter answer; concatenate fragments for the full text.
    pub stream: TextStream,
    pub switched_arbiter: bool,
    /// The arbiter model actually invoked.
    pub arbiter_model: ModelRef,
    pub prompt_tokens: TokenEstimate,
}

impl std::fmt::Debug for OrchestrationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationResult")
            .field("drafts", &self.drafts)
            .field("switched_arbiter", &self.switched_arbiter)
            .field("arbiter_model", &self.arbiter_model)
            .field("prompt_tokens", &self.prompt_tokens)
            .finish_non_exhaustive()
    }
}

/// Substitute the provider's large-context model when the estimate exceeds
/// `threshold` and the provider family has one. `None` means keep `requested`.
pub fn select_arbiter_model(
    requested: &ModelRef,
    estimated_tokens: usize,
    threshold: usize,
    policy: &ProviderPolicy,
) -> Option<ModelRef> {
    if estimated_tokens <= threshold {
        return None;
    }
    let replacement = policy.large_context_model.as_deref()?;
    if replacement == requested.model {
        return None;
    }
    Some(ModelRef::new(requested.provider, replacement))
}

pub struct Orchestrator {
    dispatcher: Dispatcher,
    arbiter: Arbiter,
    config: OrchestratorConfig,
    token_counter: Option<Arc<dyn TokenCounter>>,
}

impl Orchestrator {
    pub fn new(clients: ClientRegistry, config: OrchestratorConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(clients.clone(), config.dispatch.clone()),
            arbiter: Arbiter::new(clients, config.dispatch.call_timeout()),
            config,
            token_counter: None,
        }
    }

    /// Use an exact tokenizer for the synthesis-prompt estimate.
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = Some(counter);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn run(
        &self,
        request: RunRequest,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("orchestration", %run_id);
        self.run_inner(request, observer, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        request: RunRequest,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        let RunRequest {
            prompt,
            images,
            mut agents,
            arbiter,
        } = request;

        if agents.is_empty() {
            return Err(OrchestrationError::NoAgents);
        }
        validate_agents(&agents).map_err(OrchestrationError::Configuration)?;
        self.config
            .validate()
            .map_err(OrchestrationError::Configuration)?;

        let experts: Vec<ExpertDispatch> = agents.iter().map(AgentConfig::expert).collect();
        observer.on_initial_agents(&experts);
        info!(agents = experts.len(), arbiter = %arbiter.model_ref(), "run started");

        let drafts = self
            .dispatcher
            .dispatch(
                &experts,
                &prompt,
                &images,
                &mut agents,
                |draft| observer.on_draft_complete(draft),
                cancel,
            )
            .await?;

        if !drafts.iter().any(Draft::is_completed) {
            warn!(agents = drafts.len(), "every agent failed, skipping arbiter");
            return Err(OrchestrationError::AllAgentsFailed { failures: drafts });
        }
        if cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled { settled: drafts });
        }

        let synthesis_prompt = build_synthesis_prompt(&prompt, &drafts);
        let prompt_tokens = estimate_tokens(self.token_counter.as_deref(), &synthesis_prompt);

        let requested = arbiter.model_ref();
        let policy = self.config.dispatch.policies.get(requested.provider);
        let (arbiter_model, switched_arbiter) = match select_arbiter_model(
            &requested,
            prompt_tokens.tokens,
            self.config.arbiter_token_threshold,
            &policy,
        ) {
            Some(replacement) => {
                info!(
                    from = %requested,
                    to = %replacement,
                    tokens = prompt_tokens.tokens,
                    exact = prompt_tokens.exact,
                    threshold = self.config.arbiter_token_threshold,
                    "switching to larger-context arbiter"
                );
                observer.on_arbiter_switched(&requested, &replacement);
                (replacement, true)
            }
            None => (requested, false),
        };

        let stream = self
            .arbiter
            .arbitrate(
                &arbiter_model,
                &prompt,
                &drafts,
                arbiter.verbosity,
                arbiter.effort,
                cancel,
            )
            .await?;

        Ok(OrchestrationResult {
            drafts,
            stream,
            switched_arbiter,
            arbiter_model,
            prompt_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;

    fn groq_policy() -> ProviderPolicy {
        ProviderPolicy::rate_limited(30).with_large_context_model("llama-3.3-70b-versatile")
    }

    #[test]
    fn below_threshold_keeps_requested_model() {
        let requested = ModelRef::new(Provider::Groq, "llama-3.1-8b-instant");
        assert_eq!(select_arbiter_model(&requested, 6_000, 6_000, &groq_policy()), None);
    }

    #[test]
    fn above_threshold_switches_small_context_family() {
        let requested = ModelRef::new(Provider::Groq, "llama-3.1-8b-instant");
        assert_eq!(
            select_arbiter_model(&requested, 6_001, 6_000, &groq_policy()),
            Some(ModelRef::new(Provider::Groq, "llama-3.3-70b-versatile"))
        );
    }

    #[test]
    fn large_context_families_never_switch() {
        let requested = ModelRef::new(Provider::Gemini, "gemini-2.5-pro");
        assert_eq!(
            select_arbiter_model(&requested, 1_000_000, 6_000, &ProviderPolicy::burst()),
            None
        );
    }

    #[test]
    fn already_on_replacement_is_not_a_switch() {
        let requested = ModelRef::new(Provider::Groq, "llama-3.3-70b-versatile");
        assert_eq!(select_arbiter_model(&requested, 50_000, 6_000, &groq_policy()), None);
    }
}
