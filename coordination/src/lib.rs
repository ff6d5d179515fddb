//! Mixture-of-experts coordination library
//!
//! Several independently configured model agents draft answers to one
//! prompt; optional confidence-driven sampling decides how many attempts an
//! agent spends and which to trust; an arbiter model then streams one
//! synthesised answer from the drafts that completed.
//!
//! # Components
//!
//! - **Dispatcher** ([`dispatch`]): one terminal draft per agent, burst vs
//!   rate-limited scheduling, failure isolation, partial-stream handling
//! - **Confidence engine** ([`confidence`]): DeepConf-style token metrics,
//!   weighted voting, offline/online sampling, judge-scored variant
//! - **Arbiter** ([`arbiter`]): synthesis prompt, provider-native
//!   effort/verbosity mapping, cancellable answer stream
//! - **Orchestrator** ([`orchestrator`]): end-to-end run, token estimate and
//!   larger-context arbiter substitution
//!
//! Provider HTTP clients live outside this crate and plug in through
//! [`provider::LlmClient`] handles collected in a [`ClientRegistry`].
//!
//! # Usage
//!
//! ```ignore
//! use moe_coordination::{ClientRegistry, Orchestrator, OrchestratorConfig, RunRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! let clients = ClientRegistry::new()
//!     .with_client(gemini_client)
//!     .with_client(groq_client);
//! let orchestrator = Orchestrator::new(clients, OrchestratorConfig::default());
//!
//! let mut result = orchestrator
//!     .run(request, &mut (), &CancellationToken::new())
//!     .await?;
//! while let Some(fragment) = result.stream.next().await {
//!     print!("{}", fragment?);
//! }
//! ```

pub mod arbiter;
pub mod confidence;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod orchestrator;
pub mod provider;
pub mod resilience;
pub mod tokens;
pub mod types;

pub use arbiter::{build_synthesis_prompt, Arbiter};
pub use config::{
    AgentConfig, AgentStatus, ArbiterSettings, DispatchConfig, Effort, EtaPercent,
    GenerationStrategy, OrchestratorConfig, PolicyTable, ProviderPolicy, ProviderSettings,
    Scheduling, Verbosity,
};
pub use dispatch::Dispatcher;
pub use errors::{ArbiterError, GenerationError, OrchestrationError, RetryCategory};
pub use orchestrator::{OrchestrationResult, Orchestrator, RunObserver, RunRequest};
pub use provider::{
    ClientRegistry, GenerationRequest, LlmClient, LogprobClient, ReasoningControl,
    SamplingParams, StepStream, TextStream,
};
pub use resilience::{RequestPacer, RetryPolicy};
pub use tokens::{estimate_tokens, TokenCounter, TokenEstimate};
pub use types::{
    Draft, DraftStatus, ExpertDispatch, ImageInput, JudgeResult, ModelRef, Provider,
    SamplingSummary, Step, TokenCandidate, Trace,
};
