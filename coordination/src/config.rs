//! Agent, arbiter and scheduling configuration.
//!
//! All types are `serde` (de)serialisable so a panel can be described in a
//! TOML file. Configuration is created by the caller before a run and is
//! immutable during the run, except for [`AgentConfig::status`] which the
//! dispatcher advances.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::confidence::ConfidenceParams;
use crate::resilience::RetryPolicy;
use crate::types::{ExpertDispatch, ModelRef, Provider};

const DEFAULT_TRACE_COUNT: usize = 4;
const DEFAULT_TAU: f64 = 0.8;
const DEFAULT_GROUP_WINDOW: usize = 32;
/// Per-call timeout before a provider is reported as slow.
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 180;
/// Estimated synthesis-prompt size above which small-context arbiters are swapped.
const DEFAULT_ARBITER_TOKEN_THRESHOLD: usize = 6_000;
/// Free-tier Groq ceiling.
const DEFAULT_GROQ_RPM: u32 = 30;
const DEFAULT_GROQ_LARGE_CONTEXT_MODEL: &str = "llama-3.3-70b-versatile";

// ── Knob vocabularies ────────────────────────────────────────────────────────

/// How an agent spends its generation budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationStrategy {
    /// One provider call.
    #[default]
    Single,
    /// Fixed batch of traces, eta-filtered, weighted vote.
    OfflineConfidence,
    /// Warmup batch, then one trace at a time until consensus or budget.
    OnlineConfidence,
}

impl GenerationStrategy {
    pub fn is_multi_trace(self) -> bool {
        !matches!(self, Self::Single)
    }
}

impl std::fmt::Display for GenerationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::OfflineConfidence => write!(f, "offline-confidence"),
            Self::OnlineConfidence => write!(f, "online-confidence"),
        }
    }
}

/// Share of sampled traces retained after confidence filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EtaPercent {
    /// Aggressive: keep the most confident 10%.
    Ten,
    /// Conservative: keep the most confident 90%.
    #[default]
    Ninety,
}

impl EtaPercent {
    pub fn percent(self) -> u8 {
        match self {
            Self::Ten => 10,
            Self::Ninety => 90,
        }
    }

    /// `max(1, floor(eta / 100 * n))`.
    pub fn keep_count(self, n: usize) -> usize {
        (n * self.percent() as usize / 100).max(1)
    }
}

impl TryFrom<u8> for EtaPercent {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(Self::Ten),
            90 => Ok(Self::Ninety),
            other => Err(format!("eta_percent must be 10 or 90, got {other}")),
        }
    }
}

impl From<EtaPercent> for u8 {
    fn from(eta: EtaPercent) -> Self {
        eta.percent()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Effort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Verbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Progress of one agent within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

// ── Agents ───────────────────────────────────────────────────────────────────

/// Provider-specific sampling knobs, keyed by provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderSettings {
    Gemini {
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        top_p: Option<f32>,
        #[serde(default)]
        top_k: Option<u32>,
        #[serde(default)]
        max_output_tokens: Option<u32>,
    },
    OpenAi {
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        top_p: Option<f32>,
        #[serde(default)]
        max_output_tokens: Option<u32>,
    },
    Anthropic {
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_output_tokens: Option<u32>,
    },
    Groq {
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        top_p: Option<f32>,
        #[serde(default)]
        max_output_tokens: Option<u32>,
    },
}

impl ProviderSettings {
    pub fn provider(&self) -> Provider {
        match self {
            Self::Gemini { .. } => Provider::Gemini,
            Self::OpenAi { .. } => Provider::OpenAi,
            Self::Anthropic { .. } => Provider::Anthropic,
            Self::Groq { .. } => Provider::Groq,
        }
    }

    /// Provider defaults with every knob unset.
    pub fn defaults_for(provider: Provider) -> Self {
        match provider {
            Provider::Gemini => Self::Gemini {
                temperature: None,
                top_p: None,
                top_k: None,
                max_output_tokens: None,
            },
            Provider::OpenAi => Self::OpenAi {
                temperature: None,
                top_p: None,
                max_output_tokens: None,
            },
            Provider::Anthropic => Self::Anthropic {
                temperature: None,
                max_output_tokens: None,
            },
            Provider::Groq => Self::Groq {
                temperature: None,
                top_p: None,
                max_output_tokens: None,
            },
        }
    }
}

fn default_trace_count() -> usize {
    DEFAULT_TRACE_COUNT
}

fn default_tau() -> f64 {
    DEFAULT_TAU
}

fn default_group_window() -> usize {
    DEFAULT_GROUP_WINDOW
}

/// One configured agent slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub persona: String,
    pub model: String,
    #[serde(flatten)]
    pub settings: ProviderSettings,
    #[serde(default)]
    pub effort: Effort,
    #[serde(default)]
    pub generation_strategy: GenerationStrategy,
    /// Maximum traces for multi-trace strategies (`>= 2`).
    #[serde(default = "default_trace_count")]
    pub trace_count: usize,
    #[serde(default)]
    pub eta_percent: EtaPercent,
    /// Consensus threshold in `(0, 1]`.
    #[serde(default = "default_tau")]
    pub tau: f64,
    /// Sliding window, in tokens, for group confidence (`>= 1`).
    #[serde(default = "default_group_window")]
    pub group_window: usize,
    #[serde(skip)]
    pub status: AgentStatus,
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, model: impl Into<String>, settings: ProviderSettings) -> Self {
        Self {
            id: id.into(),
            persona: String::new(),
            model: model.into(),
            settings,
            effort: Effort::default(),
            generation_strategy: GenerationStrategy::default(),
            trace_count: DEFAULT_TRACE_COUNT,
            eta_percent: EtaPercent::default(),
            tau: DEFAULT_TAU,
            group_window: DEFAULT_GROUP_WINDOW,
            status: AgentStatus::default(),
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn with_effort(mut self, effort: Effort) -> Self {
        self.effort = effort;
        self
    }

    pub fn with_strategy(mut self, strategy: GenerationStrategy) -> Self {
        self.generation_strategy = strategy;
        self
    }

    pub fn with_sampling(mut self, trace_count: usize, eta: EtaPercent, tau: f64) -> Self {
        self.trace_count = trace_count;
        self.eta_percent = eta;
        self.tau = tau;
        self
    }

    pub fn with_group_window(mut self, window: usize) -> Self {
        self.group_window = window;
        self
    }

    pub fn provider(&self) -> Provider {
        self.settings.provider()
    }

    pub fn expert(&self) -> ExpertDispatch {
        ExpertDispatch {
            agent_id: self.id.clone(),
            persona: self.persona.clone(),
            provider: self.provider(),
            model: self.model.clone(),
        }
    }

    pub fn confidence_params(&self) -> ConfidenceParams {
        ConfidenceParams::new(self.trace_count, self.eta_percent, self.tau, self.group_window)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("agent id must not be empty".to_string());
        }
        if self.model.trim().is_empty() {
            return Err(format!("agent '{}': model must not be empty", self.id));
        }
        if self.trace_count < 2 {
            return Err(format!(
                "agent '{}': trace_count must be >= 2, got {}",
                self.id, self.trace_count
            ));
        }
        if !(self.tau > 0.0 && self.tau <= 1.0) {
            return Err(format!(
                "agent '{}': tau must be in (0, 1], got {}",
                self.id, self.tau
            ));
        }
        if self.group_window == 0 {
            return Err(format!("agent '{}': group_window must be >= 1", self.id));
        }
        Ok(())
    }
}

/// Validate a whole panel: every agent valid, ids unique, at least one agent.
pub fn validate_agents(agents: &[AgentConfig]) -> Result<(), String> {
    if agents.is_empty() {
        return Err("at least one agent is required".to_string());
    }
    let mut seen = std::collections::HashSet::new();
    for agent in agents {
        agent.validate()?;
        if !seen.insert(agent.id.as_str()) {
            return Err(format!("duplicate agent id '{}'", agent.id));
        }
    }
    Ok(())
}

// ── Arbiter ──────────────────────────────────────────────────────────────────

/// Arbiter-level `{model, verbosity, effort}` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterSettings {
    pub provider: Provider,
    pub model: String,
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default)]
    pub effort: Effort,
}

impl ArbiterSettings {
    pub fn model_ref(&self) -> ModelRef {
        ModelRef::new(self.provider, self.model.clone())
    }
}

// ── Provider policy ──────────────────────────────────────────────────────────

/// How the dispatcher schedules agents on one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Scheduling {
    /// All agents start at once; completions interleave freely.
    #[default]
    Burst,
    /// Agents run one after another in configured order, spaced to stay
    /// under the requests-per-minute ceiling.
    RateLimited { requests_per_minute: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPolicy {
    #[serde(default)]
    pub scheduling: Scheduling,
    /// Set for provider families whose arbiter models have a small context
    /// window; names the larger-context model to substitute.
    #[serde(default)]
    pub large_context_model: Option<String>,
}

impl ProviderPolicy {
    pub fn burst() -> Self {
        Self::default()
    }

    pub fn rate_limited(requests_per_minute: u32) -> Self {
        Self {
            scheduling: Scheduling::RateLimited {
                requests_per_minute,
            },
            large_context_model: None,
        }
    }

    pub fn with_large_context_model(mut self, model: impl Into<String>) -> Self {
        self.large_context_model = Some(model.into());
        self
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self.scheduling, Scheduling::RateLimited { .. })
    }

    /// Spacing between consecutive requests, `None` for burst providers.
    pub fn request_interval(&self) -> Option<Duration> {
        match self.scheduling {
            Scheduling::Burst => None,
            Scheduling::RateLimited {
                requests_per_minute,
            } => Some(Duration::from_millis(
                60_000 / u64::from(requests_per_minute.max(1)),
            )),
        }
    }
}

/// Policy per provider; providers without an entry are burst-tolerant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable(BTreeMap<Provider, ProviderPolicy>);

impl PolicyTable {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, provider: Provider, policy: ProviderPolicy) -> Self {
        self.0.insert(provider, policy);
        self
    }

    pub fn get(&self, provider: Provider) -> ProviderPolicy {
        self.0.get(&provider).cloned().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), String> {
        for (provider, policy) in &self.0 {
            if let Scheduling::RateLimited {
                requests_per_minute: 0,
            } = policy.scheduling
            {
                return Err(format!("{provider}: requests_per_minute must be > 0"));
            }
        }
        Ok(())
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::empty().with(
            Provider::Groq,
            ProviderPolicy::rate_limited(DEFAULT_GROQ_RPM)
                .with_large_context_model(DEFAULT_GROQ_LARGE_CONTEXT_MODEL),
        )
    }
}

// ── Dispatcher / orchestrator ────────────────────────────────────────────────

fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

fn default_arbiter_token_threshold() -> usize {
    DEFAULT_ARBITER_TOKEN_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Timeout for one generation call, independent of cancellation.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub policies: PolicyTable,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
            policies: PolicyTable::default(),
        }
    }
}

impl DispatchConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.call_timeout_secs == 0 {
            return Err("call_timeout_secs must be > 0".to_string());
        }
        self.retry.validate()?;
        self.policies.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Fixed safety threshold for the estimated synthesis prompt.
    #[serde(default = "default_arbiter_token_threshold")]
    pub arbiter_token_threshold: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            arbiter_token_threshold: DEFAULT_ARBITER_TOKEN_THRESHOLD,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.arbiter_token_threshold == 0 {
            return Err("arbiter_token_threshold must be > 0".to_string());
        }
        self.dispatch.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentConfig {
        AgentConfig::new(
            "a1",
            "gemini-2.5-flash",
            ProviderSettings::defaults_for(Provider::Gemini),
        )
    }

    #[test]
    fn eta_keep_count_floors_with_minimum_one() {
        assert_eq!(EtaPercent::Ninety.keep_count(10), 9);
        assert_eq!(EtaPercent::Ten.keep_count(10), 1);
        assert_eq!(EtaPercent::Ten.keep_count(3), 1);
        assert_eq!(EtaPercent::Ninety.keep_count(1), 1);
        assert_eq!(EtaPercent::Ninety.keep_count(0), 1);
    }

    #[test]
    fn eta_rejects_other_percentages() {
        assert!(EtaPercent::try_from(50).is_err());
        assert_eq!(EtaPercent::try_from(10).unwrap(), EtaPercent::Ten);
    }

    #[test]
    fn default_agent_validates() {
        agent().validate().expect("default agent should be valid");
    }

    #[test]
    fn invalid_knobs_rejected() {
        assert!(agent().with_sampling(1, EtaPercent::Ten, 0.5).validate().is_err());
        assert!(agent().with_sampling(4, EtaPercent::Ten, 0.0).validate().is_err());
        assert!(agent().with_sampling(4, EtaPercent::Ten, 1.5).validate().is_err());
        assert!(agent().with_group_window(0).validate().is_err());
        assert!(agent().with_sampling(4, EtaPercent::Ten, 1.0).validate().is_ok());
    }

    #[test]
    fn duplicate_ids_rejected() {
        assert!(validate_agents(&[agent(), agent()]).is_err());
        assert!(validate_agents(&[]).is_err());
    }

    #[test]
    fn rate_limited_interval_from_rpm() {
        let policy = ProviderPolicy::rate_limited(30);
        assert_eq!(policy.request_interval(), Some(Duration::from_secs(2)));
        assert_eq!(ProviderPolicy::burst().request_interval(), None);
    }

    #[test]
    fn default_policy_table_limits_groq_only() {
        let table = PolicyTable::default();
        assert!(table.get(Provider::Groq).is_rate_limited());
        assert!(table.get(Provider::Groq).large_context_model.is_some());
        assert!(!table.get(Provider::Gemini).is_rate_limited());
    }

    #[test]
    fn agent_deserializes_with_flattened_provider_tag() {
        let json = r#"{
            "id": "critic",
            "persona": "Skeptical reviewer",
            "model": "gpt-5-mini",
            "provider": "openai",
            "temperature": 0.7,
            "generation_strategy": "online-confidence",
            "trace_count": 6,
            "eta_percent": 10
        }"#;
        let agent: AgentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(agent.provider(), Provider::OpenAi);
        assert_eq!(agent.generation_strategy, GenerationStrategy::OnlineConfidence);
        assert_eq!(agent.eta_percent, EtaPercent::Ten);
        assert_eq!(agent.tau, DEFAULT_TAU);
        assert_eq!(agent.status, AgentStatus::Pending);
    }
}
