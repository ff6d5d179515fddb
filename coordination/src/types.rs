//! Domain types shared by the dispatcher, confidence engine, arbiter and
//! orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Provider ─────────────────────────────────────────────────────────────────

/// Model provider family. Every configured agent and the arbiter belong to
/// exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    OpenAi,
    Anthropic,
    Groq,
}

impl Provider {
    pub fn all() -> [Provider; 4] {
        [Self::Gemini, Self::OpenAi, Self::Anthropic, Self::Groq]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Groq => "groq",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "groq" => Ok(Self::Groq),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// A concrete model on a concrete provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: Provider,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

// ── Inputs ───────────────────────────────────────────────────────────────────

/// One configured expert slot to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpertDispatch {
    pub agent_id: String,
    /// Persona / role text used as the expert's system prompt.
    pub persona: String,
    pub provider: Provider,
    pub model: String,
}

/// An inline image attached to the user prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInput {
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Base64-encoded image bytes (standard alphabet, padded).
    pub data_base64: String,
}

// ── Drafts ───────────────────────────────────────────────────────────────────

/// Terminal status of a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DraftStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Summary of the multi-trace sampling that produced a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingSummary {
    /// Vote share of the winning answer among the retained traces.
    pub consensus: f64,
    /// Traces produced (including early-stopped ones).
    pub traces_generated: usize,
    /// Traces that survived eta filtering in the final vote.
    pub traces_kept: usize,
    /// Traces truncated by the online early-stop rule.
    pub early_stopped: usize,
}

/// One expert's response attempt and its terminal status.
///
/// Created exactly once per agent per run and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub agent_id: String,
    pub expert: ExpertDispatch,
    pub content: String,
    pub status: DraftStatus,
    pub error: Option<String>,
    /// Set when a stream was interrupted after some content arrived.
    #[serde(default)]
    pub is_partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingSummary>,
    pub finished_at: DateTime<Utc>,
}

impl Draft {
    pub fn completed(expert: ExpertDispatch, content: impl Into<String>) -> Self {
        Self {
            agent_id: expert.agent_id.clone(),
            expert,
            content: content.into(),
            status: DraftStatus::Completed,
            error: None,
            is_partial: false,
            sampling: None,
            finished_at: Utc::now(),
        }
    }

    /// Content survived an interrupted stream; the interruption is kept as context.
    pub fn partial(
        expert: ExpertDispatch,
        content: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            is_partial: true,
            error: Some(error.into()),
            ..Self::completed(expert, content)
        }
    }

    pub fn failed(expert: ExpertDispatch, error: impl Into<String>) -> Self {
        Self {
            agent_id: expert.agent_id.clone(),
            expert,
            content: String::new(),
            status: DraftStatus::Failed,
            error: Some(error.into()),
            is_partial: false,
            sampling: None,
            finished_at: Utc::now(),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingSummary) -> Self {
        self.sampling = Some(sampling);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == DraftStatus::Completed
    }
}

// ── Traces ───────────────────────────────────────────────────────────────────

/// One alternative token with its log-probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCandidate {
    pub token: String,
    pub logprob: f64,
}

/// One generation unit with its top-k distribution (possibly empty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub token: String,
    #[serde(default)]
    pub top_k: Vec<TokenCandidate>,
}

impl Step {
    pub fn new(token: impl Into<String>, top_k: Vec<TokenCandidate>) -> Self {
        Self {
            token: token.into(),
            top_k,
        }
    }
}

/// One complete or truncated generation attempt.
///
/// `steps.len()` is the number of units actually produced; a trace aborted
/// before its first token has no steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub text: String,
    pub steps: Vec<Step>,
    /// Generation was cut short by the online early-stop rule.
    #[serde(default)]
    pub early_stopped: bool,
}

impl Trace {
    /// Build a trace from token steps, concatenating their text.
    pub fn from_steps(steps: Vec<Step>) -> Self {
        let text = steps.iter().map(|s| s.token.as_str()).collect();
        Self {
            text,
            steps,
            early_stopped: false,
        }
    }

    /// Treat a non-streamed response as a single step with no distribution.
    pub fn from_full_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let steps = if text.is_empty() {
            Vec::new()
        } else {
            vec![Step::new(text.clone(), Vec::new())]
        };
        Self {
            text,
            steps,
            early_stopped: false,
        }
    }

    /// The voting key: trimmed full text, compared by exact equality.
    pub fn answer(&self) -> &str {
        self.text.trim()
    }
}

/// Structured judgment of a candidate answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    /// Quality score in `[0, 1]`.
    pub score: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl JudgeResult {
    /// Zero score carrying a diagnostic, used when the judgment is unusable.
    pub fn unusable(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            reasons: vec![reason.into()],
        }
    }
}
