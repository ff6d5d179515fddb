//! Error taxonomy with retry classification.
//!
//! Callers query `retry_category()` / `is_retriable()` instead of matching
//! on message strings.
//!
//! | Category     | Retriable | Raised by                                   |
//! |--------------|-----------|---------------------------------------------|
//! | Transient    | yes       | network failure, 5xx, timeout, broken stream |
//! | RateLimit    | yes       | HTTP 429 / provider quota                   |
//! | ParseFailure | no        | response body not in the expected shape     |
//! | Terminal     | no        | 4xx, missing key, unsupported capability    |
//! | Cancelled    | no        | shared cancellation token fired             |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::{Draft, Provider};

/// Classification used to decide whether a provider call may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    Transient,
    RateLimit,
    ParseFailure,
    Terminal,
    Cancelled,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::ParseFailure => write!(f, "parse_failure"),
            Self::Terminal => write!(f, "terminal"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Failure of a single provider call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    /// Transport-level failure (DNS, connect, reset).
    #[error("request failed: {0}")]
    Request(String),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The per-call timeout fired. Distinct from transport errors.
    #[error("timed out after {:.1}s", .after.as_secs_f64())]
    Timeout { after: Duration },

    /// A streaming response broke off.
    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("unexpected response shape: {0}")]
    Parse(String),

    #[error("API key not configured for {0}")]
    MissingApiKey(Provider),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Request(_) | Self::Timeout { .. } | Self::Stream(_) => RetryCategory::Transient,
            Self::Status { status, .. } if *status == 429 => RetryCategory::RateLimit,
            Self::Status { status, .. } if *status >= 500 => RetryCategory::Transient,
            Self::Status { .. } => RetryCategory::Terminal,
            Self::RateLimited(_) => RetryCategory::RateLimit,
            Self::Parse(_) => RetryCategory::ParseFailure,
            Self::MissingApiKey(_) | Self::Unsupported(_) => RetryCategory::Terminal,
            Self::Cancelled => RetryCategory::Cancelled,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Failure of the synthesis step.
#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("no completed drafts to synthesise")]
    NoCompletedDrafts,

    #[error("no client configured for arbiter provider {0}")]
    MissingClient(Provider),

    #[error("arbiter generation failed: {0}")]
    Generation(#[from] GenerationError),
}

/// Run-level failure surfaced to the caller.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The shared token fired. Carries the drafts that settled before it did.
    #[error("run cancelled ({} draft(s) settled)", .settled.len())]
    Cancelled { settled: Vec<Draft> },

    /// Every agent produced a FAILED draft; the arbiter was never invoked.
    #[error("all {} agent(s) failed: {}", .failures.len(), summarize_failures(.failures))]
    AllAgentsFailed { failures: Vec<Draft> },

    #[error("no agents configured")]
    NoAgents,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Arbiter(#[from] ArbiterError),
}

impl OrchestrationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. } | Self::Arbiter(ArbiterError::Generation(GenerationError::Cancelled))
        )
    }
}

fn summarize_failures(failures: &[Draft]) -> String {
    failures
        .iter()
        .map(|d| {
            format!(
                "{} ({})",
                d.agent_id,
                d.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}
