//! Trace providers: how one generation attempt is produced and scored.
//!
//! The sampling algorithms only see [`TraceProvider`]. Two implementations
//! exist and are chosen explicitly by the dispatcher:
//!
//! - [`LogprobTraceProvider`] streams token steps with top-k log-probabilities,
//!   scores traces with the token metrics and can truncate a trace early.
//! - [`JudgeTraceProvider`] makes one full-text call and scores the answer
//!   with a [`Judge`]. It cannot truncate within a trace.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::judge::Judge;
use super::metrics::{
    group_confidence, token_confidence, token_confidences, trace_confidence, ConfidenceMetric,
};
use crate::errors::GenerationError;
use crate::provider::{GenerationRequest, LlmClient, LogprobClient};
use crate::resilience::{guarded, RequestPacer, RetryPolicy};
use crate::types::Trace;

/// Intra-trace stopping rule used by the online algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EarlyStop {
    /// Warmup-derived confidence floor.
    pub threshold: f64,
    pub window: usize,
    pub min_tokens: usize,
}

impl EarlyStop {
    /// `true` once enough tokens arrived and the trailing group dips below the floor.
    pub fn should_stop(&self, conf: &[f64]) -> bool {
        if conf.is_empty() || conf.len() < self.min_tokens {
            return false;
        }
        group_confidence(conf, conf.len() - 1, self.window) < self.threshold
    }
}

#[async_trait]
pub trait TraceProvider: Send + Sync {
    /// Whether `generate` honours an [`EarlyStop`] rule.
    fn supports_early_stop(&self) -> bool;

    async fn generate(
        &self,
        prompt: &str,
        early_stop: Option<&EarlyStop>,
        cancel: &CancellationToken,
    ) -> Result<Trace, GenerationError>;

    /// Score a finished trace. Higher means more trustworthy.
    async fn score(
        &self,
        prompt: &str,
        trace: &Trace,
        metric: &ConfidenceMetric,
        cancel: &CancellationToken,
    ) -> Result<f64, GenerationError>;
}

// ── Log-probability streaming ────────────────────────────────────────────────

pub struct LogprobTraceProvider {
    client: Arc<dyn LogprobClient>,
    template: GenerationRequest,
    top_k: usize,
    timeout: Duration,
    pacer: Option<Arc<RequestPacer>>,
}

impl LogprobTraceProvider {
    pub fn new(
        client: Arc<dyn LogprobClient>,
        template: GenerationRequest,
        top_k: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            template,
            top_k,
            timeout,
            pacer: None,
        }
    }

    pub fn with_pacer(mut self, pacer: Option<Arc<RequestPacer>>) -> Self {
        self.pacer = pacer;
        self
    }

    async fn collect(
        &self,
        request: &GenerationRequest,
        early_stop: Option<&EarlyStop>,
        cancel: &CancellationToken,
    ) -> Result<Trace, GenerationError> {
        let mut stream = self.client.stream_steps(request, self.top_k, cancel).await?;
        let mut steps = Vec::new();
        let mut conf = Vec::new();
        let mut early_stopped = false;

        while let Some(item) = stream.next().await {
            match item {
                Ok(step) => {
                    conf.push(token_confidence(&step.top_k, self.top_k));
                    steps.push(step);
                    if early_stop.is_some_and(|rule| rule.should_stop(&conf)) {
                        early_stopped = true;
                        break;
                    }
                }
                Err(e) if e.is_cancelled() || steps.is_empty() => return Err(e),
                Err(e) => {
                    warn!(steps = steps.len(), error = %e, "trace stream interrupted, keeping partial trace");
                    break;
                }
            }
        }
        // Dropping the stream here releases the connection on early stop.
        drop(stream);

        if early_stopped {
            debug!(steps = steps.len(), "trace stopped early");
        }
        let mut trace = Trace::from_steps(steps);
        trace.early_stopped = early_stopped;
        Ok(trace)
    }
}

#[async_trait]
impl TraceProvider for LogprobTraceProvider {
    fn supports_early_stop(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        prompt: &str,
        early_stop: Option<&EarlyStop>,
        cancel: &CancellationToken,
    ) -> Result<Trace, GenerationError> {
        if let Some(pacer) = &self.pacer {
            pacer.acquire(cancel).await?;
        }
        let request = self.template.with_user_prompt(prompt);
        guarded(cancel, self.timeout, self.collect(&request, early_stop, cancel)).await
    }

    async fn score(
        &self,
        _prompt: &str,
        trace: &Trace,
        metric: &ConfidenceMetric,
        _cancel: &CancellationToken,
    ) -> Result<f64, GenerationError> {
        Ok(trace_confidence(&token_confidences(trace, self.top_k), metric))
    }
}

// ── Full text + judge ────────────────────────────────────────────────────────

pub struct JudgeTraceProvider {
    client: Arc<dyn LlmClient>,
    template: GenerationRequest,
    judge: Judge,
    timeout: Duration,
    retry: RetryPolicy,
    pacer: Option<Arc<RequestPacer>>,
}

impl JudgeTraceProvider {
    pub fn new(
        client: Arc<dyn LlmClient>,
        template: GenerationRequest,
        judge: Judge,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            template,
            judge,
            timeout,
            retry: RetryPolicy::none(),
            pacer: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pacer(mut self, pacer: Option<Arc<RequestPacer>>) -> Self {
        self.pacer = pacer;
        self
    }
}

#[async_trait]
impl TraceProvider for JudgeTraceProvider {
    fn supports_early_stop(&self) -> bool {
        false
    }

    async fn generate(
        &self,
        prompt: &str,
        _early_stop: Option<&EarlyStop>,
        cancel: &CancellationToken,
    ) -> Result<Trace, GenerationError> {
        let request = &self.template.with_user_prompt(prompt);
        let pacer = self.pacer.as_deref();
        let client = &self.client;
        let timeout = self.timeout;
        let text = self
            .retry
            .execute(cancel, || async move {
                if let Some(pacer) = pacer {
                    pacer.acquire(cancel).await?;
                }
                guarded(cancel, timeout, client.generate_once(request, cancel)).await
            })
            .await?;
        Ok(Trace::from_full_text(text))
    }

    async fn score(
        &self,
        prompt: &str,
        trace: &Trace,
        _metric: &ConfidenceMetric,
        cancel: &CancellationToken,
    ) -> Result<f64, GenerationError> {
        let judgment = self.judge.evaluate(prompt, trace.answer(), cancel).await?;
        Ok(judgment.score)
    }
}
