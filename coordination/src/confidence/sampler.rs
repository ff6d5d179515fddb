//! Offline and online confidence sampling.
//!
//! **Offline**: generate the whole batch concurrently, score every trace,
//! keep the top eta% and vote.
//!
//! **Online**: generate a warmup batch, derive a stopping threshold from its
//! lowest-group confidences, then add one trace at a time until the
//! eta-filtered vote reaches `tau` or the budget is spent. Traces from a
//! provider that streams log-probabilities are truncated as soon as their
//! trailing group confidence falls below the threshold.
//!
//! Both algorithms drop individual failed traces. Cancellation propagates
//! immediately and no trace is issued after the token fires.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metrics::ConfidenceMetric;
use super::trace_provider::{EarlyStop, TraceProvider};
use super::voting::{eta_filter, weighted_vote};
use crate::config::EtaPercent;
use crate::errors::GenerationError;
use crate::types::{SamplingSummary, Trace};

const DEFAULT_TOP_K: usize = 5;

/// Knobs for one agent's multi-trace run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceParams {
    /// Maximum traces generated in total.
    pub trace_count: usize,
    pub eta: EtaPercent,
    pub tau: f64,
    pub group_window: usize,
    pub warmup_traces: usize,
    pub min_tokens_before_stop: usize,
    /// Offline scoring metric. The online algorithm always uses lowest-group.
    pub metric: ConfidenceMetric,
    pub top_k: usize,
}

impl ConfidenceParams {
    pub fn new(trace_count: usize, eta: EtaPercent, tau: f64, group_window: usize) -> Self {
        let group_window = group_window.max(1);
        Self {
            trace_count,
            eta,
            tau,
            group_window,
            warmup_traces: trace_count.div_ceil(2).max(1),
            min_tokens_before_stop: group_window,
            metric: ConfidenceMetric::LowestGroup {
                window: group_window,
            },
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_warmup(mut self, warmup_traces: usize) -> Self {
        self.warmup_traces = warmup_traces;
        self
    }

    pub fn with_metric(mut self, metric: ConfidenceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_min_tokens_before_stop(mut self, min_tokens: usize) -> Self {
        self.min_tokens_before_stop = min_tokens;
        self
    }

    fn warmup_count(&self) -> usize {
        self.warmup_traces.clamp(1, self.trace_count.max(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTrace {
    pub trace: Trace,
    pub score: f64,
}

/// Result of a multi-trace run.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceOutcome {
    /// Winning answer (trimmed trace text).
    pub answer: String,
    /// Full text of the first retained trace that produced the answer.
    pub trace_text: String,
    pub consensus: f64,
    pub traces_generated: usize,
    pub traces_kept: usize,
    pub early_stopped: usize,
    /// Online stopping threshold; `None` for offline runs.
    pub threshold: Option<f64>,
}

impl ConfidenceOutcome {
    pub fn summary(&self) -> SamplingSummary {
        SamplingSummary {
            consensus: self.consensus,
            traces_generated: self.traces_generated,
            traces_kept: self.traces_kept,
            early_stopped: self.early_stopped,
        }
    }
}

// ── Shared steps ─────────────────────────────────────────────────────────────

/// Generate `count` traces concurrently, dropping individual failures.
async fn generate_batch(
    provider: &dyn TraceProvider,
    prompt: &str,
    count: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Trace>, GenerationError> {
    let results = join_all((0..count).map(|_| provider.generate(prompt, None, cancel))).await;

    let mut traces = Vec::with_capacity(count);
    let mut first_error = None;
    for result in results {
        match result {
            Ok(trace) => traces.push(trace),
            Err(GenerationError::Cancelled) => return Err(GenerationError::Cancelled),
            Err(e) => {
                warn!(error = %e, "trace generation failed, dropping trace");
                first_error.get_or_insert(e);
            }
        }
    }
    if cancel.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }
    match (traces.is_empty(), first_error) {
        (true, Some(e)) => Err(e),
        _ => Ok(traces),
    }
}

async fn score_all(
    provider: &dyn TraceProvider,
    prompt: &str,
    traces: Vec<Trace>,
    metric: &ConfidenceMetric,
    cancel: &CancellationToken,
) -> Result<Vec<ScoredTrace>, GenerationError> {
    let scores = join_all(
        traces
            .iter()
            .map(|trace| provider.score(prompt, trace, metric, cancel)),
    )
    .await;

    traces
        .into_iter()
        .zip(scores)
        .map(|(trace, score)| score.map(|score| ScoredTrace { trace, score }))
        .collect()
}

struct Tally {
    answer: String,
    trace_text: String,
    consensus: f64,
    kept: usize,
}

/// Eta-filter the scored traces and vote over the survivors.
fn tally_votes(scored: &[ScoredTrace], eta: EtaPercent) -> Option<Tally> {
    let kept = eta_filter(scored, eta, |s| s.score);
    let vote = weighted_vote(kept.iter().map(|s| (s.trace.answer(), s.score)))?;
    let trace_text = kept
        .iter()
        .find(|s| s.trace.answer() == vote.answer)
        .map(|s| s.trace.text.clone())
        .unwrap_or_else(|| vote.answer.clone());
    Some(Tally {
        answer: vote.answer,
        trace_text,
        consensus: vote.consensus,
        kept: kept.len(),
    })
}

fn no_traces() -> GenerationError {
    GenerationError::Parse("no traces were produced".to_string())
}

/// Score at the `(100 - eta)`th percentile of the ascending warmup scores.
pub fn stop_threshold(scores: &[f64], eta: EtaPercent) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (sorted.len() * usize::from(100 - eta.percent())) / 100;
    sorted[rank.min(sorted.len() - 1)]
}

// ── Algorithms ───────────────────────────────────────────────────────────────

pub async fn run_offline(
    provider: &dyn TraceProvider,
    prompt: &str,
    params: &ConfidenceParams,
    cancel: &CancellationToken,
) -> Result<ConfidenceOutcome, GenerationError> {
    let traces = generate_batch(provider, prompt, params.trace_count.max(1), cancel).await?;
    let scored = score_all(provider, prompt, traces, &params.metric, cancel).await?;
    let tally = tally_votes(&scored, params.eta).ok_or_else(no_traces)?;

    info!(
        traces = scored.len(),
        kept = tally.kept,
        consensus = tally.consensus,
        "offline confidence vote complete"
    );

    Ok(ConfidenceOutcome {
        answer: tally.answer,
        trace_text: tally.trace_text,
        consensus: tally.consensus,
        traces_generated: scored.len(),
        traces_kept: tally.kept,
        early_stopped: 0,
        threshold: None,
    })
}

pub async fn run_online(
    provider: &dyn TraceProvider,
    prompt: &str,
    params: &ConfidenceParams,
    cancel: &CancellationToken,
) -> Result<ConfidenceOutcome, GenerationError> {
    let budget = params.trace_count.max(1);
    let warmup = params.warmup_count();
    let metric = ConfidenceMetric::LowestGroup {
        window: params.group_window,
    };

    let traces = generate_batch(provider, prompt, warmup, cancel).await?;
    let mut scored = score_all(provider, prompt, traces, &metric, cancel).await?;
    let mut issued = warmup;

    let warmup_scores: Vec<f64> = scored.iter().map(|s| s.score).collect();
    let threshold = stop_threshold(&warmup_scores, params.eta);
    let early_stop = provider.supports_early_stop().then_some(EarlyStop {
        threshold,
        window: params.group_window,
        min_tokens: params.min_tokens_before_stop,
    });
    debug!(warmup = scored.len(), threshold, "online warmup complete");

    let mut early_stopped = 0;
    let tally = loop {
        let tally = tally_votes(&scored, params.eta).ok_or_else(no_traces)?;
        if tally.consensus >= params.tau {
            debug!(traces = scored.len(), consensus = tally.consensus, "consensus reached");
            break tally;
        }
        if issued >= budget {
            break tally;
        }
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        issued += 1;
        match provider.generate(prompt, early_stop.as_ref(), cancel).await {
            Ok(trace) => {
                if trace.early_stopped {
                    early_stopped += 1;
                }
                let score = provider.score(prompt, &trace, &metric, cancel).await?;
                debug!(
                    issued,
                    score,
                    steps = trace.steps.len(),
                    early_stopped = trace.early_stopped,
                    "online trace scored"
                );
                scored.push(ScoredTrace { trace, score });
            }
            Err(GenerationError::Cancelled) => return Err(GenerationError::Cancelled),
            Err(e) => warn!(issued, error = %e, "online trace failed, continuing"),
        }
    };

    info!(
        traces = scored.len(),
        issued,
        kept = tally.kept,
        consensus = tally.consensus,
        early_stopped,
        "online confidence vote complete"
    );

    Ok(ConfidenceOutcome {
        answer: tally.answer,
        trace_text: tally.trace_text,
        consensus: tally.consensus,
        traces_generated: scored.len(),
        traces_kept: tally.kept,
        early_stopped,
        threshold: Some(threshold),
    })
}
