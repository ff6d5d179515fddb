//! Dispatcher: one terminal draft per configured agent.
//!
//! # Scheduling
//!
//! ```text
//! experts ──┬── burst providers ──────► one task per agent (JoinSet)
//!           │                            completions interleave freely
//!           │
//!           └── rate-limited provider ─► one task per provider
//!                                        agent₁ → delay → agent₂ → delay → …
//!                                        (delay skipped after multi-trace agents,
//!                                         which pace each request themselves)
//!
//! every task ──Started(slot)───► channel ──► status RUNNING
//!            ──Settled(slot, Draft)──────► status update + on_draft_complete
//! ```
//!
//! Errors inside one agent become a FAILED draft at that agent's boundary,
//! panics included. Cancellation is the exception: it stops every task and
//! surfaces as [`OrchestrationError::Cancelled`] with whatever settled.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, AgentStatus, DispatchConfig, GenerationStrategy};
use crate::confidence::{
    run_offline, run_online, Judge, JudgeTraceProvider, LogprobTraceProvider, TraceProvider,
};
use crate::errors::{GenerationError, OrchestrationError};
use crate::provider::{ClientRegistry, GenerationRequest, LlmClient};
use crate::resilience::{guarded, sleep_or_cancel, RequestPacer};
use crate::types::{Draft, ExpertDispatch, ImageInput, Provider};

/// Runs experts under per-provider scheduling rules.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    clients: ClientRegistry,
    config: DispatchConfig,
}

/// Everything an agent task needs, shared across tasks.
struct RunContext {
    clients: ClientRegistry,
    config: DispatchConfig,
    prompt: String,
    images: Vec<ImageInput>,
    pacers: HashMap<Provider, Arc<RequestPacer>>,
}

/// Progress reported by agent tasks, keyed by expert slot.
enum AgentEvent {
    Started(usize),
    Settled(usize, Draft),
}

type EventTx = mpsc::UnboundedSender<AgentEvent>;

impl Dispatcher {
    pub fn new(clients: ClientRegistry, config: DispatchConfig) -> Self {
        Self { clients, config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Produce exactly one terminal draft per expert, in expert order.
    ///
    /// `on_draft_complete` fires once per agent in completion order, and
    /// each agent's `status` in `configs` advances as it runs. Queued agents
    /// stay `Pending` until their task actually starts them.
    pub async fn dispatch<F>(
        &self,
        experts: &[ExpertDispatch],
        prompt: &str,
        images: &[ImageInput],
        configs: &mut [AgentConfig],
        mut on_draft_complete: F,
        cancel: &CancellationToken,
    ) -> Result<Vec<Draft>, OrchestrationError>
    where
        F: FnMut(&Draft),
    {
        if experts.is_empty() {
            return Err(OrchestrationError::NoAgents);
        }
        if cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled {
                settled: Vec::new(),
            });
        }

        let mut slots: Vec<usize> = Vec::with_capacity(experts.len());
        for expert in experts {
            let idx = configs
                .iter()
                .position(|c| c.id == expert.agent_id)
                .ok_or_else(|| {
                    OrchestrationError::Configuration(format!(
                        "no agent config for expert '{}'",
                        expert.agent_id
                    ))
                })?;
            slots.push(idx);
        }

        let ctx = Arc::new(RunContext {
            clients: self.clients.clone(),
            config: self.config.clone(),
            prompt: prompt.to_string(),
            images: images.to_vec(),
            pacers: self.pacers_for(experts),
        });

        // Partition into burst agents and per-provider sequential queues,
        // preserving configured order within each queue.
        let mut burst: Vec<(usize, AgentConfig)> = Vec::new();
        let mut queues: Vec<(Provider, Vec<(usize, AgentConfig)>)> = Vec::new();
        for (slot, &idx) in slots.iter().enumerate() {
            let agent = configs[idx].clone();
            let provider = agent.provider();
            if self.config.policies.get(provider).is_rate_limited() {
                match queues.iter_mut().find(|(p, _)| *p == provider) {
                    Some((_, queue)) => queue.push((slot, agent)),
                    None => queues.push((provider, vec![(slot, agent)])),
                }
            } else {
                burst.push((slot, agent));
            }
            configs[idx].status = AgentStatus::Pending;
        }

        info!(
            agents = experts.len(),
            burst = burst.len(),
            sequential_providers = queues.len(),
            "dispatching experts"
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
        let mut tasks = JoinSet::new();

        for (slot, agent) in burst {
            let ctx = ctx.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Some(draft) = run_isolated(&ctx, slot, &agent, &tx, &cancel).await {
                    let _ = tx.send(AgentEvent::Settled(slot, draft));
                }
            });
        }

        for (provider, queue) in queues {
            let ctx = ctx.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let interval = self
                .config
                .policies
                .get(provider)
                .request_interval()
                .unwrap_or_default();
            tasks.spawn(async move {
                run_sequential(&ctx, provider, queue, interval, &tx, &cancel).await;
            });
        }
        drop(tx);

        let mut settled: Vec<Option<Draft>> = vec![None; experts.len()];
        let mut record = |event: AgentEvent, configs: &mut [AgentConfig]| match event {
            AgentEvent::Started(slot) => configs[slots[slot]].status = AgentStatus::Running,
            AgentEvent::Settled(slot, draft) => {
                configs[slots[slot]].status = terminal_status(&draft);
                on_draft_complete(&draft);
                settled[slot] = Some(draft);
            }
        };

        let cancelled = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break true,
                msg = rx.recv() => match msg {
                    Some(event) => record(event, configs),
                    None => break cancel.is_cancelled(),
                },
            }
        };

        if cancelled {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            // Drafts that settled before the token fired still count.
            while let Ok(event) = rx.try_recv() {
                record(event, configs);
            }
            let settled: Vec<Draft> = settled.into_iter().flatten().collect();
            warn!(settled = settled.len(), "dispatch cancelled");
            return Err(OrchestrationError::Cancelled { settled });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "dispatch task ended abnormally");
            }
        }

        let mut drafts = Vec::with_capacity(experts.len());
        for (slot, draft) in settled.into_iter().enumerate() {
            let draft = match draft {
                Some(draft) => draft,
                None => {
                    let draft = Draft::failed(
                        experts[slot].clone(),
                        "agent task ended without producing a draft",
                    );
                    configs[slots[slot]].status = terminal_status(&draft);
                    draft
                }
            };
            drafts.push(draft);
        }

        let completed = drafts.iter().filter(|d| d.is_completed()).count();
        info!(
            completed,
            failed = drafts.len() - completed,
            "dispatch finished"
        );
        Ok(drafts)
    }

    fn pacers_for(&self, experts: &[ExpertDispatch]) -> HashMap<Provider, Arc<RequestPacer>> {
        let mut pacers = HashMap::new();
        for expert in experts {
            if let Some(interval) = self.config.policies.get(expert.provider).request_interval() {
                pacers
                    .entry(expert.provider)
                    .or_insert_with(|| Arc::new(RequestPacer::new(interval)));
            }
        }
        pacers
    }
}

fn terminal_status(draft: &Draft) -> AgentStatus {
    if draft.is_completed() {
        AgentStatus::Completed
    } else {
        AgentStatus::Failed
    }
}

/// Run one rate-limited provider's agents strictly in order.
async fn run_sequential(
    ctx: &RunContext,
    provider: Provider,
    queue: Vec<(usize, AgentConfig)>,
    interval: Duration,
    tx: &EventTx,
    cancel: &CancellationToken,
) {
    let total = queue.len();
    for (position, (slot, agent)) in queue.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return;
        }
        let Some(draft) = run_isolated(ctx, slot, &agent, tx, cancel).await else {
            return;
        };
        let _ = tx.send(AgentEvent::Settled(slot, draft));

        let more_follow = position + 1 < total;
        if more_follow && !agent.generation_strategy.is_multi_trace() && !interval.is_zero() {
            debug!(
                provider = %provider,
                delay_ms = interval.as_millis() as u64,
                "rate-limit delay before next agent"
            );
            if sleep_or_cancel(cancel, interval).await.is_err() {
                return;
            }
        }
    }
}

/// Run one agent behind its failure boundary. `None` means cancelled.
async fn run_isolated(
    ctx: &RunContext,
    slot: usize,
    agent: &AgentConfig,
    tx: &EventTx,
    cancel: &CancellationToken,
) -> Option<Draft> {
    let _ = tx.send(AgentEvent::Started(slot));
    let expert = agent.expert();
    match AssertUnwindSafe(run_agent(ctx, agent, cancel))
        .catch_unwind()
        .await
    {
        Ok(Ok(draft)) => Some(draft),
        Ok(Err(_cancelled)) => None,
        Err(_panic) => {
            warn!(agent_id = %agent.id, "agent panicked");
            Some(Draft::failed(
                expert,
                format!("{} agent crashed unexpectedly", agent.provider()),
            ))
        }
    }
}

/// Produce this agent's draft. The only error is cancellation.
async fn run_agent(
    ctx: &RunContext,
    agent: &AgentConfig,
    cancel: &CancellationToken,
) -> Result<Draft, GenerationError> {
    let expert = agent.expert();
    let provider = agent.provider();
    let strategy = agent.generation_strategy;

    let Some(client) = ctx.clients.client(provider) else {
        warn!(agent_id = %agent.id, provider = %provider, "no client configured");
        return Ok(Draft::failed(
            expert,
            format!("{provider}: no client configured"),
        ));
    };

    info!(agent_id = %agent.id, provider = %provider, strategy = %strategy, "agent started");
    let started = Instant::now();

    let result = match strategy {
        GenerationStrategy::Single => run_single(ctx, client, agent, &expert, cancel).await,
        GenerationStrategy::OfflineConfidence | GenerationStrategy::OnlineConfidence => {
            run_multi_trace(ctx, client, agent, &expert, cancel).await
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(draft) => {
            info!(
                agent_id = %agent.id,
                provider = %provider,
                elapsed_ms,
                partial = draft.is_partial,
                "agent completed"
            );
            Ok(draft)
        }
        Err(GenerationError::Cancelled) => {
            debug!(agent_id = %agent.id, "agent cancelled");
            Err(GenerationError::Cancelled)
        }
        Err(e) => {
            warn!(
                agent_id = %agent.id,
                provider = %provider,
                elapsed_ms,
                timeout = e.is_timeout(),
                error = %e,
                "agent failed"
            );
            Ok(Draft::failed(expert, describe_failure(provider, &e)))
        }
    }
}

/// Human-readable failure, keeping timeouts distinguishable.
pub fn describe_failure(provider: Provider, error: &GenerationError) -> String {
    match error {
        GenerationError::Timeout { .. } => format!("{provider} {error}"),
        _ => format!("{provider} request failed: {error}"),
    }
}

// ── Strategies ───────────────────────────────────────────────────────────────

struct Collected {
    content: String,
    interruption: Option<GenerationError>,
}

/// Drain a text stream, keeping content that arrived before an interruption.
async fn collect_stream(
    client: &dyn LlmClient,
    request: &GenerationRequest,
    cancel: &CancellationToken,
) -> Result<Collected, GenerationError> {
    let mut stream = client.generate_stream(request, cancel).await?;
    let mut content = String::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(fragment) => content.push_str(&fragment),
            Err(e) if e.is_cancelled() || content.is_empty() => return Err(e),
            Err(e) => {
                return Ok(Collected {
                    content,
                    interruption: Some(e),
                })
            }
        }
    }
    if content.trim().is_empty() {
        return Err(GenerationError::Parse("provider returned an empty response".to_string()));
    }
    Ok(Collected {
        content,
        interruption: None,
    })
}

async fn run_single(
    ctx: &RunContext,
    client: Arc<dyn LlmClient>,
    agent: &AgentConfig,
    expert: &ExpertDispatch,
    cancel: &CancellationToken,
) -> Result<Draft, GenerationError> {
    let request = &GenerationRequest::for_agent(agent, &ctx.prompt, &ctx.images);
    let client = client.as_ref();
    let timeout = ctx.config.call_timeout();
    // Shared with multi-trace agents on the same provider.
    let pacer = ctx.pacers.get(&agent.provider()).map(Arc::as_ref);

    let collected = ctx
        .config
        .retry
        .execute(cancel, || async move {
            if let Some(pacer) = pacer {
                pacer.acquire(cancel).await?;
            }
            guarded(cancel, timeout, collect_stream(client, request, cancel)).await
        })
        .await?;

    Ok(match collected.interruption {
        None => Draft::completed(expert.clone(), collected.content),
        Some(e) => {
            warn!(
                agent_id = %agent.id,
                chars = collected.content.len(),
                error = %e,
                "stream interrupted, keeping partial draft"
            );
            Draft::partial(
                expert.clone(),
                collected.content,
                describe_failure(agent.provider(), &e),
            )
        }
    })
}

async fn run_multi_trace(
    ctx: &RunContext,
    client: Arc<dyn LlmClient>,
    agent: &AgentConfig,
    expert: &ExpertDispatch,
    cancel: &CancellationToken,
) -> Result<Draft, GenerationError> {
    let provider = agent.provider();
    let params = agent.confidence_params();
    let template = GenerationRequest::for_agent(agent, &ctx.prompt, &ctx.images);
    let timeout = ctx.config.call_timeout();
    let pacer = ctx.pacers.get(&provider).cloned();

    let traces: Box<dyn TraceProvider> = match ctx.clients.logprob_client(provider) {
        Some(logprob) => Box::new(
            LogprobTraceProvider::new(logprob, template, params.top_k, timeout).with_pacer(pacer),
        ),
        None => {
            let judge =
                Judge::new(client.clone(), agent.model.clone(), timeout).with_pacer(pacer.clone());
            Box::new(
                JudgeTraceProvider::new(client, template, judge, timeout)
                    .with_retry(ctx.config.retry.clone())
                    .with_pacer(pacer),
            )
        }
    };

    let outcome = if agent.generation_strategy == GenerationStrategy::OnlineConfidence {
        run_online(traces.as_ref(), &ctx.prompt, &params, cancel).await?
    } else {
        run_offline(traces.as_ref(), &ctx.prompt, &params, cancel).await?
    };

    info!(
        agent_id = %agent.id,
        consensus = outcome.consensus,
        traces = outcome.traces_generated,
        kept = outcome.traces_kept,
        "confidence sampling finished"
    );
    Ok(Draft::completed(expert.clone(), outcome.trace_text.clone()).with_sampling(outcome.summary()))
}
