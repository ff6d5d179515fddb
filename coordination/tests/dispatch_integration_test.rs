//! Integration tests for the Dispatcher
//!
//! Drives real dispatch runs against scripted in-process clients: failure
//! isolation, partial streams, timeouts, burst vs rate-limited scheduling,
//! multi-trace strategies and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{agent, CallKind, FakeClient, Script};
use moe_coordination::{
    AgentConfig, AgentStatus, ClientRegistry, DispatchConfig, Dispatcher, Draft, DraftStatus,
    EtaPercent, ExpertDispatch, GenerationError, GenerationStrategy, OrchestrationError,
    PolicyTable, Provider, RetryPolicy,
};
use tokio_util::sync::CancellationToken;

fn test_config() -> DispatchConfig {
    DispatchConfig {
        call_timeout_secs: 5,
        retry: RetryPolicy::none(),
        policies: PolicyTable::default(),
    }
}

async fn dispatch(
    clients: ClientRegistry,
    agents: &mut [AgentConfig],
    cancel: &CancellationToken,
) -> (Result<Vec<Draft>, OrchestrationError>, Vec<String>) {
    let experts: Vec<ExpertDispatch> = agents.iter().map(AgentConfig::expert).collect();
    let dispatcher = Dispatcher::new(clients, test_config());
    let mut order = Vec::new();
    let result = dispatcher
        .dispatch(
            &experts,
            "What is the answer?",
            &[],
            agents,
            |d: &Draft| order.push(d.agent_id.clone()),
            cancel,
        )
        .await;
    (result, order)
}

/// Test: single-strategy agents each yield exactly one terminal draft
#[tokio::test]
async fn test_single_strategy_one_terminal_draft_per_agent() {
    common::init_tracing();
    let gemini = FakeClient::new(Provider::Gemini)
        .stream("gemini-2.5-flash", Script::Fragments(vec!["Forty", "-two"]))
        .shared();
    let openai = FakeClient::new(Provider::OpenAi)
        .stream(
            "gpt-5-mini",
            Script::Fail(GenerationError::Status {
                status: 401,
                body: "invalid api key".into(),
            }),
        )
        .shared();
    let anthropic = FakeClient::new(Provider::Anthropic)
        .stream("claude-sonnet-4-5", Script::text("42"))
        .shared();
    let clients = ClientRegistry::new()
        .with_client(gemini)
        .with_client(openai)
        .with_client(anthropic);

    let mut agents = vec![
        agent("a1", Provider::Gemini, "gemini-2.5-flash"),
        agent("a2", Provider::OpenAi, "gpt-5-mini"),
        agent("a3", Provider::Anthropic, "claude-sonnet-4-5"),
    ];
    let (result, order) = dispatch(clients, &mut agents, &CancellationToken::new()).await;
    let drafts = result.expect("dispatch should not fail as a whole");

    assert_eq!(drafts.len(), 3);
    assert_eq!(order.len(), 3);
    assert_eq!(drafts[0].status, DraftStatus::Completed);
    assert_eq!(drafts[0].content, "Forty-two");
    assert_eq!(drafts[1].status, DraftStatus::Failed);
    assert!(drafts[1].error.as_deref().unwrap().contains("401"));
    assert_eq!(drafts[2].status, DraftStatus::Completed);

    assert_eq!(agents[0].status, AgentStatus::Completed);
    assert_eq!(agents[1].status, AgentStatus::Failed);
    assert_eq!(agents[2].status, AgentStatus::Completed);
}

/// Test: an interruption after some content keeps a partial COMPLETED draft
#[tokio::test]
async fn test_partial_stream_is_completed_with_flag() {
    let gemini = FakeClient::new(Provider::Gemini)
        .stream(
            "m",
            Script::Interrupted {
                fragments: vec!["The answer is"],
                error: GenerationError::Stream("connection reset".into()),
            },
        )
        .shared();
    let mut agents = vec![agent("a1", Provider::Gemini, "m")];
    let (result, _) = dispatch(
        ClientRegistry::new().with_client(gemini),
        &mut agents,
        &CancellationToken::new(),
    )
    .await;
    let draft = &result.unwrap()[0];

    assert_eq!(draft.status, DraftStatus::Completed);
    assert!(draft.is_partial);
    assert_eq!(draft.content, "The answer is");
    assert!(draft.error.as_deref().unwrap().contains("connection reset"));
}

/// Test: an interruption before any content is a FAILED draft
#[tokio::test]
async fn test_zero_content_interruption_fails() {
    let gemini = FakeClient::new(Provider::Gemini)
        .stream(
            "m",
            Script::Interrupted {
                fragments: vec![],
                error: GenerationError::Stream("connection reset".into()),
            },
        )
        .shared();
    let mut agents = vec![agent("a1", Provider::Gemini, "m")];
    let (result, _) = dispatch(
        ClientRegistry::new().with_client(gemini),
        &mut agents,
        &CancellationToken::new(),
    )
    .await;
    let draft = &result.unwrap()[0];

    assert_eq!(draft.status, DraftStatus::Failed);
    assert!(!draft.is_partial);
}

/// Test: a hung provider fails with a timeout message, not a generic error
#[tokio::test(start_paused = true)]
async fn test_timeout_is_reported_as_timeout() {
    let openai = FakeClient::new(Provider::OpenAi)
        .stream("slow", Script::Hang)
        .shared();
    let mut agents = vec![agent("a1", Provider::OpenAi, "slow")];
    let (result, _) = dispatch(
        ClientRegistry::new().with_client(openai),
        &mut agents,
        &CancellationToken::new(),
    )
    .await;
    let draft = &result.unwrap()[0];

    assert_eq!(draft.status, DraftStatus::Failed);
    assert_eq!(draft.error.as_deref(), Some("openai timed out after 5.0s"));
}

/// Test: a panicking agent becomes a FAILED draft and siblings still complete
#[tokio::test]
async fn test_panic_is_contained_to_one_agent() {
    let gemini = FakeClient::new(Provider::Gemini)
        .stream("boom", Script::Panic)
        .stream("fine", Script::text("ok"))
        .shared();
    let mut agents = vec![
        agent("a1", Provider::Gemini, "boom"),
        agent("a2", Provider::Gemini, "fine"),
    ];
    let (result, order) = dispatch(
        ClientRegistry::new().with_client(gemini),
        &mut agents,
        &CancellationToken::new(),
    )
    .await;
    let drafts = result.unwrap();

    assert_eq!(drafts[0].status, DraftStatus::Failed);
    assert!(drafts[0].error.as_deref().unwrap().contains("crashed"));
    assert_eq!(drafts[1].status, DraftStatus::Completed);
    assert_eq!(order.len(), 2);
}

/// Test: an agent whose provider has no client fails without touching others
#[tokio::test]
async fn test_missing_client_fails_agent() {
    let gemini = FakeClient::new(Provider::Gemini).shared();
    let mut agents = vec![
        agent("a1", Provider::Anthropic, "claude"),
        agent("a2", Provider::Gemini, "m"),
    ];
    let (result, _) = dispatch(
        ClientRegistry::new().with_client(gemini),
        &mut agents,
        &CancellationToken::new(),
    )
    .await;
    let drafts = result.unwrap();

    assert_eq!(drafts[0].status, DraftStatus::Failed);
    assert!(drafts[0].error.as_deref().unwrap().contains("no client configured"));
    assert!(drafts[1].is_completed());
}

/// Test: burst agents report in completion order, results stay in config order
#[tokio::test(start_paused = true)]
async fn test_burst_agents_report_in_completion_order() {
    let gemini = FakeClient::new(Provider::Gemini)
        .stream("m", Script::delayed(300, Script::text("g")))
        .shared();
    let openai = FakeClient::new(Provider::OpenAi)
        .stream("m", Script::delayed(100, Script::text("o")))
        .shared();
    let anthropic = FakeClient::new(Provider::Anthropic)
        .stream("m", Script::delayed(200, Script::text("a")))
        .shared();
    let clients = ClientRegistry::new()
        .with_client(gemini)
        .with_client(openai)
        .with_client(anthropic);
    let mut agents = vec![
        agent("gemini", Provider::Gemini, "m"),
        agent("openai", Provider::OpenAi, "m"),
        agent("anthropic", Provider::Anthropic, "m"),
    ];
    let (result, order) = dispatch(clients, &mut agents, &CancellationToken::new()).await;
    let drafts = result.unwrap();

    assert_eq!(order, vec!["openai", "anthropic", "gemini"]);
    let ids: Vec<&str> = drafts.iter().map(|d| d.agent_id.as_str()).collect();
    assert_eq!(ids, vec!["gemini", "openai", "anthropic"]);
}

/// Test: rate-limited agents run in configured order with the inter-request delay
#[tokio::test(start_paused = true)]
async fn test_rate_limited_agents_run_in_order_with_delay() {
    let groq = FakeClient::new(Provider::Groq)
        .stream("first", Script::delayed(100, Script::text("1")))
        .stream("second", Script::delayed(10, Script::text("2")))
        .shared();
    let clients = ClientRegistry::new().with_client(groq.clone());
    let mut agents = vec![
        agent("g1", Provider::Groq, "first"),
        agent("g2", Provider::Groq, "second"),
    ];
    let (result, order) = dispatch(clients, &mut agents, &CancellationToken::new()).await;
    assert!(result.unwrap().iter().all(Draft::is_completed));
    assert_eq!(order, vec!["g1", "g2"]);

    let calls = groq.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].model, "first");
    assert_eq!(calls[1].model, "second");
    // 100ms generation + 2s delay (30 requests per minute).
    assert!(calls[1].started - calls[0].started >= Duration::from_millis(2_100));
}

/// Test: multi-trace agents skip the inter-agent delay but share the provider pacer
#[tokio::test(start_paused = true)]
async fn test_multi_trace_paces_requests_and_skips_agent_delay() {
    let groq = FakeClient::new(Provider::Groq)
        .answers(&["42"])
        .stream("single", Script::text("single draft"))
        .shared();
    let clients = ClientRegistry::new().with_client(groq.clone());
    let mut agents = vec![
        agent("sampler", Provider::Groq, "sampled")
            .with_strategy(GenerationStrategy::OfflineConfidence)
            .with_sampling(2, EtaPercent::Ninety, 0.8),
        agent("single", Provider::Groq, "single"),
    ];
    let (result, _) = dispatch(clients, &mut agents, &CancellationToken::new()).await;
    let drafts = result.unwrap();
    assert_eq!(drafts[0].content, "42");
    assert!(drafts[1].is_completed());

    let sampler_calls: Vec<_> = groq
        .calls()
        .into_iter()
        .filter(|c| c.model == "sampled")
        .collect();
    assert_eq!(sampler_calls.len(), 4, "two traces and two judgments");
    for pair in sampler_calls.windows(2) {
        assert!(pair[1].started - pair[0].started >= Duration::from_secs(2));
    }

    // No inter-agent delay, but the shared pacer still spaces the next request.
    let single = &groq.calls_of(CallKind::Stream)[0];
    let last_sampler_call = sampler_calls.last().unwrap();
    assert!(single.started - last_sampler_call.started >= Duration::from_secs(2));
    assert!(single.started - last_sampler_call.started < Duration::from_millis(2_100));
}

/// Test: online sampling through the judge stops once the warmup agrees
#[tokio::test]
async fn test_online_confidence_via_judge_stops_at_consensus() {
    let openai = FakeClient::new(Provider::OpenAi).answers(&["42"]).shared();
    let clients = ClientRegistry::new().with_client(openai.clone());
    let mut agents = vec![agent("a1", Provider::OpenAi, "gpt-5-mini")
        .with_strategy(GenerationStrategy::OnlineConfidence)
        .with_sampling(4, EtaPercent::Ninety, 0.8)];
    let (result, _) = dispatch(clients, &mut agents, &CancellationToken::new()).await;
    let draft = &result.unwrap()[0];

    assert!(draft.is_completed());
    assert_eq!(draft.content, "42");
    let sampling = draft.sampling.as_ref().unwrap();
    assert_eq!(sampling.traces_generated, 2);
    assert_eq!(sampling.consensus, 1.0);
    assert_eq!(openai.calls_of(CallKind::Once).len(), 2);
    assert_eq!(openai.calls_of(CallKind::Judge).len(), 2);
}

/// Test: malformed judge output scores zero but does not fail the agent
#[tokio::test]
async fn test_malformed_judge_is_not_fatal() {
    let openai = FakeClient::new(Provider::OpenAi)
        .answers(&["A", "B", "A"])
        .judge_reply("I think it is pretty good")
        .shared();
    let clients = ClientRegistry::new().with_client(openai);
    let mut agents = vec![agent("a1", Provider::OpenAi, "m")
        .with_strategy(GenerationStrategy::OfflineConfidence)
        .with_sampling(3, EtaPercent::Ninety, 0.8)];
    let (result, _) = dispatch(clients, &mut agents, &CancellationToken::new()).await;
    let draft = &result.unwrap()[0];

    assert!(draft.is_completed());
    assert_eq!(draft.sampling.as_ref().unwrap().consensus, 0.0);
}

/// Test: cancelling stops further calls and keeps already-settled drafts
#[tokio::test(start_paused = true)]
async fn test_cancel_keeps_settled_and_stops_new_calls() {
    let gemini = FakeClient::new(Provider::Gemini)
        .stream("m", Script::delayed(10, Script::text("fast")))
        .shared();
    let groq = FakeClient::new(Provider::Groq)
        .stream("first", Script::delayed(100, Script::text("1")))
        .stream("second", Script::text("2"))
        .shared();
    let clients = ClientRegistry::new()
        .with_client(gemini)
        .with_client(groq.clone());
    let mut agents = vec![
        agent("gemini", Provider::Gemini, "m"),
        agent("g1", Provider::Groq, "first"),
        agent("g2", Provider::Groq, "second"),
    ];

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let (result, _) = dispatch(clients, &mut agents, &cancel).await;
    match result {
        Err(OrchestrationError::Cancelled { settled }) => {
            let ids: Vec<&str> = settled.iter().map(|d| d.agent_id.as_str()).collect();
            assert_eq!(ids, vec!["gemini", "g1"]);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    // g2 was waiting out the rate-limit delay and must never be called.
    assert_eq!(groq.calls().len(), 1);
    assert_eq!(agents[0].status, AgentStatus::Completed);
    assert_eq!(agents[1].status, AgentStatus::Completed);
    assert_eq!(agents[2].status, AgentStatus::Pending);
}

/// Test: an already-cancelled token issues no calls at all
#[tokio::test]
async fn test_precancelled_run_issues_no_calls() {
    let gemini = Arc::new(FakeClient::new(Provider::Gemini));
    let clients = ClientRegistry::new().with_client(gemini.clone());
    let mut agents = vec![agent("a1", Provider::Gemini, "m")];
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (result, _) = dispatch(clients, &mut agents, &cancel).await;
    assert!(matches!(result, Err(OrchestrationError::Cancelled { .. })));
    assert!(gemini.calls().is_empty());
}
