//! Scripted in-process provider clients for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use moe_coordination::{
    AgentConfig, GenerationError, GenerationRequest, LlmClient, Provider, ProviderSettings,
    TextStream,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a streaming call does.
#[derive(Debug, Clone)]
pub enum Script {
    Fragments(Vec<&'static str>),
    /// Yields the fragments, then breaks off with `error`.
    Interrupted {
        fragments: Vec<&'static str>,
        error: GenerationError,
    },
    Fail(GenerationError),
    Delay(Duration, Box<Script>),
    /// Never produces a response.
    Hang,
    Panic,
    /// One large fragment of `n` characters.
    Large(usize),
}

impl Script {
    pub fn text(text: &'static str) -> Self {
        Self::Fragments(vec![text])
    }

    pub fn delayed(ms: u64, inner: Script) -> Self {
        Self::Delay(Duration::from_millis(ms), Box::new(inner))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Stream,
    Once,
    Judge,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub model: String,
    pub kind: CallKind,
    pub started: Instant,
}

pub struct FakeClient {
    provider: Provider,
    streams: HashMap<String, Script>,
    answers: Mutex<VecDeque<&'static str>>,
    judge_reply: String,
    calls: Mutex<Vec<Call>>,
}

impl FakeClient {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            streams: HashMap::new(),
            answers: Mutex::new(VecDeque::new()),
            judge_reply: r#"{"score": 0.9, "reasons": ["looks right"]}"#.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Script streaming calls for `model`.
    pub fn stream(mut self, model: &str, script: Script) -> Self {
        self.streams.insert(model.to_string(), script);
        self
    }

    /// Full-text answers handed out in order, cycling.
    pub fn answers(self, answers: &[&'static str]) -> Self {
        *self.answers.lock().unwrap() = answers.iter().copied().collect();
        self
    }

    pub fn judge_reply(mut self, reply: &str) -> Self {
        self.judge_reply = reply.to_string();
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    fn record(&self, model: &str, kind: CallKind) {
        self.calls.lock().unwrap().push(Call {
            model: model.to_string(),
            kind,
            started: Instant::now(),
        });
    }

    async fn play(script: Script) -> Result<TextStream, GenerationError> {
        let mut script = script;
        loop {
            match script {
                Script::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    script = *inner;
                }
                Script::Fragments(fragments) => {
                    let items: Vec<Result<String, GenerationError>> =
                        fragments.into_iter().map(|f| Ok(f.to_string())).collect();
                    return Ok(futures::stream::iter(items).boxed());
                }
                Script::Interrupted { fragments, error } => {
                    let mut items: Vec<Result<String, GenerationError>> =
                        fragments.into_iter().map(|f| Ok(f.to_string())).collect();
                    items.push(Err(error));
                    return Ok(futures::stream::iter(items).boxed());
                }
                Script::Large(n) => {
                    return Ok(futures::stream::iter(vec![Ok("x".repeat(n))]).boxed());
                }
                Script::Fail(error) => return Err(error),
                Script::Hang => return futures::future::pending().await,
                Script::Panic => panic!("scripted provider panic"),
            }
        }
    }
}

#[async_trait]
impl LlmClient for FakeClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn generate_once(
        &self,
        request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let is_judge = request
            .system_prompt
            .as_deref()
            .is_some_and(|s| s.starts_with("You are a strict grader"));
        if is_judge {
            self.record(&request.model, CallKind::Judge);
            return Ok(self.judge_reply.clone());
        }
        self.record(&request.model, CallKind::Once);
        let mut answers = self.answers.lock().unwrap();
        let answer = answers.pop_front().unwrap_or("default answer");
        answers.push_back(answer);
        Ok(answer.to_string())
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<TextStream, GenerationError> {
        self.record(&request.model, CallKind::Stream);
        let script = self
            .streams
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| Script::text("default draft"));
        Self::play(script).await
    }
}

pub fn agent(id: &str, provider: Provider, model: &str) -> AgentConfig {
    AgentConfig::new(id, model, ProviderSettings::defaults_for(provider))
        .with_persona(format!("{id} persona"))
}

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
