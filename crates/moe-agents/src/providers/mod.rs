//! HTTP clients implementing the coordination crate's [`LlmClient`] contract.
//!
//! | Provider  | Endpoint                                  | Reasoning knob              |
//! |-----------|-------------------------------------------|-----------------------------|
//! | Gemini    | `models/{model}:streamGenerateContent`    | `thinkingConfig.thinkingBudget` |
//! | OpenAI    | `chat/completions`                        | `reasoning_effort`, `verbosity` |
//! | Anthropic | `messages`                                | `thinking.budget_tokens`    |
//! | Groq      | OpenAI-compatible `chat/completions`      | none                        |
//!
//! Every client streams over SSE ([`sse`], framed by `reqwest-eventsource`). The per-call timeout and retry
//! policy are applied by the dispatcher, so the HTTP client only carries a
//! connect timeout.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod sse;

use std::time::Duration;

use futures::StreamExt;
use moe_coordination::{GenerationError, Provider, TextStream};
use tokio_util::sync::CancellationToken;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use openai::OpenAiCompatibleClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared HTTP client. No overall request timeout: streams may legitimately
/// run for minutes and the dispatcher bounds each call itself.
pub fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
}

pub(crate) fn require_key(provider: Provider, key: &Option<String>) -> Result<&str, GenerationError> {
    key.as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or(GenerationError::MissingApiKey(provider))
}

/// Send the request, racing the cancellation token, and map non-success
/// statuses onto the error taxonomy.
pub(crate) async fn send(
    provider: Provider,
    builder: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, GenerationError> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
        result = builder.send() => result.map_err(|e| GenerationError::Request(e.to_string()))?,
    };
    check_status(provider, response).await
}

async fn check_status(
    provider: Provider,
    response: reqwest::Response,
) -> Result<reqwest::Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(%provider, status = status.as_u16(), "provider returned error status");
    Err(status_error(status.as_u16(), body))
}

pub(crate) fn status_error(status: u16, body: String) -> GenerationError {
    if status == 429 {
        GenerationError::RateLimited(body)
    } else {
        GenerationError::Status { status, body }
    }
}

/// Read a full JSON body, racing the cancellation token.
pub(crate) async fn read_json(
    response: reqwest::Response,
    cancel: &CancellationToken,
) -> Result<serde_json::Value, GenerationError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GenerationError::Cancelled),
        body = response.json::<serde_json::Value>() => {
            body.map_err(|e| GenerationError::Parse(e.to_string()))
        }
    }
}

/// Payload extractor: `Ok(None)` for events that carry no answer text.
pub(crate) type Extract = fn(&str) -> Result<Option<String>, GenerationError>;

/// Open an SSE request and map its payloads to answer-text fragments.
/// Empty fragments are dropped.
pub(crate) async fn text_stream(
    provider: Provider,
    builder: reqwest::RequestBuilder,
    extract: Extract,
    cancel: &CancellationToken,
) -> Result<TextStream, GenerationError> {
    let payloads = sse::open(provider, builder, cancel).await?;
    Ok(payloads
        .filter_map(move |event| async move {
            match event.and_then(|data| extract(&data)) {
                Ok(Some(text)) if !text.is_empty() => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })
        .boxed())
}

pub(crate) fn parse_event(data: &str) -> Result<serde_json::Value, GenerationError> {
    serde_json::from_str(data).map_err(|e| GenerationError::Parse(format!("{e}: {data}")))
}
