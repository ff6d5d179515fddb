//! Anthropic messages API client.

use async_trait::async_trait;
use moe_coordination::{
    GenerationError, GenerationRequest, LlmClient, Provider, ReasoningControl, TextStream,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{parse_event, read_json, require_key, send, text_stream};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
/// `max_tokens` is mandatory on this API.
const DEFAULT_MAX_TOKENS: u32 = 4_096;
/// Headroom for answer text above the thinking budget.
const ANSWER_HEADROOM: u32 = 4_096;

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn post(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::RequestBuilder, GenerationError> {
        let key = require_key(Provider::Anthropic, &self.api_key)?;
        Ok(self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&request_body(request, stream)))
    }
}

pub fn request_body(request: &GenerationRequest, stream: bool) -> Value {
    let mut content = Vec::new();
    for image in &request.images {
        content.push(json!({
            "type": "image",
            "source": { "type": "base64", "media_type": image.mime_type, "data": image.data_base64 },
        }));
    }
    content.push(json!({ "type": "text", "text": request.user_prompt }));

    let params = &request.params;
    let budget = match params.reasoning {
        Some(ReasoningControl::ThinkingBudget(budget)) => Some(budget),
        _ => None,
    };
    let requested_max = params.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    // The API rejects max_tokens <= budget_tokens.
    let max_tokens = match budget {
        Some(budget) if requested_max <= budget => budget.saturating_add(ANSWER_HEADROOM),
        _ => requested_max,
    };

    let mut body = json!({
        "model": request.model,
        "max_tokens": max_tokens,
        "messages": [{ "role": "user", "content": content }],
        "stream": stream,
    });
    if let Some(system) = &request.system_prompt {
        body["system"] = json!(system);
    }
    match budget {
        Some(budget) => {
            // Sampling overrides are not accepted alongside extended thinking.
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
        None => {
            if let Some(t) = params.temperature {
                body["temperature"] = json!(t);
            }
        }
    }
    body
}

pub fn stream_fragment(data: &str) -> Result<Option<String>, GenerationError> {
    let event = parse_event(data)?;
    match event["type"].as_str() {
        Some("content_block_delta") if event["delta"]["type"] == "text_delta" => {
            Ok(event["delta"]["text"].as_str().map(str::to_string))
        }
        Some("error") => {
            let message = event["error"]["message"].as_str().unwrap_or("unknown error");
            Err(GenerationError::Stream(message.to_string()))
        }
        _ => Ok(None),
    }
}

fn message_text(body: &Value) -> Result<String, GenerationError> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| GenerationError::Parse("response has no content blocks".to_string()))?;
    Ok(blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect())
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn generate_once(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let response = send(Provider::Anthropic, self.post(request, false)?, cancel).await?;
        message_text(&read_json(response, cancel).await?)
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<TextStream, GenerationError> {
        debug!(model = %request.model, "anthropic stream request");
        let builder = self.post(request, true)?;
        text_stream(Provider::Anthropic, builder, stream_fragment, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moe_coordination::SamplingParams;

    #[test]
    fn thinking_raises_max_tokens_and_drops_temperature() {
        let request = GenerationRequest::new("claude", "q").with_params(SamplingParams {
            temperature: Some(0.7),
            max_output_tokens: Some(1_000),
            reasoning: Some(ReasoningControl::ThinkingBudget(8_192)),
            ..SamplingParams::default()
        });
        let body = request_body(&request, true);
        assert_eq!(body["thinking"]["budget_tokens"], 8_192);
        assert_eq!(body["max_tokens"], 8_192 + 4_096);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn plain_request_keeps_temperature() {
        let request = GenerationRequest::new("claude", "q")
            .with_system_prompt("persona")
            .with_params(SamplingParams {
                temperature: Some(0.2),
                ..SamplingParams::default()
            });
        let body = request_body(&request, false);
        assert_eq!(body["max_tokens"], 4_096);
        assert_eq!(body["system"], "persona");
        assert!(body.get("thinking").is_none());
        assert!(body["temperature"].as_f64().is_some());
    }

    #[test]
    fn only_text_deltas_produce_fragments() {
        let text = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        let thinking = r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#;
        assert_eq!(stream_fragment(text).unwrap(), Some("Hi".to_string()));
        assert_eq!(stream_fragment(thinking).unwrap(), None);
        assert_eq!(stream_fragment(r#"{"type":"message_stop"}"#).unwrap(), None);
    }

    #[test]
    fn error_event_is_a_stream_error() {
        let data = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(
            stream_fragment(data),
            Err(GenerationError::Stream("Overloaded".into()))
        );
    }

    #[test]
    fn once_response_concatenates_text_blocks() {
        let body = json!({ "content": [
            { "type": "thinking", "thinking": "..." },
            { "type": "text", "text": "Final" },
        ]});
        assert_eq!(message_text(&body).unwrap(), "Final");
    }
}
