//! Google Gemini (`generativelanguage.googleapis.com`) client.

use async_trait::async_trait;
use moe_coordination::{
    GenerationError, GenerationRequest, LlmClient, Provider, ReasoningControl, TextStream,
};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{parse_event, read_json, require_key, send, text_stream};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl GeminiClient {
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
        action: &str,
    ) -> Result<reqwest::RequestBuilder, GenerationError> {
        let key = require_key(Provider::Gemini, &self.api_key)?;
        let url = format!("{}/models/{}:{action}", self.base_url, request.model);
        Ok(self
            .http
            .post(url)
            .header("x-goog-api-key", key)
            .json(&request_body(request)))
    }
}

/// `generateContent` / `streamGenerateContent` body.
pub fn request_body(request: &GenerationRequest) -> Value {
    let mut parts = vec![json!({ "text": request.user_prompt })];
    for image in &request.images {
        parts.push(json!({
            "inline_data": { "mime_type": image.mime_type, "data": image.data_base64 }
        }));
    }

    let params = &request.params;
    let mut config = Map::new();
    if let Some(t) = params.temperature {
        config.insert("temperature".into(), json!(t));
    }
    if let Some(p) = params.top_p {
        config.insert("topP".into(), json!(p));
    }
    if let Some(k) = params.top_k {
        config.insert("topK".into(), json!(k));
    }
    if let Some(max) = params.max_output_tokens {
        config.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(ReasoningControl::ThinkingBudget(budget)) = params.reasoning {
        config.insert("thinkingConfig".into(), json!({ "thinkingBudget": budget }));
    }

    let mut body = json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": config,
    });
    if let Some(system) = &request.system_prompt {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    body
}

/// Answer text of one response object. Thought-summary parts are skipped.
fn candidate_text(value: &Value) -> Result<Option<String>, GenerationError> {
    if let Some(error) = value.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown error");
        return Err(GenerationError::Stream(message.to_string()));
    }
    let Some(parts) = value["candidates"][0]["content"]["parts"].as_array() else {
        return Ok(None);
    };
    let text: String = parts
        .iter()
        .filter(|p| !p["thought"].as_bool().unwrap_or(false))
        .filter_map(|p| p["text"].as_str())
        .collect();
    Ok(Some(text))
}

pub fn stream_fragment(data: &str) -> Result<Option<String>, GenerationError> {
    candidate_text(&parse_event(data)?)
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn generate_once(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let builder = self.post(request, "generateContent")?;
        let response = send(Provider::Gemini, builder, cancel).await?;
        let body = read_json(response, cancel).await?;
        candidate_text(&body)?
            .ok_or_else(|| GenerationError::Parse("response has no candidates".to_string()))
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<TextStream, GenerationError> {
        debug!(model = %request.model, "gemini stream request");
        let builder = self.post(request, "streamGenerateContent?alt=sse")?;
        text_stream(Provider::Gemini, builder, stream_fragment, cancel).await
    }
}
