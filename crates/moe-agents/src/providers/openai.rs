//! OpenAI chat-completions client, also used for Groq's OpenAI-compatible
//! endpoint. Only OpenAI receives `reasoning_effort` and `verbosity`.

use async_trait::async_trait;
use moe_coordination::{
    GenerationError, GenerationRequest, LlmClient, Provider, ReasoningControl, TextStream,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{parse_event, read_json, require_key, send, text_stream};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

pub struct OpenAiCompatibleClient {
    provider: Provider,
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiCompatibleClient {
    pub fn openai(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            provider: Provider::OpenAi,
            http,
            api_key,
            base_url: OPENAI_BASE_URL.to_string(),
        }
    }

    pub fn groq(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            provider: Provider::Groq,
            http,
            api_key,
            base_url: GROQ_BASE_URL.to_string(),
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
        let key = require_key(self.provider, &self.api_key)?;
        Ok(self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&request_body(self.provider, request, stream)))
    }
}

fn user_content(request: &GenerationRequest) -> Value {
    if request.images.is_empty() {
        return json!(request.user_prompt);
    }
    let mut parts = vec![json!({ "type": "text", "text": request.user_prompt })];
    for image in &request.images {
        let url = format!("data:{};base64,{}", image.mime_type, image.data_base64);
        parts.push(json!({ "type": "image_url", "image_url": { "url": url } }));
    }
    Value::Array(parts)
}

pub fn request_body(provider: Provider, request: &GenerationRequest, stream: bool) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system_prompt {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": user_content(request) }));

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": stream,
    });
    let params = &request.params;
    if let Some(t) = params.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = params.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(max) = params.max_output_tokens {
        let key = match provider {
            Provider::OpenAi => "max_completion_tokens",
            _ => "max_tokens",
        };
        body[key] = json!(max);
    }
    if provider == Provider::OpenAi {
        if let Some(ReasoningControl::Effort(effort)) = params.reasoning {
            body["reasoning_effort"] = json!(effort.to_string());
        }
        if let Some(verbosity) = params.verbosity {
            body["verbosity"] = json!(verbosity.to_string());
        }
    }
    body
}

fn api_error(value: &Value) -> Option<GenerationError> {
    let error = value.get("error")?;
    let message = error["message"].as_str().unwrap_or("unknown error");
    Some(GenerationError::Stream(message.to_string()))
}

pub fn stream_fragment(data: &str) -> Result<Option<String>, GenerationError> {
    let value = parse_event(data)?;
    if let Some(err) = api_error(&value) {
        return Err(err);
    }
    Ok(value["choices"][0]["delta"]["content"]
        .as_str()
        .map(str::to_string))
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn generate_once(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let response = send(self.provider, self.post(request, false)?, cancel).await?;
        let body = read_json(response, cancel).await?;
        if let Some(err) = api_error(&body) {
            return Err(err);
        }
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GenerationError::Parse("response has no message content".to_string()))
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<TextStream, GenerationError> {
        debug!(provider = %self.provider, model = %request.model, "chat completions stream request");
        text_stream(self.provider, self.post(request, true)?, stream_fragment, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moe_coordination::{Effort, ImageInput, SamplingParams, Verbosity};

    fn reasoning_request() -> GenerationRequest {
        GenerationRequest::new("m", "Why is the sky blue?").with_params(SamplingParams {
            max_output_tokens: Some(512),
            reasoning: Some(ReasoningControl::Effort(Effort::High)),
            verbosity: Some(Verbosity::Low),
            ..SamplingParams::default()
        })
    }

    #[test]
    fn openai_body_has_native_reasoning_fields() {
        let body = request_body(Provider::OpenAi, &reasoning_request(), true);
        assert_eq!(body["reasoning_effort"], "high");
        assert_eq!(body["verbosity"], "low");
        assert_eq!(body["max_completion_tokens"], 512);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn groq_body_omits_openai_only_fields() {
        let body = request_body(Provider::Groq, &reasoning_request(), false);
        assert!(body.get("reasoning_effort").is_none());
        assert!(body.get("verbosity").is_none());
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn images_become_data_urls() {
        let mut request = GenerationRequest::new("m", "describe").with_system_prompt("sys");
        request.images.push(ImageInput {
            mime_type: "image/jpeg".into(),
            data_base64: "AAAA".into(),
        });
        let body = request_body(Provider::OpenAi, &request, true);
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(
            body["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );
    }

    #[test]
    fn delta_content_is_extracted() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(stream_fragment(data).unwrap(), Some("Hel".to_string()));
        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(stream_fragment(role_only).unwrap(), None);
    }

    #[test]
    fn error_event_fails_the_stream() {
        let data = r#"{"error":{"message":"overloaded"}}"#;
        assert_eq!(
            stream_fragment(data),
            Err(GenerationError::Stream("overloaded".into()))
        );
    }
}
