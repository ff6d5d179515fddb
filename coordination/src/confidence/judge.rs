//! Reflexive answer judging.
//!
//! Providers without token log-probabilities score a candidate answer by
//! asking a model for a structured `{score, reasons}` judgment. An unusable
//! judgment (malformed output, transport failure) scores 0 and carries a
//! diagnostic reason; only cancellation is surfaced as an error.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::GenerationError;
use crate::provider::{GenerationRequest, LlmClient, SamplingParams};
use crate::resilience::{guarded, RequestPacer};
use crate::types::JudgeResult;

const JUDGE_SYSTEM_PROMPT: &str = "You are a strict grader. Given a question and a candidate \
answer, judge how likely the answer is correct and complete. Respond with JSON only, in the \
form {\"score\": <number between 0 and 1>, \"reasons\": [\"<short reason>\", ...]}.";

pub const MALFORMED_REASON: &str = "judge response malformed";

/// Scores `(prompt, answer)` pairs with one model.
#[derive(Clone)]
pub struct Judge {
    client: Arc<dyn LlmClient>,
    model: String,
    timeout: Duration,
    pacer: Option<Arc<RequestPacer>>,
}

impl Judge {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            model: model.into(),
            timeout,
            pacer: None,
        }
    }

    pub fn with_pacer(mut self, pacer: Option<Arc<RequestPacer>>) -> Self {
        self.pacer = pacer;
        self
    }

    fn request(&self, prompt: &str, answer: &str) -> GenerationRequest {
        let user_prompt =
            format!("Question:\n{prompt}\n\nCandidate answer:\n{answer}\n\nReturn the JSON judgment.");
        GenerationRequest::new(self.model.clone(), user_prompt)
            .with_system_prompt(JUDGE_SYSTEM_PROMPT)
            .with_params(SamplingParams {
                temperature: Some(0.0),
                ..SamplingParams::default()
            })
    }

    pub async fn evaluate(
        &self,
        prompt: &str,
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<JudgeResult, GenerationError> {
        if let Some(pacer) = &self.pacer {
            pacer.acquire(cancel).await?;
        }
        let request = self.request(prompt, answer);
        match guarded(cancel, self.timeout, self.client.generate_once(&request, cancel)).await {
            Ok(raw) => {
                let result = parse_judge_response(&raw);
                debug!(
                    provider = %self.client.provider(),
                    score = result.score,
                    "judge scored answer"
                );
                Ok(result)
            }
            Err(GenerationError::Cancelled) => Err(GenerationError::Cancelled),
            Err(e) => {
                warn!(provider = %self.client.provider(), error = %e, "judge call failed, scoring 0");
                Ok(JudgeResult::unusable(format!("judge call failed: {e}")))
            }
        }
    }
}

impl std::fmt::Debug for Judge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Judge")
            .field("provider", &self.client.provider())
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Deserialize)]
struct RawJudgment {
    score: f64,
    #[serde(default)]
    reasons: Vec<String>,
}

fn extract_json_object(raw: &str) -> &str {
    let stripped = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    match (stripped.find('{'), stripped.rfind('}')) {
        (Some(start), Some(end)) if start < end => &stripped[start..=end],
        _ => stripped,
    }
}

/// Parse a judge reply. Malformed output scores 0 with a diagnostic reason;
/// valid scores are clamped to `[0, 1]`.
pub fn parse_judge_response(raw: &str) -> JudgeResult {
    match serde_json::from_str::<RawJudgment>(extract_json_object(raw)) {
        Ok(judgment) if judgment.score.is_finite() => JudgeResult {
            score: judgment.score.clamp(0.0, 1.0),
            reasons: judgment.reasons,
        },
        Ok(_) => JudgeResult::unusable(format!("{MALFORMED_REASON}: non-finite score")),
        Err(e) => JudgeResult::unusable(format!("{MALFORMED_REASON}: {e}")),
    }
}
