//! Arbiter: synthesise one streamed answer from the completed drafts.
//!
//! The synthesis prompt embeds the original question and every COMPLETED
//! draft, labelled by index, model and persona. The `{effort, verbosity}`
//! hints are mapped onto the target provider's native parameters; providers
//! without a native verbosity control get a length instruction instead.

use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Effort, Verbosity};
use crate::errors::{ArbiterError, GenerationError};
use crate::provider::{
    reasoning_for, ClientRegistry, GenerationRequest, SamplingParams, TextStream,
};
use crate::resilience::guarded;
use crate::types::{Draft, ModelRef, Provider};

const ARBITER_SYSTEM_PROMPT: &str = "You are the arbiter of a panel of expert models. You will \
receive a question and several draft answers. Resolve disagreements, keep what is correct, \
discard what is wrong, and write one unified final answer in your own voice. Do not list, \
number or refer to the individual drafts.";

/// Build the synthesis prompt from the COMPLETED drafts only.
pub fn build_synthesis_prompt(prompt: &str, drafts: &[Draft]) -> String {
    let mut out = format!("# Question\n\n{}\n\n# Drafts\n", prompt.trim());
    for (n, draft) in drafts.iter().filter(|d| d.is_completed()).enumerate() {
        let expert = &draft.expert;
        let persona = expert.persona.trim();
        let label = if persona.is_empty() {
            format!("Draft {} ({}/{})", n + 1, expert.provider, expert.model)
        } else {
            format!(
                "Draft {} ({}/{}, {})",
                n + 1,
                expert.provider,
                expert.model,
                persona
            )
        };
        out.push_str(&format!("\n## {label}\n\n{}\n", draft.content.trim()));
    }
    out.push_str(
        "\n# Task\n\nWrite a single, unified answer to the question above, \
         synthesising the drafts.",
    );
    out
}

fn length_instruction(verbosity: Verbosity) -> &'static str {
    match verbosity {
        Verbosity::Low => "Be brief: answer in a few sentences.",
        Verbosity::Medium => "Answer at a moderate length.",
        Verbosity::High => "Answer thoroughly, with full detail and explanation.",
    }
}

/// Provider-native generation parameters for the arbiter call.
pub fn arbiter_params(provider: Provider, verbosity: Verbosity, effort: Effort) -> SamplingParams {
    SamplingParams {
        reasoning: reasoning_for(provider, effort),
        verbosity: (provider == Provider::OpenAi).then_some(verbosity),
        ..SamplingParams::default()
    }
}

/// Build the full arbiter request for `target`.
pub fn arbiter_request(
    target: &ModelRef,
    prompt: &str,
    drafts: &[Draft],
    verbosity: Verbosity,
    effort: Effort,
) -> GenerationRequest {
    let params = arbiter_params(target.provider, verbosity, effort);
    let system_prompt = if params.verbosity.is_some() {
        ARBITER_SYSTEM_PROMPT.to_string()
    } else {
        format!("{ARBITER_SYSTEM_PROMPT} {}", length_instruction(verbosity))
    };
    GenerationRequest::new(target.model.clone(), build_synthesis_prompt(prompt, drafts))
        .with_system_prompt(system_prompt)
        .with_params(params)
}

#[derive(Debug, Clone)]
pub struct Arbiter {
    clients: ClientRegistry,
    timeout: Duration,
}

impl Arbiter {
    /// `timeout` bounds how long the provider may take to start streaming.
    pub fn new(clients: ClientRegistry, timeout: Duration) -> Self {
        Self { clients, timeout }
    }

    /// Stream the synthesised answer. Fails before returning a stream when
    /// no draft completed.
    pub async fn arbitrate(
        &self,
        target: &ModelRef,
        prompt: &str,
        drafts: &[Draft],
        verbosity: Verbosity,
        effort: Effort,
        cancel: &CancellationToken,
    ) -> Result<TextStream, ArbiterError> {
        let completed = drafts.iter().filter(|d| d.is_completed()).count();
        if completed == 0 {
            return Err(ArbiterError::NoCompletedDrafts);
        }
        let client = self
            .clients
            .client(target.provider)
            .ok_or(ArbiterError::MissingClient(target.provider))?;

        let request = arbiter_request(target, prompt, drafts, verbosity, effort);
        info!(
            model = %target,
            drafts = completed,
            %verbosity,
            %effort,
            "arbiter synthesis started"
        );

        let stream = guarded(cancel, self.timeout, client.generate_stream(&request, cancel)).await?;
        Ok(cancellable(stream, cancel.clone()))
    }
}

/// Stop yielding once the token fires; fuse after the first error.
fn cancellable(stream: TextStream, cancel: CancellationToken) -> TextStream {
    futures::stream::unfold(Some((stream, cancel)), |state| async move {
        let (mut stream, cancel) = state?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Some((Err(GenerationError::Cancelled), None)),
            item = stream.next() => match item {
                Some(Ok(fragment)) => Some((Ok(fragment), Some((stream, cancel)))),
                Some(Err(e)) => Some((Err(e), None)),
                None => None,
            },
        }
    })
    .boxed()
}
