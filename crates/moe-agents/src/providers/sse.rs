//! Server-sent-events transport shared by every streaming provider.
//!
//! Framing is left to `reqwest-eventsource`. This module opens the source,
//! maps its failures onto [`GenerationError`] and yields raw `data` payloads
//! until the `[DONE]` sentinel or the end of the body.

use futures::stream::BoxStream;
use futures::StreamExt;
use moe_coordination::{GenerationError, Provider};
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::status_error;

/// OpenAI-style end-of-stream marker.
pub const DONE_SENTINEL: &str = "[DONE]";

pub type PayloadStream = BoxStream<'static, Result<String, GenerationError>>;

/// Send `builder` as an event-source request and wait for the response
/// headers. HTTP failures surface here, before any payload, so the
/// dispatcher can classify and retry them.
pub async fn open(
    provider: Provider,
    builder: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<PayloadStream, GenerationError> {
    let mut source =
        EventSource::new(builder).map_err(|e| GenerationError::Request(e.to_string()))?;
    // A reconnect would replay the prompt; retries belong to the dispatcher.
    source.set_retry_policy(Box::new(Never));

    let first = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        event = source.next() => Some(event),
    };
    let Some(first) = first else {
        source.close();
        return Err(GenerationError::Cancelled);
    };
    match first {
        Some(Ok(Event::Open)) => {
            trace!(%provider, "event stream opened");
            Ok(payloads(source, None))
        }
        Some(Ok(Event::Message(message))) => Ok(payloads(source, Some(message.data))),
        Some(Err(e)) => {
            source.close();
            let err = open_error(e).await;
            warn!(%provider, error = %err, "event stream failed to open");
            Err(err)
        }
        None => Err(GenerationError::Stream(
            "event stream closed before opening".to_string(),
        )),
    }
}

async fn open_error(error: EventSourceError) -> GenerationError {
    match error {
        EventSourceError::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            status_error(status.as_u16(), body)
        }
        EventSourceError::Transport(e) => GenerationError::Request(e.to_string()),
        other => GenerationError::Stream(other.to_string()),
    }
}

fn payloads(source: EventSource, first: Option<String>) -> PayloadStream {
    futures::stream::unfold(Some((source, first)), |state| async move {
        let (mut source, first) = state?;
        let data = match first {
            Some(data) => data,
            None => match next_payload(&mut source).await {
                Some(Ok(data)) => data,
                Some(Err(e)) => {
                    source.close();
                    return Some((Err(e), None));
                }
                None => return None,
            },
        };
        if data.trim() == DONE_SENTINEL {
            source.close();
            return None;
        }
        Some((Ok(data), Some((source, None))))
    })
    .boxed()
}

async fn next_payload(source: &mut EventSource) -> Option<Result<String, GenerationError>> {
    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => {}
            Ok(Event::Message(message)) => return Some(Ok(message.data)),
            Err(EventSourceError::StreamEnded) => return None,
            Err(e) => return Some(Err(GenerationError::Stream(e.to_string()))),
        }
    }
    None
}
