//! Per-endpoint request orchestration.
//!
//! Every completion endpoint follows the same shape: parse the body, resolve
//! the model, convert to the upstream request, then either send it and convert
//! the reply, or hand it to [`sse_response`] with the dialect's sequencer.

pub mod chat;
pub mod messages;
pub mod responses;

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ProxyError, Result};
use crate::server::AppState;
use crate::telemetry::Generation;
use crate::translate::anthropic_types::ErrorResponse;
use crate::translate::canonical::{ChatCompletionRequest, UsageCounters};
use crate::translate::openai_types::ChatErrorResponse;
use crate::translate::response::openai_error_to_anthropic;
use crate::translate::streaming::{EventSequencer, SseFrame};
use crate::upstream::UpstreamEvent;

/// Which client error format an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ProxyError::malformed(e.to_string()))
}

/// Render an error in the endpoint's own error format.
pub fn error_response(dialect: Dialect, err: &ProxyError) -> Response {
    let status = err.status_code();

    match dialect {
        Dialect::Anthropic => {
            let body = match err {
                ProxyError::MalformedRequest { .. } => ErrorResponse::invalid_request(err.to_string()),
                ProxyError::Upstream { body, .. } => {
                    match serde_json::from_str::<ChatErrorResponse>(body) {
                        Ok(upstream) => openai_error_to_anthropic(&upstream),
                        Err(_) => ErrorResponse::api_error(err.to_string()),
                    }
                }
                _ => ErrorResponse::api_error(err.to_string()),
            };
            (status, Json(body)).into_response()
        }
        Dialect::OpenAi => {
            let error_type = match err {
                ProxyError::MalformedRequest { .. } => "invalid_request_error",
                ProxyError::Auth { .. } => "authentication_error",
                _ => "api_error",
            };
            (status, Json(ChatErrorResponse::new(error_type, err.to_string()))).into_response()
        }
    }
}

/// Send a non-streaming request upstream. Failures are recorded to telemetry.
pub(crate) async fn send_upstream(
    state: &AppState,
    request: &ChatCompletionRequest,
    generation: &Generation,
) -> Result<Value> {
    match state.upstream.send(request).await {
        Ok(doc) => Ok(doc),
        Err(e) => {
            tracing::warn!(model = %request.model, error = %e, "Upstream request failed");
            state
                .telemetry
                .record(generation.clone().fail(&e, None, UsageCounters::default()));
            Err(e)
        }
    }
}

/// Named frames are written as `event:` then `data:`; relay frames carry `data:` only.
fn to_event(frame: SseFrame) -> std::result::Result<Event, Infallible> {
    Ok(match frame.event {
        Some(name) => Event::default().event(name).data(frame.data),
        None => Event::default().data(frame.data),
    })
}

/// Drive `sequencer` over the upstream stream and serve the frames as SSE.
///
/// Start frames go out before the upstream call, so every failure from then
/// on is absorbed: the stream still closes with the sequencer's End frames and
/// the error is only logged and recorded to telemetry. If the client goes
/// away, axum drops this stream and upstream reading stops with it.
pub(crate) fn sse_response<S>(
    state: Arc<AppState>,
    mut sequencer: S,
    request: ChatCompletionRequest,
    generation: Generation,
) -> Response
where
    S: EventSequencer + 'static,
{
    let stream = async_stream::stream! {
        for frame in sequencer.start() {
            yield to_event(frame);
        }

        let mut failure: Option<ProxyError> = None;
        match state.upstream.send_streaming(&request).await {
            Ok(mut upstream) => {
                while let Some(item) = upstream.next().await {
                    match item {
                        Ok(UpstreamEvent::Data(data)) => {
                            for frame in sequencer.on_data(&data) {
                                yield to_event(frame);
                            }
                        }
                        Ok(UpstreamEvent::Done) => {
                            for frame in sequencer.on_done() {
                                yield to_event(frame);
                            }
                            break;
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
            Err(e) => failure = Some(e),
        }

        for frame in sequencer.finish() {
            yield to_event(frame);
        }

        let usage = sequencer.usage();
        let record = match failure {
            Some(e) => {
                tracing::warn!(model = %request.model, error = %e, "Stream ended with upstream error");
                generation.fail(&e, Some(sequencer.output()), usage)
            }
            None => {
                tracing::info!(
                    model = %request.model,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "Stream completed"
                );
                generation.finish(sequencer.output(), usage)
            }
        };
        state.telemetry.record(record);
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
