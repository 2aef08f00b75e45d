//! Anthropic Messages endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::{json, Value};

use super::{error_response, parse_body, send_upstream, sse_response, Dialect};
use crate::error::Result;
use crate::server::AppState;
use crate::telemetry::Generation;
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest};
use crate::translate::canonical::UsageCounters;
use crate::translate::content::extract_system_text;
use crate::translate::openai_types::ChatCompletionResponse;
use crate::translate::request::anthropic_to_upstream;
use crate::translate::response::to_anthropic_message;
use crate::translate::streaming::AnthropicSequencer;

pub async fn messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match handle(state, &body).await {
        Ok(response) => response,
        Err(e) => error_response(Dialect::Anthropic, &e),
    }
}

async fn handle(state: Arc<AppState>, body: &[u8]) -> Result<Response> {
    let req: MessagesRequest = parse_body(body)?;
    let model = state.catalog.resolve(&req.model);
    let upstream_req = anthropic_to_upstream(&req, model, &state.config.defaults);
    let generation = Generation::start("messages", &upstream_req);

    tracing::debug!(
        requested = %req.model,
        model = %upstream_req.model,
        stream = upstream_req.stream,
        tools = upstream_req.tools.len(),
        "Messages request"
    );

    if upstream_req.stream {
        let sequencer = AnthropicSequencer::new(&req.model);
        return Ok(sse_response(state, sequencer, upstream_req, generation));
    }

    let doc = send_upstream(&state, &upstream_req, &generation).await?;
    let parsed = ChatCompletionResponse::from_value(&doc);
    let message = to_anthropic_message(&parsed, &req.model);

    let usage = UsageCounters::from_usage(parsed.usage.as_ref());
    let output = serde_json::to_value(&message.content).unwrap_or(Value::Null);
    state.telemetry.record(generation.finish(output, usage));

    Ok(Json(message).into_response())
}

/// `POST /v1/messages/count_tokens`. A rough estimate at four characters per token.
pub async fn count_tokens(body: Bytes) -> Response {
    let req: MessagesRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(e) => return error_response(Dialect::Anthropic, &e),
    };

    Json(json!({ "input_tokens": estimate_tokens(&req) })).into_response()
}

fn estimate_tokens(req: &MessagesRequest) -> u64 {
    let mut chars = extract_system_text(req.system.as_ref()).chars().count();

    for message in &req.messages {
        chars += match &message.content {
            Value::String(text) => text.chars().count(),
            Value::Array(blocks) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .map(|t| t.chars().count())
                .sum(),
            _ => 0,
        };
    }

    ((chars / 4) as u64).max(1)
}

/// Message batches are not available upstream.
pub async fn batches() -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(ErrorResponse::api_error("Batch API not supported by Copilot proxy")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(doc: Value) -> MessagesRequest {
        serde_json::from_value(doc).unwrap()
    }

    #[test]
    fn test_estimate_counts_system_and_text() {
        let req = request(json!({
            "model": "claude-sonnet-4",
            "system": "12345678",
            "messages": [
                {"role": "user", "content": "abcd"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "abcdefgh"},
                    {"type": "tool_use", "id": "t", "name": "x", "input": {"long": "ignored text"}}
                ]}
            ]
        }));
        assert_eq!(estimate_tokens(&req), 5);
    }

    #[test]
    fn test_estimate_minimum_is_one() {
        let req = request(json!({"model": "m", "messages": []}));
        assert_eq!(estimate_tokens(&req), 1);

        let req = request(json!({"messages": [{"role": "user", "content": "hi"}]}));
        assert_eq!(estimate_tokens(&req), 1);
    }
}
