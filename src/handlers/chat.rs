//! `POST /v1/chat/completions`

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::Value;

use super::{error_response, parse_body, send_upstream, sse_response, Dialect};
use crate::error::Result;
use crate::server::AppState;
use crate::telemetry::Generation;
use crate::translate::canonical::UsageCounters;
use crate::translate::openai_types::{ChatCompletionResponse, ChatRequest};
use crate::translate::request::chat_to_upstream;
use crate::translate::response::finalize_chat_completion;
use crate::translate::streaming::OpenAiRelay;

pub async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match handle(state, &body).await {
        Ok(response) => response,
        Err(e) => error_response(Dialect::OpenAi, &e),
    }
}

async fn handle(state: Arc<AppState>, body: &[u8]) -> Result<Response> {
    let req: ChatRequest = parse_body(body)?;
    let model = state.catalog.resolve(&req.model);
    let upstream_req = chat_to_upstream(&req, model, &state.config.defaults);
    let generation = Generation::start("chat/completions", &upstream_req);

    tracing::debug!(
        requested = %req.model,
        model = %upstream_req.model,
        stream = upstream_req.stream,
        "Chat completion request"
    );

    if upstream_req.stream {
        return Ok(sse_response(state, OpenAiRelay::new(), upstream_req, generation));
    }

    let mut doc = send_upstream(&state, &upstream_req, &generation).await?;

    let usage = UsageCounters::from_usage(ChatCompletionResponse::from_value(&doc).usage.as_ref());
    let output = doc
        .pointer("/choices/0/message")
        .cloned()
        .unwrap_or(Value::Null);
    state.telemetry.record(generation.finish(output, usage));

    let fallback_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    finalize_chat_completion(&mut doc, &fallback_id, chrono::Utc::now().timestamp());

    Ok(Json(doc).into_response())
}
