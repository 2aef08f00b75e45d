//! `POST /v1/responses`

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
use crate::translate::openai_types::ChatCompletionResponse;
use crate::translate::request::responses_to_upstream;
use crate::translate::response::{extract_responses_usage, to_responses_output};
use crate::translate::responses_types::{new_response_id, ResponseObject, ResponsesRequest};
use crate::translate::streaming::ResponsesSequencer;

pub async fn responses(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match handle(state, &body).await {
        Ok(response) => response,
        Err(e) => error_response(Dialect::OpenAi, &e),
    }
}

async fn handle(state: Arc<AppState>, body: &[u8]) -> Result<Response> {
    let req: ResponsesRequest = parse_body(body)?;
    let model = state.catalog.resolve(&req.model);
    let upstream_req = responses_to_upstream(&req, model, &state.config.defaults);
    let generation = Generation::start("responses", &upstream_req);

    tracing::debug!(
        requested = %req.model,
        model = %upstream_req.model,
        stream = upstream_req.stream,
        "Responses request"
    );

    if upstream_req.stream {
        let sequencer = ResponsesSequencer::new(&req.model);
        return Ok(sse_response(state, sequencer, upstream_req, generation));
    }

    let doc = send_upstream(&state, &upstream_req, &generation).await?;
    let parsed = ChatCompletionResponse::from_value(&doc);
    let output = to_responses_output(&parsed);

    state.telemetry.record(generation.finish(
        serde_json::to_value(&output).unwrap_or(Value::Null),
        UsageCounters::from_usage(parsed.usage.as_ref()),
    ));

    let response = ResponseObject {
        id: new_response_id(),
        object: "response".to_string(),
        created_at: chrono::Utc::now().timestamp(),
        status: "completed".to_string(),
        model: req.model,
        output,
        usage: Some(extract_responses_usage(parsed.usage.as_ref())),
    };

    Ok(Json(response).into_response())
}
