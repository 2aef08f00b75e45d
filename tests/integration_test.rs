//! End-to-end tests: the real router in front of a mock chat-completions upstream.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use copilot_proxy::auth::StaticToken;
use copilot_proxy::catalog::UpstreamCatalog;
use copilot_proxy::telemetry::NoopSink;
use copilot_proxy::upstream::HttpTransport;
use copilot_proxy::{build_router, AppState, ProxyConfig};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

type Seen = Arc<Mutex<Vec<Value>>>;

const TEXT_STREAM: &[&str] = &[
    r#"{"id":"c1","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
    r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
    r#"{"id":"c1","choices":[],"usage":{"prompt_tokens":7,"completion_tokens":2,"total_tokens":9}}"#,
];

const TOOL_STREAM: &[&str] = &[
    r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"get_weather","arguments":""}}]}}]}"#,
    r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":\"Paris\"}"}}]}}]}"#,
    r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
];

async fn mock_completions(State(seen): State<Seen>, Json(body): Json<Value>) -> Response {
    seen.lock().unwrap().push(body.clone());
    let model = body["model"].as_str().unwrap_or_default().to_string();

    if model == "broken-model" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"message": "model not supported", "type": "invalid_request_error"}})),
        )
            .into_response();
    }

    if body["stream"] == true {
        let chunks = if model == "tool-model" { TOOL_STREAM } else { TEXT_STREAM };
        let mut sse: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
        sse.push_str("data: [DONE]\n\n");
        return ([("content-type", "text/event-stream")], sse).into_response();
    }

    Json(json!({
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello there"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
    }))
    .into_response()
}

async fn mock_models() -> Json<Value> {
    Json(json!({
        "data": [
            {"id": "gpt-4o", "name": "GPT-4o", "vendor": "Azure OpenAI", "version": "gpt-4o-2024-11-20"},
            {"id": "claude-sonnet-4", "name": "Claude Sonnet 4", "vendor": "Anthropic"},
            {"id": "text-embedding-3-small", "vendor": "Azure OpenAI"}
        ]
    }))
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Harness {
    base: String,
    seen: Seen,
    client: reqwest::Client,
}

impl Harness {
    async fn start() -> Self {
        Self::with_config(ProxyConfig::default()).await
    }

    async fn with_config(mut config: ProxyConfig) -> Self {
        let seen: Seen = Arc::default();
        let upstream = Router::new()
            .route("/chat/completions", post(mock_completions))
            .route("/models", get(mock_models))
            .with_state(seen.clone());
        config.upstream.base_url = serve(upstream).await;

        let client = reqwest::Client::new();
        let credentials = Arc::new(StaticToken::new("test-token"));
        let state = AppState {
            catalog: Arc::new(UpstreamCatalog::new(&config, client.clone(), credentials.clone())),
            upstream: Arc::new(HttpTransport::new(
                &config.upstream,
                client.clone(),
                credentials.clone(),
            )),
            credentials,
            telemetry: Arc::new(NoopSink),
            config,
        };
        let base = serve(build_router(Arc::new(state))).await;

        Self { base, seen, client }
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }

    fn last_upstream_body(&self) -> Value {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }
}

/// Split an SSE body into `(event name, data)` pairs.
fn parse_sse(body: &str) -> Vec<(Option<String>, String)> {
    body.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .filter_map(|block| {
            let mut event = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_string());
                } else if let Some(payload) = line.strip_prefix("data:") {
                    data = Some(payload.trim_start().to_string());
                }
            }
            data.map(|d| (event, d))
        })
        .collect()
}

fn event_names(frames: &[(Option<String>, String)]) -> Vec<&str> {
    frames.iter().filter_map(|(e, _)| e.as_deref()).collect()
}

fn data_of(frames: &[(Option<String>, String)], event: &str) -> Vec<Value> {
    frames
        .iter()
        .filter(|(e, _)| e.as_deref() == Some(event))
        .map(|(_, d)| serde_json::from_str(d).unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Info endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health() {
    let h = Harness::start().await;

    for path in ["/", "/health"] {
        let resp = h.get(path).await;
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "github-copilot-proxy");
        assert!(body["endpoints"]["openai"].is_array());
    }
}

#[tokio::test]
async fn test_info_reports_models() {
    let h = Harness::start().await;
    let body: Value = h.get("/info").await.json().await.unwrap();
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["models"], json!(["gpt-4o", "claude-sonnet-4"]));
    assert_eq!(body["endpoints"]["anthropic_messages"], "/v1/messages");
}

#[tokio::test]
async fn test_models_list_and_get() {
    let h = Harness::start().await;

    let body: Value = h.get("/v1/models").await.json().await.unwrap();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["id"], "gpt-4o");
    assert_eq!(data[0]["owned_by"], "openai");
    assert_eq!(data[1]["owned_by"], "anthropic");

    let model: Value = h.get("/models/claude-sonnet-4").await.json().await.unwrap();
    assert_eq!(model["id"], "claude-sonnet-4");
    assert_eq!(model["object"], "model");

    let missing = h.get("/v1/models/nope").await;
    assert_eq!(missing.status(), 404);
}

// ---------------------------------------------------------------------------
// OpenAI Chat Completions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_chat_completion_fills_id_and_resolves_alias() {
    let h = Harness::start().await;
    let resp = h
        .post(
            "/v1/chat/completions",
            json!({"model": "gpt-4-turbo", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["object"], "chat.completion");
    assert!(body["created"].as_i64().unwrap() > 0);
    assert_eq!(body["choices"][0]["message"]["content"], "Hello there");

    let upstream = h.last_upstream_body();
    assert_eq!(upstream["model"], "gpt-4o");
    assert_eq!(upstream["temperature"], 0.7);
    assert_eq!(upstream["max_tokens"], 4096);
    assert_eq!(upstream["stream"], false);
}

#[tokio::test]
async fn test_chat_streaming_relays_chunks() {
    let h = Harness::start().await;
    let resp = h
        .post(
            "/chat/completions",
            json!({"model": "gpt-4o", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let frames = parse_sse(&resp.text().await.unwrap());
    assert_eq!(frames.len(), 4);
    assert!(frames.iter().all(|(event, _)| event.is_none()));
    assert_eq!(frames[3].1, "[DONE]");

    let first: Value = serde_json::from_str(&frames[0].1).unwrap();
    assert_eq!(first["id"], "c1");
    assert!(first["created"].as_i64().unwrap() > 0);
    assert_eq!(first["choices"][0]["delta"]["content"], "Hel");

    assert_eq!(h.last_upstream_body()["stream_options"]["include_usage"], true);
}

#[tokio::test]
async fn test_chat_errors() {
    let h = Harness::start().await;

    let resp = h
        .client
        .post(format!("{}/v1/chat/completions", h.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let resp = h
        .post(
            "/v1/chat/completions",
            json!({"model": "broken-model", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "api_error");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("model not supported"));
}

// ---------------------------------------------------------------------------
// Anthropic Messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_messages_non_streaming() {
    let h = Harness::start().await;
    let resp = h
        .post(
            "/v1/messages",
            json!({
                "model": "claude-3-5-sonnet-20241022",
                "max_tokens": 256,
                "system": "Be brief.",
                "messages": [{"role": "user", "content": "hi"}]
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
    assert_eq!(body["content"][0], json!({"type": "text", "text": "Hello there"}));
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 12);
    assert_eq!(body["usage"]["output_tokens"], 3);

    let upstream = h.last_upstream_body();
    assert_eq!(upstream["model"], "claude-sonnet-4.5");
    assert_eq!(upstream["max_tokens"], 256);
    assert_eq!(upstream["messages"][0], json!({"role": "system", "content": "Be brief."}));
    assert_eq!(upstream["messages"][1]["role"], "user");
}

#[tokio::test]
async fn test_messages_streaming_text() {
    let h = Harness::start().await;
    let resp = h
        .post(
            "/v1/messages",
            json!({"model": "claude-sonnet-4", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let frames = parse_sse(&resp.text().await.unwrap());
    assert_eq!(
        event_names(&frames),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let start = &data_of(&frames, "message_start")[0];
    assert_eq!(start["message"]["model"], "claude-sonnet-4");
    assert!(start["message"]["id"].as_str().unwrap().starts_with("msg_"));

    let deltas = data_of(&frames, "content_block_delta");
    assert_eq!(deltas[0]["delta"], json!({"type": "text_delta", "text": "Hel"}));
    assert_eq!(deltas[1]["delta"]["text"], "lo");

    let delta = &data_of(&frames, "message_delta")[0];
    assert_eq!(delta["delta"]["stop_reason"], "end_turn");
    assert_eq!(delta["usage"]["output_tokens"], 2);
}

#[tokio::test]
async fn test_messages_streaming_tool_use() {
    let h = Harness::start().await;
    let resp = h
        .post(
            "/v1/messages",
            json!({
                "model": "tool-model",
                "stream": true,
                "messages": [{"role": "user", "content": "weather in Paris?"}],
                "tools": [{"name": "get_weather", "description": "Weather", "input_schema": {"type": "object"}}],
                "tool_choice": {"type": "any"}
            }),
        )
        .await;
    let frames = parse_sse(&resp.text().await.unwrap());
    assert_eq!(
        event_names(&frames),
        vec![
            "message_start",
            "content_block_start",
            "content_block_stop",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let starts = data_of(&frames, "content_block_start");
    assert_eq!(starts[1]["index"], 1);
    assert_eq!(starts[1]["content_block"]["type"], "tool_use");
    assert_eq!(starts[1]["content_block"]["id"], "call_1");
    assert_eq!(starts[1]["content_block"]["name"], "get_weather");

    let delta = &data_of(&frames, "content_block_delta")[0];
    assert_eq!(delta["delta"]["type"], "input_json_delta");
    assert_eq!(delta["delta"]["partial_json"], r#"{"city":"Paris"}"#);

    assert_eq!(data_of(&frames, "message_delta")[0]["delta"]["stop_reason"], "tool_use");

    let upstream = h.last_upstream_body();
    assert_eq!(upstream["tools"][0]["function"]["name"], "get_weather");
    assert_eq!(upstream["tool_choice"], "required");
}

#[tokio::test]
async fn test_messages_streaming_upstream_error_still_closes() {
    let h = Harness::start().await;
    let resp = h
        .post(
            "/v1/messages",
            json!({"model": "broken-model", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let frames = parse_sse(&resp.text().await.unwrap());
    assert_eq!(
        event_names(&frames),
        vec![
            "message_start",
            "content_block_start",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
}

#[tokio::test]
async fn test_messages_upstream_error_translated() {
    let h = Harness::start().await;
    let resp = h
        .post(
            "/v1/messages",
            json!({"model": "broken-model", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(resp.status(), 502);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["message"], "model not supported");
}

#[tokio::test]
async fn test_messages_malformed_body() {
    let h = Harness::start().await;
    let resp = h
        .client
        .post(format!("{}/v1/messages", h.base))
        .body("[")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid request body"));
}

#[tokio::test]
async fn test_count_tokens() {
    let h = Harness::start().await;
    let resp = h
        .post(
            "/v1/messages/count_tokens",
            json!({
                "model": "claude-sonnet-4",
                "system": [{"type": "text", "text": "abcdefgh"}],
                "messages": [{"role": "user", "content": "abcdefghijkl"}]
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"input_tokens": 5}));
}

#[tokio::test]
async fn test_batches_not_implemented() {
    let h = Harness::start().await;

    let resp = h.post("/v1/messages/batches", json!({})).await;
    assert_eq!(resp.status(), 501);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");

    assert_eq!(h.get("/v1/messages/batches").await.status(), 501);
    assert_eq!(h.get("/v1/messages/batches/batch_123").await.status(), 501);
}

// ---------------------------------------------------------------------------
// OpenAI Responses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_responses_non_streaming() {
    let h = Harness::start().await;
    let resp = h
        .post(
            "/v1/responses",
            json!({"model": "gpt-4o", "instructions": "Be brief.", "input": "hi", "max_output_tokens": 64}),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    let id = body["id"].as_str().unwrap();
    assert!(id.starts_with("resp_"));
    assert_eq!(id.len(), "resp_".len() + 24);
    assert_eq!(body["object"], "response");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["output"][0]["type"], "message");
    assert_eq!(body["output"][0]["content"][0]["type"], "output_text");
    assert_eq!(body["output"][0]["content"][0]["text"], "Hello there");
    assert_eq!(body["usage"]["input_tokens"], 12);
    assert_eq!(body["usage"]["total_tokens"], 15);

    let upstream = h.last_upstream_body();
    assert_eq!(upstream["max_tokens"], 64);
    assert_eq!(upstream["messages"][0]["role"], "system");
    assert_eq!(upstream["messages"][1], json!({"role": "user", "content": "hi"}));
}

#[tokio::test]
async fn test_responses_streaming() {
    let h = Harness::start().await;
    let resp = h
        .post("/responses", json!({"model": "gpt-4o", "stream": true, "input": "hi"}))
        .await;
    assert_eq!(resp.status(), 200);

    let frames = parse_sse(&resp.text().await.unwrap());
    assert_eq!(
        event_names(&frames),
        vec![
            "response.created",
            "response.output_item.added",
            "response.content_part.added",
            "response.output_text.delta",
            "response.output_text.delta",
            "response.output_text.done",
            "response.content_part.done",
            "response.output_item.done",
            "response.completed",
        ]
    );

    let done = &data_of(&frames, "response.output_text.done")[0];
    assert_eq!(done["text"], "Hello");

    let completed = &data_of(&frames, "response.completed")[0];
    assert_eq!(completed["type"], "response.completed");
    assert_eq!(completed["response"]["status"], "completed");
    assert_eq!(completed["response"]["usage"]["input_tokens"], 7);
    assert_eq!(completed["response"]["usage"]["output_tokens"], 2);

    let created = &data_of(&frames, "response.created")[0];
    assert_eq!(created["response"]["id"], completed["response"]["id"]);
}

// ---------------------------------------------------------------------------
// Wire framing
// ---------------------------------------------------------------------------

/// Every frame is exactly `event: <name>` followed by `data: <json>`.
fn assert_named_frames(body: &str, first_event: &str) {
    assert!(
        body.starts_with(&format!("event: {first_event}\ndata: ")),
        "unexpected stream head: {:?}",
        &body[..body.len().min(80)]
    );
    assert!(body.ends_with("\n\n"));

    for block in body.split("\n\n").filter(|b| !b.is_empty()) {
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines.len(), 2, "frame is not event then data: {block:?}");
        assert!(lines[0].starts_with("event: "), "frame must lead with event: {block:?}");
        assert!(lines[1].starts_with("data: "), "frame must follow with data: {block:?}");
        serde_json::from_str::<Value>(&lines[1]["data: ".len()..]).unwrap();
    }
}

#[tokio::test]
async fn test_sse_wire_framing() {
    let h = Harness::start().await;

    let body = h
        .post(
            "/v1/messages",
            json!({"model": "claude-sonnet-4", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await
        .text()
        .await
        .unwrap();
    assert_named_frames(&body, "message_start");

    let body = h
        .post("/v1/responses", json!({"model": "gpt-4o", "stream": true, "input": "hi"}))
        .await
        .text()
        .await
        .unwrap();
    assert_named_frames(&body, "response.created");

    let body = h
        .post(
            "/v1/chat/completions",
            json!({"model": "gpt-4o", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await
        .text()
        .await
        .unwrap();
    assert!(body.starts_with("data: {"));
    assert!(body.ends_with("data: [DONE]\n\n"), "relay tail: {body:?}");
    assert!(body.lines().all(|line| !line.starts_with("event:")));
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_api_key_gate() {
    let mut config = ProxyConfig::default();
    config.api_key = Some("secret".to_string());
    let h = Harness::with_config(config).await;

    let resp = h.get("/health").await;
    assert_eq!(resp.status(), 401);
    assert_eq!(resp.text().await.unwrap(), "Unauthorized");

    let resp = h
        .client
        .get(format!("{}/health", h.base))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = h
        .client
        .get(format!("{}/v1/models", h.base))
        .header("x-api-key", "secret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = h
        .client
        .request(reqwest::Method::OPTIONS, format!("{}/v1/messages", h.base))
        .header("origin", "http://localhost:3000")
        .header("access-control-request-method", "POST")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    assert_eq!(resp.headers()["access-control-max-age"], "86400");
}
