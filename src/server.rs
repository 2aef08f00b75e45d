use crate::auth::{self, CredentialProvider};
use crate::catalog::{ModelCatalog, UpstreamCatalog};
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::handlers::{chat, messages, responses};
use crate::telemetry::{self, TelemetrySink};
use crate::translate::openai_types::ChatErrorResponse;
use crate::upstream::{HttpTransport, UpstreamTransport};

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const SERVICE_NAME: &str = "github-copilot-proxy";

/// Shared state handed to every handler. Collaborators sit behind traits so
/// tests can swap in fakes.
#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub catalog: Arc<dyn ModelCatalog>,
    pub upstream: Arc<dyn UpstreamTransport>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl AppState {
    /// Wire up the production collaborators for `config`.
    pub fn from_config(config: ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream.timeout())
            .build()?;

        let credentials = auth::from_config(&config.upstream, client.clone())?;
        let catalog = Arc::new(UpstreamCatalog::new(&config, client.clone(), credentials.clone()));
        let upstream = Arc::new(HttpTransport::new(
            &config.upstream,
            client.clone(),
            credentials.clone(),
        ));
        let telemetry = telemetry::from_config(&config.telemetry, client);

        Ok(Self {
            config,
            catalog,
            upstream,
            credentials,
            telemetry,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(86400));

    Router::new()
        .route("/", get(handle_health))
        .route("/health", get(handle_health))
        .route("/info", get(handle_info))
        .route("/v1/models", get(handle_list_models))
        .route("/models", get(handle_list_models))
        .route("/v1/models/:model_id", get(handle_get_model))
        .route("/models/:model_id", get(handle_get_model))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/chat/completions", post(chat::chat_completions))
        .route("/v1/responses", post(responses::responses))
        .route("/responses", post(responses::responses))
        .route("/v1/messages", post(messages::messages))
        .route("/messages", post(messages::messages))
        .route("/v1/messages/count_tokens", post(messages::count_tokens))
        .route("/messages/count_tokens", post(messages::count_tokens))
        .route(
            "/v1/messages/batches",
            get(messages::batches).post(messages::batches),
        )
        .route("/v1/messages/batches/:batch_id", get(messages::batches))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject requests without the configured client key. Open when no key is set.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.required_api_key() else {
        return next.run(request).await;
    };
    if request.method() == Method::OPTIONS || presents_key(request.headers(), expected) {
        return next.run(request).await;
    }

    tracing::debug!(path = %request.uri().path(), "Rejected request without a valid API key");
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

fn presents_key(headers: &HeaderMap, expected: &str) -> bool {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    bearer == Some(expected) || api_key == Some(expected)
}

async fn handle_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "openai": ["/v1/chat/completions", "/v1/responses", "/v1/models"],
            "anthropic": ["/v1/messages", "/v1/messages/count_tokens"],
            "info": ["/health", "/info"],
        },
    }))
}

async fn handle_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let authenticated = match state.credentials.bearer_token().await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Credential check failed");
            false
        }
    };

    let models: Vec<String> = if authenticated {
        state.catalog.list().await.into_iter().map(|m| m.id).collect()
    } else {
        Vec::new()
    };

    Json(json!({
        "authenticated": authenticated,
        "models": models,
        "endpoints": {
            "openai_chat": "/v1/chat/completions",
            "openai_responses": "/v1/responses",
            "openai_models": "/v1/models",
            "anthropic_messages": "/v1/messages",
        },
    }))
}

async fn handle_list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let models = state.catalog.list().await;
    Json(json!({ "object": "list", "data": models }))
}

async fn handle_get_model(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> Response {
    match state.catalog.get(&model_id).await {
        Some(model) => Json(model).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ChatErrorResponse::new(
                "invalid_request_error",
                format!("Model '{model_id}' not found"),
            )),
        )
            .into_response(),
    }
}
