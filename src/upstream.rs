//! HTTP transport to the OpenAI-schema upstream.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::auth::CredentialProvider;
use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};
use crate::translate::canonical::ChatCompletionRequest;
use crate::translate::streaming::DONE_SENTINEL;

/// One item of an upstream SSE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// A `data:` payload other than the terminator.
    Data(String),
    /// The `[DONE]` terminator.
    Done,
}

pub type UpstreamStream = Pin<Box<dyn Stream<Item = Result<UpstreamEvent>> + Send>>;

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Non-streaming completion. Returns the upstream JSON document.
    async fn send(&self, request: &ChatCompletionRequest) -> Result<Value>;

    /// Streaming completion. Errors before the first byte surface here;
    /// errors mid-body surface as stream items.
    async fn send_streaming(&self, request: &ChatCompletionRequest) -> Result<UpstreamStream>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    completions_url: String,
    headers: BTreeMap<String, String>,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpTransport {
    pub fn new(
        config: &UpstreamConfig,
        client: reqwest::Client,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            client,
            completions_url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            headers: config.headers.clone(),
            credentials,
        }
    }

    async fn post(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response> {
        let token = self.credentials.bearer_token().await?;

        let mut builder = self
            .client
            .post(&self.completions_url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .header("Openai-Intent", "conversation-edits");
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.has_images() {
            tracing::debug!("Adding vision header for image content");
            builder = builder.header("Copilot-Vision-Request", "true");
        }

        tracing::info!(
            url = %self.completions_url,
            model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            "Forwarding request upstream"
        );

        let response = builder
            .json(request)
            .send()
            .await
            .map_err(|e| ProxyError::provider(format!("Request failed: {e}")))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status, body = %truncate(&body, 300), "Upstream returned an error");
            return Err(ProxyError::upstream(status, body));
        }

        Ok(response)
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(&self, request: &ChatCompletionRequest) -> Result<Value> {
        let response = self.post(request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| ProxyError::provider(format!("Failed to read response body: {e}")))?;

        tracing::debug!(body_len = body.len(), "Upstream response received");

        serde_json::from_str(&body).map_err(|e| {
            ProxyError::provider(format!(
                "Failed to parse upstream response: {}. Body: {}",
                e,
                truncate(&body, 300)
            ))
        })
    }

    async fn send_streaming(&self, request: &ChatCompletionRequest) -> Result<UpstreamStream> {
        let response = self.post(request).await?;

        let events = response.bytes_stream().eventsource().map(|result| match result {
            Ok(event) => {
                let data = event.data.trim();
                if data == DONE_SENTINEL {
                    Ok(UpstreamEvent::Done)
                } else {
                    Ok(UpstreamEvent::Data(data.to_string()))
                }
            }
            Err(e) => Err(ProxyError::provider(format!("Stream read failed: {e}"))),
        });

        Ok(Box::pin(events))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::translate::canonical::{CanonicalContent, CanonicalMessage, ContentPart, Role};
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use std::sync::Mutex;

    fn request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![CanonicalMessage::new(Role::User, "hi")],
            temperature: 0.7,
            max_tokens: 16,
            stream,
            stream_options: None,
            tools: Vec::new(),
            tool_choice: None,
            top_p: None,
            stop: None,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn transport(base_url: String) -> HttpTransport {
        let config = UpstreamConfig {
            base_url,
            ..UpstreamConfig::default()
        };
        HttpTransport::new(&config, reqwest::Client::new(), Arc::new(StaticToken::new("tok")))
    }

    #[tokio::test]
    async fn test_send_sets_headers() {
        let seen: Arc<Mutex<Vec<HeaderMap>>> = Arc::default();
        let captured = seen.clone();
        let app = Router::new().route(
            "/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let captured = captured.clone();
                async move {
                    captured.lock().unwrap().push(headers);
                    Json(serde_json::json!({"id": "x", "model": body["model"]}))
                }
            }),
        );
        let transport = transport(serve(app).await);

        let doc = transport.send(&request(false)).await.unwrap();
        assert_eq!(doc["model"], "gpt-4o");

        let mut with_image = request(false);
        with_image.messages = vec![CanonicalMessage::new(
            Role::User,
            CanonicalContent::Parts(vec![ContentPart::image("https://x/y.png"), ContentPart::text("?")]),
        )];
        transport.send(&with_image).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["authorization"], "Bearer tok");
        assert_eq!(seen[0]["openai-intent"], "conversation-edits");
        assert_eq!(seen[0]["copilot-integration-id"], "vscode-chat");
        assert!(seen[0].get("copilot-vision-request").is_none());
        assert_eq!(seen[1]["copilot-vision-request"], "true");
    }

    #[tokio::test]
    async fn test_error_status_is_upstream_error() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let transport = transport(serve(app).await);

        match transport.send(&request(false)).await {
            Err(ProxyError::Upstream { status, body }) => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
        assert!(matches!(
            transport.send_streaming(&request(true)).await,
            Err(ProxyError::Upstream { status: 429, .. })
        ));
    }

    #[tokio::test]
    async fn test_streaming_events() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                (
                    [("content-type", "text/event-stream")],
                    "data: {\"choices\":[]}\n\n: keep-alive\n\ndata: [DONE]\n\n",
                )
            }),
        );
        let transport = transport(serve(app).await);

        let events: Vec<UpstreamEvent> = transport
            .send_streaming(&request(true))
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![UpstreamEvent::Data("{\"choices\":[]}".into()), UpstreamEvent::Done]
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
