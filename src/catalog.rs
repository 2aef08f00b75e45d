//! Model aliasing and discovery.
//!
//! Client-facing model names (dated Anthropic ids, retired OpenAI ids) are
//! mapped to the names the upstream serves. The model list is fetched from the
//! upstream `/models` endpoint, cached for a TTL, and replaced by a fixed
//! fallback list when the upstream cannot be reached.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::auth::CredentialProvider;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::translate::openai_types::null_as_default;

const MODEL_CREATED: i64 = 1_700_000_000;

const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("claude-3-opus-20240229", "claude-opus-4.5"),
    ("claude-3-sonnet-20240229", "claude-sonnet-4"),
    ("claude-3-haiku-20240307", "claude-haiku-4.5"),
    ("claude-3-5-sonnet-20240620", "claude-sonnet-4.5"),
    ("claude-3-5-sonnet-20241022", "claude-sonnet-4.5"),
    ("claude-3-5-haiku-20241022", "claude-haiku-4.5"),
    ("claude-sonnet-4-20250514", "claude-sonnet-4"),
    ("claude-opus-4-20250514", "claude-opus-4.5"),
    ("gpt-4-turbo", "gpt-4o"),
    ("gpt-4-turbo-preview", "gpt-4o"),
    ("gpt-4-1106-preview", "gpt-4o"),
];

const FALLBACK_MODELS: &[(&str, &str)] = &[
    ("gpt-4o", "openai"),
    ("gpt-4.1", "openai"),
    ("claude-sonnet-4", "anthropic"),
    ("claude-sonnet-4.5", "anthropic"),
    ("gemini-2.5-pro", "google"),
];

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Upstream name for a client-supplied model name. Unknown names pass through.
    fn resolve(&self, name: &str) -> String;

    /// Available models. Never fails: falls back to a fixed list.
    async fn list(&self) -> Vec<ModelDescriptor>;

    async fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.list().await.into_iter().find(|m| m.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preview: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ModelLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<ModelCapabilities>,
}

impl ModelDescriptor {
    fn fallback(id: &str, owned_by: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "model".to_string(),
            created: MODEL_CREATED,
            owned_by: owned_by.to_string(),
            name: String::new(),
            version: String::new(),
            preview: false,
            limits: None,
            capabilities: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelLimits {
    #[serde(default, deserialize_with = "null_as_default")]
    pub max_context_window_tokens: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub max_output_tokens: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub max_prompt_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default, deserialize_with = "null_as_default")]
    pub vision: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_calls: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parallel_tool_calls: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub streaming: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub structured_outputs: bool,
}

/// The upstream `/models` response.
#[derive(Debug, Default, Deserialize)]
struct UpstreamModelsResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    data: Vec<UpstreamModel>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamModel {
    #[serde(default, deserialize_with = "null_as_default")]
    id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    vendor: String,
    #[serde(default, deserialize_with = "null_as_default")]
    version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    preview: bool,
    #[serde(default)]
    capabilities: Option<UpstreamCapabilities>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamCapabilities {
    #[serde(default)]
    limits: Option<ModelLimits>,
    #[serde(default)]
    supports: Option<ModelCapabilities>,
}

pub fn default_aliases() -> HashMap<String, String> {
    DEFAULT_ALIASES
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
}

/// Owner string reported for an upstream vendor name.
pub fn vendor_owner(vendor: &str) -> String {
    match vendor {
        "Azure OpenAI" | "OpenAI" => "openai",
        "Anthropic" => "anthropic",
        "Google" => "google",
        "xAI" => "xai",
        other => other,
    }
    .to_string()
}

pub fn fallback_models() -> Vec<ModelDescriptor> {
    FALLBACK_MODELS
        .iter()
        .map(|(id, owner)| ModelDescriptor::fallback(id, owner))
        .collect()
}

/// Embedding models and internal `oswe-` models are not chat models.
fn is_listed(id: &str) -> bool {
    !id.to_ascii_lowercase().contains("embedding") && !id.starts_with("oswe-")
}

fn to_descriptors(resp: UpstreamModelsResponse) -> Vec<ModelDescriptor> {
    resp.data
        .into_iter()
        .filter(|m| !m.id.is_empty() && is_listed(&m.id))
        .map(|m| {
            let (limits, capabilities) = match m.capabilities {
                Some(caps) => (caps.limits, caps.supports),
                None => (None, None),
            };
            ModelDescriptor {
                owned_by: vendor_owner(&m.vendor),
                id: m.id,
                object: "model".to_string(),
                created: MODEL_CREATED,
                name: m.name,
                version: m.version,
                preview: m.preview,
                limits,
                capabilities,
            }
        })
        .collect()
}

pub struct UpstreamCatalog {
    client: reqwest::Client,
    base_url: String,
    headers: BTreeMap<String, String>,
    credentials: Arc<dyn CredentialProvider>,
    aliases: HashMap<String, String>,
    ttl: Duration,
    cache: RwLock<Option<(Instant, Vec<ModelDescriptor>)>>,
}

impl UpstreamCatalog {
    pub fn new(
        config: &ProxyConfig,
        client: reqwest::Client,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let mut aliases = default_aliases();
        aliases.extend(config.models.aliases.clone());

        Self {
            client,
            base_url: config.upstream.base_url.trim_end_matches('/').to_string(),
            headers: config.upstream.headers.clone(),
            credentials,
            aliases,
            ttl: Duration::from_secs(config.models.cache_ttl_secs),
            cache: RwLock::new(None),
        }
    }

    /// Fetch the list of available models from the upstream.
    async fn fetch(&self) -> Result<Vec<ModelDescriptor>> {
        let token = self.credentials.bearer_token().await?;
        let url = format!("{}/models", self.base_url);

        let mut req = self.client.get(&url).bearer_auth(token);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| ProxyError::provider(format!("Failed to fetch models: {e}")))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::upstream(status, body));
        }

        let parsed: UpstreamModelsResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::provider(format!("Failed to parse models response: {e}")))?;

        Ok(to_descriptors(parsed))
    }
}

#[async_trait]
impl ModelCatalog for UpstreamCatalog {
    fn resolve(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    async fn list(&self) -> Vec<ModelDescriptor> {
        if let Some((fetched_at, models)) = self.cache.read().await.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return models.clone();
            }
        }

        match self.fetch().await {
            Ok(models) => {
                tracing::debug!(count = models.len(), "Refreshed model list");
                *self.cache.write().await = Some((Instant::now(), models.clone()));
                models
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch models, using fallback list");
                fallback_models()
            }
        }
    }
}
