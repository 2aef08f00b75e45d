//! Upstream credentials.
//!
//! Copilot needs a short-lived API token obtained by exchanging a long-lived
//! GitHub token. [`CopilotTokenExchange`] caches the short-lived token in
//! memory and in the credentials file and refreshes it shortly before expiry.
//! [`StaticToken`] covers upstreams that take a fixed bearer token.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{AuthMode, UpstreamConfig};
use crate::error::{ProxyError, Result};

/// Refresh the Copilot token when fewer than this many milliseconds remain.
const REFRESH_BUFFER_MS: i64 = 5 * 60 * 1000;

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A bearer token valid for at least the next request.
    async fn bearer_token(&self) -> Result<String>;
}

/// Build the credential provider selected by `[upstream] auth`.
pub fn from_config(
    config: &UpstreamConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn CredentialProvider>> {
    match config.auth {
        AuthMode::Token => Ok(Arc::new(StaticToken::new(config.resolve_static_token()?))),
        AuthMode::Copilot => Ok(Arc::new(CopilotTokenExchange::new(config, client))),
    }
}

pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String> {
        if self.token.is_empty() {
            return Err(ProxyError::auth("Upstream token is empty"));
        }
        Ok(self.token.clone())
    }
}

/// Contents of the credentials file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredCredentials {
    #[serde(default)]
    pub github_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub copilot_token: String,
    /// Expiry of `copilot_token`, in Unix milliseconds.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub copilot_expires: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl StoredCredentials {
    fn has_fresh_token(&self, now_ms: i64) -> bool {
        !self.copilot_token.is_empty() && self.copilot_expires > now_ms + REFRESH_BUFFER_MS
    }
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    token: String,
    /// Unix seconds.
    expires_at: i64,
}

pub struct CopilotTokenExchange {
    client: reqwest::Client,
    token_url: String,
    headers: BTreeMap<String, String>,
    credentials_path: PathBuf,
    github_token_env: String,
    state: RwLock<Option<StoredCredentials>>,
}

impl CopilotTokenExchange {
    pub fn new(config: &UpstreamConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            token_url: config.token_url.clone(),
            headers: config.headers.clone(),
            credentials_path: config.credentials_path(),
            github_token_env: config.github_token_env.clone(),
            state: RwLock::new(None),
        }
    }

    async fn load_credentials(&self) -> Result<StoredCredentials> {
        let mut creds = match tokio::fs::read(&self.credentials_path).await {
            Ok(bytes) => serde_json::from_slice::<StoredCredentials>(&bytes).map_err(|e| {
                ProxyError::auth(format!(
                    "Failed to parse credentials file {}: {}",
                    self.credentials_path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoredCredentials::default(),
            Err(e) => return Err(e.into()),
        };

        if let Ok(token) = std::env::var(&self.github_token_env) {
            if !token.is_empty() && token != creds.github_token {
                debug!(env = %self.github_token_env, "Using GitHub token from environment");
                creds = StoredCredentials {
                    github_token: token,
                    ..StoredCredentials::default()
                };
            }
        }

        if creds.github_token.is_empty() {
            return Err(ProxyError::auth(format!(
                "No GitHub token found. Set {} or add github_token to {}",
                self.github_token_env,
                self.credentials_path.display()
            )));
        }

        Ok(creds)
    }

    async fn save_credentials(&self, creds: &StoredCredentials) {
        let result = async {
            let data = serde_json::to_vec(creds)?;
            tokio::fs::write(&self.credentials_path, data).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                tokio::fs::set_permissions(&self.credentials_path, perms).await?;
            }
            Ok::<_, ProxyError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(path = %self.credentials_path.display(), error = %e, "Failed to persist credentials");
        }
    }

    async fn exchange(&self, github_token: &str) -> Result<TokenExchangeResponse> {
        let mut req = self
            .client
            .get(&self.token_url)
            .header("Accept", "application/json")
            .bearer_auth(github_token);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProxyError::auth(format!(
                "GitHub token expired. Re-authenticate by deleting {}",
                self.credentials_path.display()
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxyError::auth(format!(
                "Failed to get Copilot token ({}): {}",
                status.as_u16(),
                body
            )));
        }

        resp.json::<TokenExchangeResponse>()
            .await
            .map_err(|e| ProxyError::auth(format!("Invalid Copilot token response: {e}")))
    }
}

#[async_trait]
impl CredentialProvider for CopilotTokenExchange {
    async fn bearer_token(&self) -> Result<String> {
        let now_ms = chrono::Utc::now().timestamp_millis();

        {
            let state = self.state.read().await;
            if let Some(creds) = state.as_ref().filter(|c| c.has_fresh_token(now_ms)) {
                return Ok(creds.copilot_token.clone());
            }
        }

        let mut state = self.state.write().await;

        // Another task may have refreshed while we waited for the lock
        if let Some(creds) = state.as_ref().filter(|c| c.has_fresh_token(now_ms)) {
            return Ok(creds.copilot_token.clone());
        }

        let mut creds = match state.take() {
            Some(creds) => creds,
            None => self.load_credentials().await?,
        };

        if creds.has_fresh_token(now_ms) {
            let token = creds.copilot_token.clone();
            *state = Some(creds);
            return Ok(token);
        }

        debug!("Refreshing Copilot API token");
        let github_token = creds.github_token.clone();
        *state = Some(creds.clone());
        let exchanged = self.exchange(&github_token).await?;

        creds.copilot_token = exchanged.token;
        creds.copilot_expires = exchanged.expires_at * 1000;
        info!(
            expires_at = exchanged.expires_at,
            "Obtained Copilot API token"
        );

        self.save_credentials(&creds).await;
        let token = creds.copilot_token.clone();
        *state = Some(creds);
        Ok(token)
    }
}
