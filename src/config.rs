use crate::error::{ProxyError, Result};
use crate::translate::request::RequestDefaults;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.githubcopilot.com";
pub const DEFAULT_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
pub const DEFAULT_TELEMETRY_HOST: &str = "https://cloud.langfuse.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
    /// When set, clients must present this key as a bearer token or `X-API-Key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub defaults: RequestDefaults,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Exchange a GitHub token for short-lived Copilot API tokens.
    Copilot,
    /// Send a fixed bearer token read from `token_env`.
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_auth_mode")]
    pub auth: AuthMode,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_github_token_env")]
    pub github_token_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_copilot_headers")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Merged over the built-in alias table.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_telemetry_host")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_auth_mode() -> AuthMode {
    AuthMode::Copilot
}

fn default_token_env() -> String {
    "COPILOT_TOKEN".to_string()
}

fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_copilot_headers() -> BTreeMap<String, String> {
    [
        ("User-Agent", "GitHubCopilotChat/0.32.4"),
        ("Editor-Version", "vscode/1.105.1"),
        ("Editor-Plugin-Version", "copilot-chat/0.32.4"),
        ("Copilot-Integration-Id", "vscode-chat"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_telemetry_host() -> String {
    DEFAULT_TELEMETRY_HOST.to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_flush_interval_secs() -> u64 {
    5
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            api_key: None,
            upstream: UpstreamConfig::default(),
            defaults: RequestDefaults::default(),
            models: ModelsConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth: default_auth_mode(),
            token_env: default_token_env(),
            github_token_env: default_github_token_env(),
            credentials_file: None,
            timeout_secs: default_timeout_secs(),
            token_url: default_token_url(),
            headers: default_copilot_headers(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            aliases: HashMap::new(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_telemetry_host(),
            public_key: None,
            secret_key: None,
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Where GitHub and Copilot tokens are persisted between runs.
    pub fn credentials_path(&self) -> PathBuf {
        match self.credentials_file {
            Some(ref path) => path.clone(),
            None => dirs_path()
                .unwrap_or_default()
                .join(".copilot_credentials.json"),
        }
    }

    /// Resolve the static bearer token from the configured environment variable
    pub fn resolve_static_token(&self) -> Result<String> {
        std::env::var(&self.token_env).map_err(|_| {
            ProxyError::config(format!(
                "Environment variable '{}' not set. Set it with your upstream API token.",
                self.token_env
            ))
        })
    }
}

impl TelemetryConfig {
    /// Credentials, if telemetry is enabled and both keys are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if !self.enabled {
            return None;
        }
        match (self.public_key.as_deref(), self.secret_key.as_deref()) {
            (Some(public), Some(secret)) if !public.is_empty() && !secret.is_empty() => {
                Some((public, secret))
            }
            _ => None,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Apply `COPILOT_*` and `LANGFUSE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides using `lookup` in place of the process environment.
    /// Unparsable numbers are ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = get("COPILOT_HOST") {
            self.host = host;
        }
        if let Some(port) = get("COPILOT_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(debug) = get("COPILOT_DEBUG") {
            self.debug = is_truthy(&debug);
        }
        if let Some(key) = get("COPILOT_API_KEY") {
            self.api_key = Some(key);
        }

        let telemetry = &mut self.telemetry;
        if let Some(enabled) = get("LANGFUSE_ENABLED") {
            telemetry.enabled = is_truthy(&enabled);
        }
        if let Some(host) = get("LANGFUSE_HOST") {
            telemetry.host = host;
        }
        if let Some(key) = get("LANGFUSE_PUBLIC_KEY") {
            telemetry.public_key = Some(key);
        }
        if let Some(key) = get("LANGFUSE_SECRET_KEY") {
            telemetry.secret_key = Some(key);
        }
        if let Some(size) = get("LANGFUSE_BATCH_SIZE")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|s| *s > 0)
        {
            telemetry.batch_size = size;
        }
        if let Some(secs) = get("LANGFUSE_FLUSH_INTERVAL").and_then(|s| parse_seconds(&s)) {
            telemetry.flush_interval_secs = secs;
        }
    }

    /// The API-key gate is open when no key, or an empty key, is configured.
    pub fn required_api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Accepts `5` or `5s`.
fn parse_seconds(value: &str) -> Option<u64> {
    value
        .trim()
        .trim_end_matches('s')
        .parse::<u64>()
        .ok()
        .filter(|s| *s > 0)
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("copilot-proxy.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("copilot-proxy")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("copilot-proxy").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("copilot-proxy").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".copilot-proxy.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
