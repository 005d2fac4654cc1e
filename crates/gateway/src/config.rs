//! Gateway-level configuration: server bind address, CORS, per-provider
//! webhook secrets, and the embedded [`SandboxEngineConfig`].
//!
//! Loaded from a TOML file (path from the `SBX_CONFIG` env var, default
//! `config.toml`); if the file is absent the gateway boots on defaults —
//! config presence is optional, validity when present is not.

use std::collections::HashMap;
use std::path::Path;

use sbx_domain::error::{Error, Result};
use sbx_sandbox::SandboxEngineConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_api_token_env")]
    pub api_token_env: String,
    #[serde(default = "default_cors_origins")]
    pub cors_allowed_origins: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: default_database_path(),
            api_token_env: default_api_token_env(),
            cors_allowed_origins: default_cors_origins(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8088
}
fn default_database_path() -> String {
    "./data/sandbox.db".to_string()
}
fn default_api_token_env() -> String {
    "SBX_API_TOKEN".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".to_string()]
}
fn default_max_concurrent() -> usize {
    256
}

/// Per-provider HMAC secret used to verify `POST /webhooks/:provider_name`.
/// A provider absent from this map accepts unsigned webhooks — signature
/// verification is opt-in per provider, not a blanket requirement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default = "default_reconcile_interval_sec")]
    pub reconcile_interval_sec: u64,
    #[serde(default = "default_refresh_stale_after_sec")]
    pub refresh_stale_after_sec: i64,
}

fn default_reconcile_interval_sec() -> u64 {
    20
}
fn default_refresh_stale_after_sec() -> i64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: SandboxEngineConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
}

impl GatewayConfig {
    /// Loads from `path` if it exists, else returns defaults. A present but
    /// malformed file is an error — we never silently fall back on a bad
    /// config the way we fall back on a missing one.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&raw).map_err(|e| Error::Other(format!("invalid config at {}: {e}", path.display())))
    }
}
