use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Media server (LiveKit)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection to the WebRTC media server. Secrets are never stored in
/// the config file — only the names of the env vars holding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Media server URL handed to callers and agents (e.g. `wss://…`).
    #[serde(default)]
    pub server_url: String,
    #[serde(default = "d_url_env")]
    pub server_url_env: String,
    #[serde(default = "d_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_secret_env")]
    pub api_secret_env: String,
    /// Join-token lifetime. Long enough for a full conversation.
    #[serde(default = "d_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl MediaConfig {
    pub fn effective_server_url(&self) -> String {
        std::env::var(&self.server_url_env).unwrap_or_else(|_| self.server_url.clone())
    }

    pub fn api_key(&self) -> crate::Result<String> {
        read_secret(&self.api_key_env)
    }

    pub fn api_secret(&self) -> crate::Result<String> {
        read_secret(&self.api_secret_env)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            server_url_env: d_url_env(),
            api_key_env: d_key_env(),
            api_secret_env: d_secret_env(),
            token_ttl_secs: d_token_ttl(),
            webhook: WebhookConfig::default(),
        }
    }
}

/// Inbound webhook verification (HMAC-SHA256 over the raw body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "d_webhook_env")]
    pub secret_env: String,
    /// Accept webhooks with no signature header. Development only;
    /// production deployments must leave this off.
    #[serde(default)]
    pub allow_unsigned: bool,
}

impl WebhookConfig {
    pub fn secret(&self) -> Option<String> {
        std::env::var(&self.secret_env).ok().filter(|s| !s.is_empty())
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret_env: d_webhook_env(),
            allow_unsigned: false,
        }
    }
}

fn read_secret(env: &str) -> crate::Result<String> {
    match std::env::var(env) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(crate::Error::Config(format!("env var {env} is not set"))),
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_url_env() -> String {
    "SB_LIVEKIT_URL".into()
}
fn d_key_env() -> String {
    "SB_LIVEKIT_API_KEY".into()
}
fn d_secret_env() -> String {
    "SB_LIVEKIT_API_SECRET".into()
}
fn d_webhook_env() -> String {
    "SB_WEBHOOK_SECRET".into()
}
fn d_token_ttl() -> u64 {
    7200
}
