use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store URL. `redis://…` selects the Redis backend; `memory://`
    /// selects the in-process backend (tests and single-node dev).
    /// Overridable via the env var named in `url_env`.
    #[serde(default = "d_url")]
    pub url: String,
    #[serde(default = "d_url_env")]
    pub url_env: String,
}

impl StoreConfig {
    /// Effective URL: env var wins over the config file.
    pub fn effective_url(&self) -> String {
        std::env::var(&self.url_env).unwrap_or_else(|_| self.url.clone())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: d_url(),
            url_env: d_url_env(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn d_url_env() -> String {
    "SB_STORE_URL".into()
}
