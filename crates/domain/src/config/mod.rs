mod agent;
mod media;
mod pool;
mod server;
mod sessions;
mod store;
mod sweep;

pub use agent::*;
pub use media::*;
pub use pool::*;
pub use server::*;
pub use sessions::*;
pub use store::*;
pub use sweep::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl Config {
    /// Parse from TOML text.
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        toml::from_str(text).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate the loaded configuration. The boot path fails fast on any
    /// `Error`-severity issue before accepting traffic.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.media.server_url.is_empty() && std::env::var(&self.media.server_url_env).is_err() {
            issues.push(ConfigIssue::error(
                "media.server_url",
                format!(
                    "media server URL missing (set media.server_url or {})",
                    self.media.server_url_env
                ),
            ));
        }
        for env in [&self.media.api_key_env, &self.media.api_secret_env] {
            if std::env::var(env).map(|v| v.is_empty()).unwrap_or(true) {
                issues.push(ConfigIssue::error(
                    "media",
                    format!("required secret env var {env} is not set"),
                ));
            }
        }
        if std::env::var(&self.media.webhook.secret_env)
            .map(|v| v.is_empty())
            .unwrap_or(true)
        {
            if self.media.webhook.allow_unsigned {
                issues.push(ConfigIssue::warning(
                    "media.webhook",
                    format!(
                        "{} not set and unsigned webhooks allowed — development only",
                        self.media.webhook.secret_env
                    ),
                ));
            } else {
                issues.push(ConfigIssue::error(
                    "media.webhook",
                    format!("required secret env var {} is not set", self.media.webhook.secret_env),
                ));
            }
        }
        if self.agent.launch_path.is_empty() {
            issues.push(ConfigIssue::error(
                "agent.launch_path",
                "agent launch path is required",
            ));
        }
        if self.agent.max_bots == 0 {
            issues.push(ConfigIssue::error("agent.max_bots", "must be at least 1"));
        }
        if self.agent.spawn_concurrency == 0 {
            issues.push(ConfigIssue::error("agent.spawn_concurrency", "must be at least 1"));
        }
        if self.pool.target_size as usize > self.agent.max_bots {
            issues.push(ConfigIssue::warning(
                "pool.target_size",
                "pool target exceeds max_bots — the pool can starve callers",
            ));
        }
        if self.sessions.ttl_secs < self.sessions.idle_timeout_secs {
            issues.push(ConfigIssue::warning(
                "sessions.ttl_secs",
                "record TTL below the idle timeout — records can expire under live sessions",
            ));
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}
