use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session timeouts & TTLs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Idle threshold for the cleanup sweep.
    #[serde(default = "d_idle")]
    pub idle_timeout_secs: u64,
    /// Idle threshold for long-form voice configurations.
    #[serde(default = "d_long_idle")]
    pub long_form_idle_timeout_secs: u64,
    /// Voice ids that get the long-form idle threshold.
    #[serde(default)]
    pub long_form_voice_ids: Vec<String>,
    /// Store TTL on every per-session key. Comfortably above the longest
    /// intended conversation so a crashed orchestrator cannot leak
    /// records forever.
    #[serde(default = "d_ttl")]
    pub ttl_secs: u64,
}

impl SessionsConfig {
    /// Idle threshold for a given voice.
    pub fn idle_timeout_for(&self, voice_id: &str) -> u64 {
        if self.long_form_voice_ids.iter().any(|v| v == voice_id) {
            self.long_form_idle_timeout_secs
        } else {
            self.idle_timeout_secs
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: d_idle(),
            long_form_idle_timeout_secs: d_long_idle(),
            long_form_voice_ids: Vec::new(),
            ttl_secs: d_ttl(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_idle() -> u64 {
    1800 // 30 minutes
}
fn d_long_idle() -> u64 {
    14_400 // 4 hours
}
fn d_ttl() -> u64 {
    14_400 // 4 hours
}
