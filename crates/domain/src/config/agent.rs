use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent launch & capacity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable launched for each session (the voice pipeline).
    #[serde(default)]
    pub launch_path: String,
    /// Extra fixed arguments prepended before the per-session flags.
    #[serde(default)]
    pub launch_args: Vec<String>,
    /// Working directory for the agent, if different from ours.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Cap on `|ready| + |starting|` across this orchestrator.
    #[serde(default = "d_50")]
    pub max_bots: usize,
    /// Parallel spawn workers.
    #[serde(default = "d_4")]
    pub spawn_concurrency: usize,
    /// Deadline for the agent to emit a readiness marker.
    #[serde(default = "d_30")]
    pub startup_timeout_secs: u64,
    /// Polite-termination window before the group is force-killed.
    #[serde(default = "d_2")]
    pub terminate_grace_secs: u64,
    /// Default voice used by pool agents and voiceless requests.
    #[serde(default = "d_voice")]
    pub default_voice_id: String,
}

impl AgentConfig {
    /// Spawn queue bound: twice the bot capacity, so a burst can queue
    /// but an unbounded backlog cannot form.
    pub fn max_queue(&self) -> usize {
        self.max_bots * 2
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            launch_path: String::new(),
            launch_args: Vec::new(),
            workdir: None,
            max_bots: 50,
            spawn_concurrency: 4,
            startup_timeout_secs: 30,
            terminate_grace_secs: 2,
            default_voice_id: d_voice(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_50() -> usize {
    50
}
fn d_4() -> usize {
    4
}
fn d_30() -> u64 {
    30
}
fn d_2() -> u64 {
    2
}
fn d_voice() -> String {
    "Olivia".into()
}
