use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sweep intervals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Pool refill cadence.
    #[serde(default = "d_30")]
    pub pool_refill_secs: u64,
    /// Dead-process probe cadence.
    #[serde(default = "d_60")]
    pub liveness_secs: u64,
    /// Idle-session sweep cadence.
    #[serde(default = "d_300")]
    pub idle_sweep_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            pool_refill_secs: 30,
            liveness_secs: 60,
            idle_sweep_secs: 300,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_30() -> u64 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_300() -> u64 {
    300
}
