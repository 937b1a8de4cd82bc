use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pre-warm pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Target number of ready-but-unassigned agents. The store key
    /// `pool:target` overrides this at runtime when present.
    #[serde(default = "d_3")]
    pub target_size: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { target_size: 3 }
    }
}

fn d_3() -> u32 {
    3
}
