//! Key layout in the shared store.
//!
//! ```text
//! session:{id}          record hash
//! session:{id}:config   voice/opening-line/prompt snapshot
//! agent:{id}:pid        pid mirror for fast lookup
//! agent:{id}:logs       capped list of recent output lines
//! user:{identity}:session   per-user idempotency claim
//! ready / starting / pool-ready   index sets
//! ratelimit:{bucket}    window counter
//! pool:target           runtime pool-size override
//! pool:stats            spawn/assign counters
//! ```

/// Sessions with an assigned caller that reached readiness.
pub const INDEX_READY: &str = "ready";
/// Sessions whose spawn is still in flight.
pub const INDEX_STARTING: &str = "starting";
/// Ready-but-unassigned pool agents.
pub const INDEX_POOL_READY: &str = "pool-ready";

/// Maximum retained log lines per session.
pub const LOG_CAP: usize = 100;

pub fn session(id: &str) -> String {
    format!("session:{id}")
}

pub fn session_config(id: &str) -> String {
    format!("session:{id}:config")
}

pub fn agent_pid(id: &str) -> String {
    format!("agent:{id}:pid")
}

pub fn agent_logs(id: &str) -> String {
    format!("agent:{id}:logs")
}

pub fn user_session(identity: &str) -> String {
    format!("user:{identity}:session")
}

pub fn rate_limit(bucket: &str) -> String {
    format!("ratelimit:{bucket}")
}

pub const POOL_TARGET: &str = "pool:target";
pub const POOL_STATS: &str = "pool:stats";
