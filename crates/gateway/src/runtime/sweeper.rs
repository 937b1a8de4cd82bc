//! Periodic reconciliation: pool refill, process liveness, idle cleanup.
//!
//! Each sweep is a pure pass over the store plus the process table; one
//! interval task per sweep, so a given sweep never runs concurrently
//! with itself. Sessions vanishing between list and act are normal —
//! removal is idempotent and `NotFound` is not an error here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use sb_domain::config::Config;
use sb_domain::Error;
use sb_store::{keys, StateStore};
use sb_supervisor::alive_group;

use crate::runtime::pool::PoolManager;
use crate::runtime::registry::SessionRegistry;

pub struct Sweeper {
    store: Arc<dyn StateStore>,
    registry: Arc<SessionRegistry>,
    pool: Arc<PoolManager>,
    config: Arc<Config>,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<SessionRegistry>,
        pool: Arc<PoolManager>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            registry,
            pool,
            config,
        }
    }

    /// Keep `|pool-ready|` at target.
    pub async fn pool_refill_tick(&self) {
        match self.pool.refill().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(enqueued = n, "pool refill enqueued spawns"),
            // Store down: skip the cycle, the next tick retries.
            Err(e) => tracing::warn!(error = %e, "pool refill skipped"),
        }
    }

    /// Remove sessions whose process group is gone. Covers assigned
    /// sessions (`ready`, which also holds `active` ones) and pool
    /// agents.
    pub async fn liveness_tick(&self) {
        for index in [keys::INDEX_READY, keys::INDEX_POOL_READY] {
            let members = match self.store.index_members(index).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, index, "liveness probe skipped");
                    return;
                }
            };
            for id in members {
                let session = match self.store.get_session(&id).await {
                    Ok(Some(s)) => s,
                    // Index entry without a record: the TTL beat us to
                    // the record, drop the dangling membership.
                    Ok(None) => {
                        let _ = self.store.remove_from_index(index, &id).await;
                        continue;
                    }
                    Err(_) => continue,
                };
                let Some(pgid) = session.agent_pgid else {
                    continue;
                };
                if !alive_group(pgid) {
                    tracing::warn!(session_id = %id, pgid, "agent process died, reclaiming");
                    match self.registry.remove(&id, "process died").await {
                        Ok(_) | Err(Error::NotFound(_)) => {}
                        Err(e) => tracing::warn!(session_id = %id, error = %e, "reclaim failed"),
                    }
                }
            }
        }
    }

    /// Remove assigned sessions idle past their threshold. Pool agents
    /// are exempt — sitting idle is their job.
    pub async fn idle_tick(&self) {
        let members = match self.store.index_members(keys::INDEX_READY).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "idle sweep skipped");
                return;
            }
        };
        let now = Utc::now();
        for id in members {
            let session = match self.store.get_session(&id).await {
                Ok(Some(s)) => s,
                _ => continue,
            };
            let timeout = self.config.sessions.idle_timeout_for(&session.voice_id);
            let idle_secs = now
                .signed_duration_since(session.last_active_at)
                .num_seconds();
            if idle_secs > timeout as i64 {
                tracing::info!(session_id = %id, idle_secs, "session idle, removing");
                match self.registry.remove(&id, "idle").await {
                    Ok(_) | Err(Error::NotFound(_)) => {}
                    Err(e) => tracing::warn!(session_id = %id, error = %e, "idle removal failed"),
                }
            }
        }
    }
}

/// Spawn the three sweep loops plus the lock-map pruner. Intervals come
/// from config; the first tick of each loop fires after one full period.
pub fn spawn_sweepers(sweeper: Arc<Sweeper>) {
    let cfg = sweeper.config.sweep.clone();

    let s = sweeper.clone();
    tokio::spawn(async move {
        let mut interval = delayed_interval(cfg.pool_refill_secs);
        loop {
            interval.tick().await;
            s.pool_refill_tick().await;
        }
    });

    let s = sweeper.clone();
    tokio::spawn(async move {
        let mut interval = delayed_interval(cfg.liveness_secs);
        loop {
            interval.tick().await;
            s.liveness_tick().await;
        }
    });

    let s = sweeper.clone();
    tokio::spawn(async move {
        let mut interval = delayed_interval(cfg.idle_sweep_secs);
        loop {
            interval.tick().await;
            s.idle_tick().await;
            s.registry.locks().prune_idle();
        }
    });
}

fn delayed_interval(period_secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(period_secs);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}
