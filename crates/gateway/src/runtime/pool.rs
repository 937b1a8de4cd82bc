//! Pool Manager — keeps a target count of ready-but-unassigned agents
//! and atomically hands one to a caller.
//!
//! The atomic pop on `pool-ready` **is** the concurrency primitive: two
//! callers racing for the last pool agent cannot both win. Everything
//! after the pop is recoverable — a session orphaned between pop and
//! index insertion still has its record, and the liveness sweep reclaims
//! it.

use std::sync::Arc;

use sb_domain::config::Config;
use sb_domain::{ConfigSnapshot, Result, Session};
use sb_store::codec::{self, fields};
use sb_store::{keys, StateStore};

use crate::runtime::registry::SessionRegistry;
use crate::runtime::spawn::{SpawnJob, SpawnQueue};

/// Result of a pool assignment attempt.
pub enum PoolAssignment {
    /// The caller owns this pool agent now.
    Assigned(Session),
    /// No ready agent available — cold-spawn instead.
    Empty,
    /// The caller's identity was claimed concurrently by another start;
    /// the popped agent went back to the pool.
    Raced { existing_id: String },
}

pub struct PoolManager {
    store: Arc<dyn StateStore>,
    registry: Arc<SessionRegistry>,
    queue: SpawnQueue,
    config: Arc<Config>,
}

impl PoolManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<SessionRegistry>,
        queue: SpawnQueue,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            config,
        }
    }

    /// Effective pool target: runtime store override, else config.
    pub async fn target(&self) -> u32 {
        match self.store.pool_target().await {
            Ok(Some(t)) => t,
            _ => self.config.pool.target_size,
        }
    }

    /// Pool agents run the default voice with no custom prompt. A
    /// request wanting anything else bypasses the pool and cold-spawns,
    /// so an assigned agent never runs with configuration other than
    /// what it was launched with.
    pub fn default_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            voice_id: self.config.agent.default_voice_id.clone(),
            opening_line: None,
            system_prompt: None,
        }
    }

    /// Top the pool back up to target. Prewarm spawns already in flight
    /// count against the deficit so a refill tick shorter than the agent
    /// startup time does not over-spawn.
    pub async fn refill(&self) -> Result<usize> {
        let target = self.target().await as usize;
        let pool_ready = self.store.index_size(keys::INDEX_POOL_READY).await?;

        let mut prewarm_in_flight = 0;
        for id in self.store.index_members(keys::INDEX_STARTING).await? {
            if let Some(s) = self.store.get_session(&id).await? {
                if s.prewarmed {
                    prewarm_in_flight += 1;
                }
            }
        }

        let deficit = target.saturating_sub(pool_ready + prewarm_in_flight);
        if deficit == 0 {
            return Ok(0);
        }
        tracing::info!(target, pool_ready, prewarm_in_flight, deficit, "refilling pool");

        let mut enqueued = 0;
        for _ in 0..deficit {
            let id = uuid::Uuid::new_v4().to_string();
            let snapshot = self.default_snapshot();
            let job = SpawnJob::new(&id, true);

            let mut session = Session::prewarmed(&id, snapshot.clone());
            session.spawn_job_id = Some(job.job_id.clone());

            self.store.put_config(&id, &snapshot).await?;
            self.registry.create(&session).await?;

            if let Err(e) = self.queue.enqueue(job) {
                // Queue full — drop the placeholder and stop; the next
                // sweep retries.
                tracing::warn!(error = %e, "pool refill hit a full spawn queue");
                let _ = self.store.delete_session_and_indexes(&id).await;
                break;
            }
            enqueued += 1;
        }
        Ok(enqueued)
    }

    /// Atomically take one ready agent for `user_identity`.
    pub async fn assign_from_pool(&self, user_identity: &str) -> Result<PoolAssignment> {
        loop {
            let Some(id) = self.store.pop_pool_ready().await? else {
                return Ok(PoolAssignment::Empty);
            };

            // A popped id whose record has expired is a stale pool
            // entry — skip it and keep popping.
            if self.store.get_session(&id).await?.is_none() {
                tracing::warn!(session_id = %id, "dropped stale pool entry");
                continue;
            }

            if !self.store.claim_user_session(user_identity, &id).await? {
                // The identity got a session between the caller's
                // idempotency check and our pop. Give the agent back.
                self.store.add_to_index(keys::INDEX_POOL_READY, &id).await?;
                let existing_id = self
                    .store
                    .get_user_session(user_identity)
                    .await?
                    .unwrap_or_default();
                return Ok(PoolAssignment::Raced { existing_id });
            }

            self.store
                .patch_session(
                    &id,
                    &[
                        (fields::USER_IDENTITY, user_identity.to_string()),
                        (
                            fields::LAST_ACTIVE_AT,
                            codec::timestamp_to_string(chrono::Utc::now()),
                        ),
                    ],
                )
                .await?;
            self.store.add_to_index(keys::INDEX_READY, &id).await?;
            let _ = self.store.incr_pool_stat("total_assigned").await;

            let session = self
                .store
                .get_session(&id)
                .await?
                .ok_or_else(|| sb_domain::Error::Internal(format!("assigned session {id} vanished")))?;
            tracing::info!(session_id = %id, user = %user_identity, "assigned from pool");
            return Ok(PoolAssignment::Assigned(session));
        }
    }
}
