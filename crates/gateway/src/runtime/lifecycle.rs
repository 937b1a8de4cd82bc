//! Lifecycle Controller — the public façade over pool, registry, spawn
//! queue, and token issuer.
//!
//! Every termination path (API call, media webhook, sweeper) funnels
//! through `Registry::remove`; this module only decides *whether* and
//! *why*.

use std::sync::Arc;

use serde::Deserialize;

use sb_domain::config::Config;
use sb_domain::{CleanupReport, ConfigSnapshot, Error, Result, Session};
use sb_store::{keys, StateStore};

use crate::runtime::pool::{PoolAssignment, PoolManager};
use crate::runtime::registry::SessionRegistry;
use crate::runtime::spawn::{SpawnJob, SpawnQueue};
use crate::token::TokenIssuer;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests / outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub user_identity: String,
    pub voice_id: Option<String>,
    pub opening_line: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug)]
pub struct StartOutcome {
    pub session: Session,
    pub token: String,
}

/// Inbound media-server webhook payload.
#[derive(Debug, Deserialize)]
pub struct MediaEvent {
    pub event: String,
    #[serde(default)]
    pub room: Option<RoomRef>,
    #[serde(default)]
    pub participant: Option<ParticipantRef>,
}

#[derive(Debug, Deserialize)]
pub struct RoomRef {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ParticipantRef {
    pub identity: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LifecycleController {
    store: Arc<dyn StateStore>,
    registry: Arc<SessionRegistry>,
    pool: Arc<PoolManager>,
    queue: SpawnQueue,
    tokens: Arc<TokenIssuer>,
    config: Arc<Config>,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<SessionRegistry>,
        pool: Arc<PoolManager>,
        queue: SpawnQueue,
        tokens: Arc<TokenIssuer>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            registry,
            pool,
            queue,
            tokens,
            config,
        }
    }

    /// Begin (or rejoin) a session for a caller. Responds immediately:
    /// the caller may join the media room right away, the agent arrives
    /// or is already there.
    pub async fn start(&self, req: StartRequest, client_ip: &str) -> Result<StartOutcome> {
        // 1. Per-IP rate limit, counted in the shared store so the
        //    window spans all orchestrator instances.
        let rl = &self.config.server.rate_limit;
        if !self
            .store
            .rate_limit(&format!("ip:{client_ip}"), rl.window_secs, rl.max_requests)
            .await?
        {
            return Err(Error::RateLimited);
        }

        // 2. Capacity gate on live + in-flight sessions.
        let in_use = self.store.index_size(keys::INDEX_READY).await?
            + self.store.index_size(keys::INDEX_STARTING).await?;
        if in_use >= self.config.agent.max_bots {
            return Err(Error::AtCapacity(format!(
                "{in_use} sessions of {} in use",
                self.config.agent.max_bots
            )));
        }

        // 3. Idempotency: one non-terminal session per identity.
        if let Some(existing) = self.store.get_user_session(&req.user_identity).await? {
            match self.store.get_session(&existing).await? {
                Some(s) if !s.status.is_terminal() => return self.outcome_for(s),
                _ => {
                    // Stale claim (crashed teardown or expired record).
                    self.store
                        .release_user_session(&req.user_identity, &existing)
                        .await?;
                }
            }
        }

        // 4. Pool hit — only for default-configuration requests, so an
        //    assigned agent never runs with a voice or prompt other
        //    than what it was launched with.
        if self.pool_eligible(&req) {
            match self.pool.assign_from_pool(&req.user_identity).await? {
                PoolAssignment::Assigned(session) => return self.outcome_for(session),
                PoolAssignment::Raced { existing_id } => {
                    if let Some(s) = self.store.get_session(&existing_id).await? {
                        if !s.status.is_terminal() {
                            return self.outcome_for(s);
                        }
                    }
                    return Err(Error::Internal(
                        "concurrent start collision, retry".into(),
                    ));
                }
                PoolAssignment::Empty => {}
            }
        }

        // 5. Cold spawn.
        self.cold_start(&req).await
    }

    async fn cold_start(&self, req: &StartRequest) -> Result<StartOutcome> {
        let id = uuid::Uuid::new_v4().to_string();

        if !self
            .store
            .claim_user_session(&req.user_identity, &id)
            .await?
        {
            // Lost the claim to a concurrent start for the same
            // identity — return the winner's session.
            if let Some(existing) = self.store.get_user_session(&req.user_identity).await? {
                if let Some(s) = self.store.get_session(&existing).await? {
                    if !s.status.is_terminal() {
                        return self.outcome_for(s);
                    }
                }
            }
            return Err(Error::Internal(
                "concurrent start collision, retry".into(),
            ));
        }

        let snapshot = self.snapshot_for(req);
        let job = SpawnJob::new(&id, false);
        let mut session = Session::new(&id, &req.user_identity, snapshot.clone());
        session.spawn_job_id = Some(job.job_id.clone());

        // Snapshot before the job can run: the worker reads exactly
        // this configuration, keyed by session id.
        self.store.put_config(&id, &snapshot).await?;
        self.registry.create(&session).await?;

        if let Err(e) = self.queue.enqueue(job) {
            // Back out so the failed attempt does not hold capacity or
            // the identity claim.
            let _ = self.store.delete_session_and_indexes(&id).await;
            let _ = self
                .store
                .release_user_session(&req.user_identity, &id)
                .await;
            return Err(e);
        }

        self.outcome_for(session)
    }

    /// Mint the caller's room-join token. The room *is* the session id.
    fn outcome_for(&self, session: Session) -> Result<StartOutcome> {
        let token = self.tokens.mint(&session.id, &session.user_identity)?;
        Ok(StartOutcome { session, token })
    }

    fn snapshot_for(&self, req: &StartRequest) -> ConfigSnapshot {
        ConfigSnapshot {
            voice_id: req
                .voice_id
                .clone()
                .unwrap_or_else(|| self.config.agent.default_voice_id.clone()),
            opening_line: req.opening_line.clone(),
            system_prompt: req.system_prompt.clone(),
        }
    }

    /// A request is pool-compatible only when it asks for exactly what
    /// pool agents were launched with: default voice, no custom lines.
    fn pool_eligible(&self, req: &StartRequest) -> bool {
        req.opening_line.is_none()
            && req.system_prompt.is_none()
            && req
                .voice_id
                .as_deref()
                .map(|v| v == self.config.agent.default_voice_id)
                .unwrap_or(true)
    }

    /// Explicit termination. 404s on unknown ids, idempotent otherwise.
    pub async fn end(&self, session_id: &str) -> Result<CleanupReport> {
        self.registry.remove(session_id, "api").await
    }

    /// Verified media-server event. Duplicates and already-gone rooms
    /// are normal — both resolve to Ok.
    pub async fn handle_media_event(&self, event: &MediaEvent) -> Result<()> {
        let Some(room) = event.room.as_ref().map(|r| r.name.as_str()) else {
            return Ok(());
        };

        match event.event.as_str() {
            "participant_joined" => {
                // The agent's own join is not a conversation start.
                let is_agent = event
                    .participant
                    .as_ref()
                    .map(|p| p.identity.starts_with("agent-"))
                    .unwrap_or(false);
                if is_agent {
                    return Ok(());
                }
                match self.registry.mark_active(room, chrono::Utc::now()).await {
                    Ok(()) => Ok(()),
                    Err(Error::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            "participant_left" | "room_finished" => {
                match self.registry.remove(room, "disconnect").await {
                    Ok(report) => {
                        tracing::info!(
                            session_id = %room,
                            duration_seconds = report.duration_seconds,
                            "session ended by disconnect"
                        );
                        Ok(())
                    }
                    Err(Error::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            other => {
                tracing::debug!(event = %other, room = %room, "ignoring media event");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use sb_domain::{SessionStatus, StepOutcome};
    use sb_store::MemoryStore;
    use sb_supervisor::Supervisor;

    struct Rig {
        store: Arc<MemoryStore>,
        lifecycle: LifecycleController,
        rx: tokio::sync::mpsc::Receiver<SpawnJob>,
        tokens: Arc<TokenIssuer>,
    }

    fn rig_with(config: sb_domain::config::Config, queue_cap: usize) -> Rig {
        let config = Arc::new(config);
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new(
            store.clone(),
            Arc::new(Supervisor::new(None)),
            Duration::from_millis(100),
        ));
        let (queue, rx) = SpawnQueue::bounded(queue_cap);
        let pool = Arc::new(PoolManager::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            config.clone(),
        ));
        let tokens = Arc::new(TokenIssuer::new("key".into(), "secret".into(), 7200));
        let lifecycle = LifecycleController::new(
            store.clone(),
            registry.clone(),
            pool,
            queue,
            tokens.clone(),
            config,
        );
        Rig {
            store,
            lifecycle,
            rx,
            tokens,
        }
    }

    fn rig() -> Rig {
        rig_with(sb_domain::config::Config::default(), 16)
    }

    fn start_req(user: &str) -> StartRequest {
        StartRequest {
            user_identity: user.into(),
            voice_id: None,
            opening_line: None,
            system_prompt: None,
        }
    }

    async fn preload_pool(store: &MemoryStore, id: &str) {
        let mut s = Session::prewarmed(
            id,
            ConfigSnapshot {
                voice_id: "Olivia".into(),
                opening_line: None,
                system_prompt: None,
            },
        );
        s.status = SessionStatus::Ready;
        store.put_session(&s).await.unwrap();
        store.add_to_index(keys::INDEX_POOL_READY, id).await.unwrap();
    }

    #[tokio::test]
    async fn pool_hit_returns_ready_session() {
        let rig = rig();
        preload_pool(&rig.store, "P1").await;

        let out = rig.lifecycle.start(start_req("alice"), "1.1.1.1").await.unwrap();
        assert_eq!(out.session.id, "P1");
        assert_eq!(out.session.status, SessionStatus::Ready);
        assert_eq!(out.session.user_identity, "alice");

        // Token grants exactly this room to this identity.
        let claims = rig.tokens.verify(&out.token).unwrap();
        assert_eq!(claims.video.room, "P1");
        assert_eq!(claims.sub, "alice");

        assert_eq!(rig.store.index_size(keys::INDEX_POOL_READY).await.unwrap(), 0);
        assert_eq!(rig.store.index_size(keys::INDEX_READY).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cold_start_enqueues_a_spawn_job() {
        let mut rig = rig();
        let out = rig.lifecycle.start(start_req("bob"), "1.1.1.1").await.unwrap();
        assert_eq!(out.session.status, SessionStatus::Starting);

        let job = rig.rx.try_recv().unwrap();
        assert_eq!(job.session_id, out.session.id);
        assert!(!job.prewarm);
        assert_eq!(out.session.spawn_job_id.as_deref(), Some(job.job_id.as_str()));

        // The config snapshot is keyed by the session id.
        let snap = rig.store.get_config(&out.session.id).await.unwrap().unwrap();
        assert_eq!(snap.voice_id, "Olivia");
    }

    #[tokio::test]
    async fn same_identity_reuses_the_live_session() {
        let rig = rig();
        let first = rig
            .lifecycle
            .start(
                StartRequest {
                    voice_id: Some("Craig".into()),
                    ..start_req("carol")
                },
                "1.1.1.1",
            )
            .await
            .unwrap();

        // Different requested voice, same identity: idempotency wins,
        // same session comes back and its config is untouched.
        let second = rig
            .lifecycle
            .start(
                StartRequest {
                    voice_id: Some("Olivia".into()),
                    ..start_req("carol")
                },
                "1.1.1.1",
            )
            .await
            .unwrap();

        assert_eq!(first.session.id, second.session.id);
        let snap = rig.store.get_config(&first.session.id).await.unwrap().unwrap();
        assert_eq!(snap.voice_id, "Craig");
    }

    #[tokio::test]
    async fn non_default_voice_bypasses_the_pool() {
        let rig = rig();
        preload_pool(&rig.store, "P1").await;

        let out = rig
            .lifecycle
            .start(
                StartRequest {
                    voice_id: Some("Craig".into()),
                    ..start_req("dave")
                },
                "1.1.1.1",
            )
            .await
            .unwrap();

        assert_ne!(out.session.id, "P1");
        assert_eq!(out.session.status, SessionStatus::Starting);
        // The pool agent is untouched.
        assert_eq!(rig.store.index_size(keys::INDEX_POOL_READY).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn capacity_gate_rejects_when_full() {
        let mut config = sb_domain::config::Config::default();
        config.agent.max_bots = 1;
        let rig = rig_with(config, 16);
        preload_pool(&rig.store, "P1").await;
        rig.store.add_to_index(keys::INDEX_READY, "busy").await.unwrap();

        let err = rig.lifecycle.start(start_req("eve"), "1.1.1.1").await.unwrap_err();
        assert!(matches!(err, Error::AtCapacity(_)));
    }

    #[tokio::test]
    async fn rate_limit_rejects_after_window_max() {
        let mut config = sb_domain::config::Config::default();
        config.server.rate_limit.max_requests = 2;
        let rig = rig_with(config, 16);

        rig.lifecycle.start(start_req("u1"), "9.9.9.9").await.unwrap();
        rig.lifecycle.start(start_req("u2"), "9.9.9.9").await.unwrap();
        let err = rig.lifecycle.start(start_req("u3"), "9.9.9.9").await.unwrap_err();
        assert!(matches!(err, Error::RateLimited));

        // A different IP is unaffected.
        rig.lifecycle.start(start_req("u4"), "8.8.8.8").await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_backs_out_cleanly() {
        let rig = rig_with(sb_domain::config::Config::default(), 1);
        // Occupy the only queue slot.
        rig.lifecycle.start(start_req("first"), "1.1.1.1").await.unwrap();

        let err = rig.lifecycle.start(start_req("second"), "1.1.1.1").await.unwrap_err();
        assert!(matches!(err, Error::AtCapacity(_)));

        // The failed attempt left nothing behind.
        assert!(rig.store.get_user_session("second").await.unwrap().is_none());
        assert_eq!(rig.store.index_size(keys::INDEX_STARTING).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn end_unknown_session_is_not_found() {
        let rig = rig();
        let err = rig.lifecycle.end("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn end_after_start_removes_everything() {
        let rig = rig();
        preload_pool(&rig.store, "P1").await;
        let out = rig.lifecycle.start(start_req("alice"), "1.1.1.1").await.unwrap();

        let report = rig.lifecycle.end(&out.session.id).await.unwrap();
        assert_eq!(report.state_deleted, StepOutcome::Done);
        assert!(rig.store.get_session("P1").await.unwrap().is_none());
        assert!(rig.store.get_user_session("alice").await.unwrap().is_none());

        // The identity can start again and gets a fresh session.
        let again = rig.lifecycle.start(start_req("alice"), "1.1.1.1").await.unwrap();
        assert_ne!(again.session.id, "P1");
    }

    #[tokio::test]
    async fn participant_joined_marks_active_once() {
        let rig = rig();
        preload_pool(&rig.store, "P1").await;
        rig.lifecycle.start(start_req("alice"), "1.1.1.1").await.unwrap();

        let event = MediaEvent {
            event: "participant_joined".into(),
            room: Some(RoomRef { name: "P1".into() }),
            participant: Some(ParticipantRef {
                identity: "alice".into(),
            }),
        };
        rig.lifecycle.handle_media_event(&event).await.unwrap();

        let s = rig.store.get_session("P1").await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        let started = s.conversation_start_at.unwrap();

        // Replay does not move the start timestamp.
        rig.lifecycle.handle_media_event(&event).await.unwrap();
        let s = rig.store.get_session("P1").await.unwrap().unwrap();
        assert_eq!(s.conversation_start_at, Some(started));
    }

    #[tokio::test]
    async fn agent_join_does_not_start_the_conversation() {
        let rig = rig();
        preload_pool(&rig.store, "P1").await;
        rig.lifecycle.start(start_req("alice"), "1.1.1.1").await.unwrap();

        let event = MediaEvent {
            event: "participant_joined".into(),
            room: Some(RoomRef { name: "P1".into() }),
            participant: Some(ParticipantRef {
                identity: "agent-P1".into(),
            }),
        };
        rig.lifecycle.handle_media_event(&event).await.unwrap();

        let s = rig.store.get_session("P1").await.unwrap().unwrap();
        assert!(s.conversation_start_at.is_none());
        assert_eq!(s.status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn duplicate_disconnect_webhooks_are_one_cleanup() {
        let rig = rig();
        preload_pool(&rig.store, "P1").await;
        rig.lifecycle.start(start_req("alice"), "1.1.1.1").await.unwrap();

        let event = MediaEvent {
            event: "participant_left".into(),
            room: Some(RoomRef { name: "P1".into() }),
            participant: None,
        };
        rig.lifecycle.handle_media_event(&event).await.unwrap();
        assert!(rig.store.get_session("P1").await.unwrap().is_none());

        // Replay: already gone, still Ok.
        rig.lifecycle.handle_media_event(&event).await.unwrap();

        // Unknown rooms are Ok too.
        let stranger = MediaEvent {
            event: "room_finished".into(),
            room: Some(RoomRef {
                name: "never-existed".into(),
            }),
            participant: None,
        };
        rig.lifecycle.handle_media_event(&stranger).await.unwrap();
    }
}
