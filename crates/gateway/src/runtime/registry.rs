//! Session Registry — the single owner of session state transitions.
//!
//! Every mutation of a given session id runs under that id's lock
//! (`SessionLockMap`), persists through the store adapter, and keeps the
//! in-memory handle map in step with the durable record. Teardown is
//! ordered so a crash at any point leaves a recoverable system:
//!
//! 1. mark the record `ended` (new observers stop using it)
//! 2. signal the process group — graceful, grace window, forceful
//! 3. delete index memberships
//! 4. delete the record and per-session subsidiary keys
//!
//! A signal failure never aborts cleanup; it is folded into the report.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use sb_domain::{CleanupReport, Error, Result, Session, SessionStatus, StepOutcome};
use sb_store::codec::{self, fields};
use sb_store::{keys, StateStore};
use sb_supervisor::{terminate_group, AgentHandle, Supervisor};

use crate::runtime::session_lock::SessionLockMap;

/// How long an errored record stays readable before its TTL reaps it.
const ERROR_RECORD_TTL_SECS: u64 = 300;

/// Completed teardown reports kept for idempotent re-delivery: N `End`
/// calls for one session all receive structurally equal reports.
const REPORT_CACHE_CAP: usize = 1024;

#[derive(Default)]
struct ReportCache {
    by_id: HashMap<String, CleanupReport>,
    order: VecDeque<String>,
}

impl ReportCache {
    fn insert(&mut self, report: CleanupReport) {
        if self.by_id.insert(report.session_id.clone(), report.clone()).is_none() {
            self.order.push_back(report.session_id);
            while self.order.len() > REPORT_CACHE_CAP {
                if let Some(evicted) = self.order.pop_front() {
                    self.by_id.remove(&evicted);
                }
            }
        }
    }

    fn get(&self, id: &str) -> Option<CleanupReport> {
        self.by_id.get(id).cloned()
    }
}

pub struct SessionRegistry {
    store: Arc<dyn StateStore>,
    supervisor: Arc<Supervisor>,
    handles: Mutex<HashMap<String, AgentHandle>>,
    locks: SessionLockMap,
    reports: Mutex<ReportCache>,
    terminate_grace: Duration,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn StateStore>,
        supervisor: Arc<Supervisor>,
        terminate_grace: Duration,
    ) -> Self {
        Self {
            store,
            supervisor,
            handles: Mutex::new(HashMap::new()),
            locks: SessionLockMap::new(),
            reports: Mutex::new(ReportCache::default()),
            terminate_grace,
        }
    }

    pub fn locks(&self) -> &SessionLockMap {
        &self.locks
    }

    /// Persist a freshly created session and index it under `starting`.
    pub async fn create(&self, session: &Session) -> Result<()> {
        self.store.put_session(session).await?;
        self.store.add_to_index(keys::INDEX_STARTING, &session.id).await?;
        tracing::info!(
            session_id = %session.id,
            prewarmed = session.prewarmed,
            voice_id = %session.voice_id,
            "session created"
        );
        Ok(())
    }

    /// Record the agent's pid/pgid — called by the spawn worker
    /// immediately after launch, **before** any readiness wait, so a
    /// teardown racing the spawn can always locate the group.
    pub async fn attach_process(&self, id: &str, handle: AgentHandle) -> Result<()> {
        let pid = handle.pid();
        self.handles.lock().insert(id.to_string(), handle);
        self.store
            .patch_session(
                id,
                &[
                    (fields::AGENT_PID, pid.to_string()),
                    (fields::AGENT_PGID, pid.to_string()),
                ],
            )
            .await?;
        self.store.put_agent_pid(id, pid).await?;
        tracing::debug!(session_id = %id, pid, "agent process attached");
        Ok(())
    }

    pub fn handle_for(&self, id: &str) -> Option<AgentHandle> {
        self.handles.lock().get(id).cloned()
    }

    /// Move a session out of `starting` into `pool-ready` (prewarm) or
    /// `ready` (assigned caller). Index membership is settled before the
    /// status flips, so `status = ready` always implies a visible index
    /// entry and a visible pid.
    pub async fn mark_ready(&self, id: &str, as_pool: bool) -> Result<()> {
        let _permit = self.locks.acquire(id).await;

        if self.store.get_session(id).await?.is_none() {
            return Err(Error::NotFound(id.to_string()));
        }

        let target = if as_pool {
            keys::INDEX_POOL_READY
        } else {
            keys::INDEX_READY
        };
        self.store.add_to_index(target, id).await?;
        self.store.remove_from_index(keys::INDEX_STARTING, id).await?;
        self.store
            .patch_session(
                id,
                &[
                    (fields::STATUS, SessionStatus::Ready.as_str().into()),
                    (fields::LAST_ACTIVE_AT, codec::timestamp_to_string(Utc::now())),
                ],
            )
            .await?;
        tracing::info!(session_id = %id, pool = as_pool, "session ready");
        Ok(())
    }

    /// First media participant joined: set `conversation_start_at` once
    /// and flip to `active`. Later calls only refresh `last_active_at`.
    pub async fn mark_active(&self, id: &str, ts: DateTime<Utc>) -> Result<()> {
        let _permit = self.locks.acquire(id).await;

        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let mut patch = vec![(fields::LAST_ACTIVE_AT, codec::timestamp_to_string(ts))];
        if session.conversation_start_at.is_none() {
            patch.push((fields::CONVERSATION_START_AT, codec::timestamp_to_string(ts)));
            patch.push((fields::STATUS, SessionStatus::Active.as_str().into()));
            tracing::info!(session_id = %id, "conversation started");
        }
        self.store.patch_session(id, &patch).await?;
        Ok(())
    }

    /// Terminal failure before readiness. The process group is killed
    /// and all index/claim state is dropped, but the record itself is
    /// left readable (status `error`, short TTL) so a polling caller
    /// can see what happened before it expires.
    pub async fn mark_error(&self, id: &str, message: &str) -> Result<()> {
        let _permit = self.locks.acquire(id).await;

        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        tracing::warn!(session_id = %id, error = %message, "session errored");
        self.store
            .patch_session(
                id,
                &[
                    (fields::STATUS, SessionStatus::Error.as_str().into()),
                    (fields::ERROR_MESSAGE, message.to_string()),
                ],
            )
            .await?;

        let _ = self.terminate_session_group(id, &session).await;

        for index in [keys::INDEX_STARTING, keys::INDEX_READY, keys::INDEX_POOL_READY] {
            let _ = self.store.remove_from_index(index, id).await;
        }
        if !session.user_identity.is_empty() {
            let _ = self
                .store
                .release_user_session(&session.user_identity, id)
                .await;
        }
        let _ = self.store.expire_session(id, ERROR_RECORD_TTL_SECS).await;

        self.handles.lock().remove(id);
        self.supervisor.ring_logs().remove(id);
        Ok(())
    }

    /// Authoritative teardown. Idempotent: repeat calls return the same
    /// cached report; a race collapses on the per-id lock.
    pub async fn remove(&self, id: &str, reason: &str) -> Result<CleanupReport> {
        let _permit = self.locks.acquire(id).await;

        if let Some(report) = self.reports.lock().get(id) {
            return Ok(report);
        }

        let session = match self.store.get_session(id).await? {
            Some(s) => s,
            None => return Err(Error::NotFound(id.to_string())),
        };

        tracing::info!(session_id = %id, reason, "removing session");

        let now = Utc::now();
        let duration_seconds = session.elapsed_conversation_seconds(now);

        // Step 1: mark ended so new observers stop using the record.
        let marked_ended = match self
            .store
            .patch_session(
                id,
                &[
                    (fields::STATUS, SessionStatus::Ended.as_str().into()),
                    (fields::DURATION_SECONDS, duration_seconds.to_string()),
                ],
            )
            .await
        {
            Ok(()) => StepOutcome::Done,
            Err(e) => StepOutcome::Failed(e.to_string()),
        };

        // Step 2: kill the process group. Never aborts cleanup.
        let process_terminated = self.terminate_session_group(id, &session).await;

        // Steps 3–4: indexes, record, subsidiary keys, user claim.
        let mut delete_errors = self.store.delete_session_and_indexes(id).await;
        if !session.user_identity.is_empty() {
            if let Err(e) = self
                .store
                .release_user_session(&session.user_identity, id)
                .await
            {
                delete_errors.push(format!("release user claim: {e}"));
            }
        }
        let state_deleted = if delete_errors.is_empty() {
            StepOutcome::Done
        } else {
            StepOutcome::Failed(delete_errors.join("; "))
        };

        self.handles.lock().remove(id);
        self.supervisor.ring_logs().remove(id);

        let report = CleanupReport {
            session_id: id.to_string(),
            reason: reason.to_string(),
            already_removed: false,
            marked_ended,
            process_terminated,
            state_deleted,
            duration_seconds,
        };
        self.reports.lock().insert(report.clone());

        if !report.fully_clean() {
            tracing::warn!(session_id = %id, ?report, "cleanup completed with failures");
        }
        Ok(report)
    }

    /// Cached teardown report, if this orchestrator already removed the
    /// session.
    pub fn cached_report(&self, id: &str) -> Option<CleanupReport> {
        self.reports.lock().get(id)
    }

    /// Signal the session's process group: through the live handle when
    /// we own one, else through the pgid persisted in the record (an
    /// agent inherited from a previous orchestrator run).
    async fn terminate_session_group(&self, id: &str, session: &Session) -> StepOutcome {
        let handle = self.handle_for(id);
        match (handle, session.agent_pgid) {
            (Some(handle), _) => match handle.terminate(self.terminate_grace).await {
                Ok(()) => StepOutcome::Done,
                Err(e) => StepOutcome::Failed(e.to_string()),
            },
            (None, Some(pgid)) => match terminate_group(pgid, self.terminate_grace).await {
                Ok(()) => StepOutcome::Done,
                Err(e) => StepOutcome::Failed(e.to_string()),
            },
            // Spawn never got far enough to attach a process.
            (None, None) => StepOutcome::Skipped,
        }
    }
}
