//! Spawn Worker — executes queued spawn jobs against the Supervisor.
//!
//! Jobs flow through one bounded in-memory queue consumed by a
//! dispatcher that fans out to at most `spawn_concurrency` concurrent
//! spawns. Queue overflow surfaces as `AtCapacity` at enqueue time; the
//! API never blocks on a full queue. Queued jobs are *not* durable: an
//! orchestrator restart drops them and callers retry.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Semaphore;

use sb_domain::config::Config;
use sb_domain::{ConfigSnapshot, Error, Result};
use sb_store::StateStore;
use sb_supervisor::{AgentCommand, AgentHandle, ExitInfo, Supervisor};

use crate::runtime::registry::SessionRegistry;

/// Markers meaning the agent pipeline finished initialising. Sufficient
/// for readiness in both spawn modes.
const INIT_MARKERS: &[&str] = &[
    "Pipeline started",
    "LiveKit transport created",
    "Inworld TTS service initialized",
];

/// Markers meaning a participant connected. Only meaningful for direct
/// spawns — pool agents have no joiner, so waiting on these would
/// always time out.
const JOIN_MARKERS: &[&str] = &[
    "Connected to",
    "Room joined",
    "Participant joined",
];

/// Transient launch failures are retried up to this many attempts.
const MAX_LAUNCH_ATTEMPTS: u32 = 3;

/// Cadence of the mid-spawn cancellation check (session removed while
/// still `starting`).
const CANCEL_CHECK_SECS: u64 = 5;

/// Does this output line prove readiness for the given spawn mode?
pub fn is_ready_marker(line: &str, prewarm: bool) -> bool {
    if INIT_MARKERS.iter().any(|m| line.contains(m)) {
        return true;
    }
    !prewarm && JOIN_MARKERS.iter().any(|m| line.contains(m))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SpawnJob {
    pub session_id: String,
    pub job_id: String,
    pub prewarm: bool,
}

impl SpawnJob {
    pub fn new(session_id: impl Into<String>, prewarm: bool) -> Self {
        Self {
            session_id: session_id.into(),
            job_id: uuid::Uuid::new_v4().to_string(),
            prewarm,
        }
    }
}

/// Cloneable producer half of the bounded spawn queue.
#[derive(Clone)]
pub struct SpawnQueue {
    tx: mpsc::Sender<SpawnJob>,
}

impl SpawnQueue {
    /// A fresh bounded queue. The receiver half goes to the dispatcher
    /// (or to a test harness standing in for it).
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<SpawnJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Non-blocking enqueue. A full queue is an `AtCapacity` error, not
    /// a wait — backpressure reaches the caller immediately.
    pub fn enqueue(&self, job: SpawnJob) -> Result<()> {
        self.tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => Error::AtCapacity("spawn queue is full".into()),
            TrySendError::Closed(_) => Error::Internal("spawn queue closed".into()),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SpawnWorker {
    store: Arc<dyn StateStore>,
    registry: Arc<SessionRegistry>,
    supervisor: Arc<Supervisor>,
    config: Arc<Config>,
}

enum WaitOutcome {
    Ready,
    Timeout,
    Exited(ExitInfo),
    /// The session vanished from the store mid-spawn (removed while
    /// `starting`) — abort and kill the half-started agent.
    Cancelled,
}

impl SpawnWorker {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<SessionRegistry>,
        supervisor: Arc<Supervisor>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            registry,
            supervisor,
            config,
        }
    }

    /// Start the dispatcher: receives queued jobs and runs each in its
    /// own task, gated by a semaphore of `spawn_concurrency` permits.
    pub fn start(worker: Arc<SpawnWorker>) -> SpawnQueue {
        let (queue, mut rx) = SpawnQueue::bounded(worker.config.agent.max_queue());
        let semaphore = Arc::new(Semaphore::new(worker.config.agent.spawn_concurrency));

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let worker = worker.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    worker.run(job).await;
                });
            }
        });

        queue
    }

    /// Execute one spawn job end to end.
    pub async fn run(&self, job: SpawnJob) {
        tracing::info!(
            session_id = %job.session_id,
            job_id = %job.job_id,
            prewarm = job.prewarm,
            "spawn job started"
        );

        // The effective configuration is the snapshot keyed by session
        // id — never a user-level preference that a concurrent session
        // could have overwritten since.
        let snapshot = match self.store.get_config(&job.session_id).await {
            Ok(Some(s)) => s,
            Ok(None) => ConfigSnapshot {
                voice_id: self.config.agent.default_voice_id.clone(),
                opening_line: None,
                system_prompt: None,
            },
            Err(e) => {
                let _ = self
                    .registry
                    .mark_error(&job.session_id, &format!("config snapshot unavailable: {e}"))
                    .await;
                return;
            }
        };

        let handle = match self.launch_with_retries(&job, &snapshot).await {
            Ok(h) => h,
            Err(e) => {
                let _ = self
                    .registry
                    .mark_error(&job.session_id, &format!("failed to launch agent: {e}"))
                    .await;
                return;
            }
        };

        // Load-bearing ordering: the pid/pgid must be visible to any
        // observer before we start waiting for readiness, so a cleanup
        // racing this spawn can still locate and kill the group.
        if let Err(e) = self
            .registry
            .attach_process(&job.session_id, handle.clone())
            .await
        {
            tracing::warn!(session_id = %job.session_id, error = %e, "attach failed, terminating");
            let _ = handle.terminate(self.terminate_grace()).await;
            let _ = self
                .registry
                .mark_error(&job.session_id, &format!("failed to record agent pid: {e}"))
                .await;
            return;
        }

        match self.wait_for_readiness(&job, &handle).await {
            WaitOutcome::Ready => {
                match self.registry.mark_ready(&job.session_id, job.prewarm).await {
                    Ok(()) => {
                        if job.prewarm {
                            let _ = self.store.incr_pool_stat("total_spawned").await;
                        }
                    }
                    Err(e) => {
                        // Session was torn down while we were marking it.
                        tracing::warn!(session_id = %job.session_id, error = %e, "mark_ready failed");
                        let _ = handle.terminate(self.terminate_grace()).await;
                    }
                }
            }
            WaitOutcome::Timeout => {
                let _ = handle.terminate(self.terminate_grace()).await;
                let _ = self.registry.mark_error(&job.session_id, "startup timeout").await;
            }
            WaitOutcome::Exited(info) => {
                let _ = self
                    .registry
                    .mark_error(
                        &job.session_id,
                        &format!("agent exited prematurely: {info}"),
                    )
                    .await;
            }
            WaitOutcome::Cancelled => {
                tracing::info!(session_id = %job.session_id, "spawn cancelled, terminating agent");
                let _ = handle.terminate(self.terminate_grace()).await;
            }
        }
    }

    /// Launch, retrying transient failures with exponential backoff and
    /// jitter. Configuration-shaped failures (missing binary, missing
    /// secret) are not retried.
    async fn launch_with_retries(
        &self,
        job: &SpawnJob,
        snapshot: &ConfigSnapshot,
    ) -> Result<AgentHandle> {
        let command = self.agent_command(job, snapshot)?;
        let mut attempt = 0u32;
        loop {
            match self.supervisor.launch(command.clone()) {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_LAUNCH_ATTEMPTS || !is_transient(&e) {
                        return Err(e);
                    }
                    let backoff = backoff_with_jitter(attempt);
                    tracing::warn!(
                        session_id = %job.session_id,
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient launch failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Consume agent output until a readiness marker, the startup
    /// deadline, a premature exit, or a mid-spawn cancellation. The
    /// watcher detaches on return; the supervisor's pump keeps draining
    /// the pipe into the ring log either way.
    async fn wait_for_readiness(&self, job: &SpawnJob, handle: &AgentHandle) -> WaitOutcome {
        let startup = Duration::from_secs(self.config.agent.startup_timeout_secs);
        let mut output = handle.take_output();

        let exited = handle.wait_exited(startup);
        tokio::pin!(exited);

        let mut cancel_check = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(CANCEL_CHECK_SECS),
            Duration::from_secs(CANCEL_CHECK_SECS),
        );
        cancel_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                line = output.recv() => {
                    match line {
                        Ok(l) if is_ready_marker(&l.line, job.prewarm) => return WaitOutcome::Ready,
                        // Lagged watchers just pick up at the current
                        // position; the timeout still bounds the spawn.
                        Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            // Pump gone; exit/deadline branches decide.
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                info = &mut exited => {
                    return match info {
                        Some(info) => WaitOutcome::Exited(info),
                        // wait_exited's own timeout equals the startup
                        // deadline, so `None` means the deadline hit.
                        None => WaitOutcome::Timeout,
                    };
                }
                _ = cancel_check.tick() => {
                    match self.store.get_session(&job.session_id).await {
                        Ok(None) => return WaitOutcome::Cancelled,
                        Ok(Some(s)) if s.status.is_terminal() => return WaitOutcome::Cancelled,
                        _ => {}
                    }
                }
            }
        }
    }

    /// Build the launch description: per-session configuration on the
    /// command line, secrets and URLs in the environment.
    fn agent_command(&self, job: &SpawnJob, snapshot: &ConfigSnapshot) -> Result<AgentCommand> {
        let agent = &self.config.agent;
        let media = &self.config.media;

        let mut cmd = AgentCommand::new(&job.session_id, &agent.launch_path)
            .args(agent.launch_args.clone())
            .arg("--session-id")
            .arg(&job.session_id)
            .arg("--identity")
            .arg(format!("agent-{}", job.session_id))
            .arg("--voice-id")
            .arg(&snapshot.voice_id);
        if let Some(ref line) = snapshot.opening_line {
            cmd = cmd.arg("--opening-line").arg(line);
        }
        if let Some(ref prompt) = snapshot.system_prompt {
            cmd = cmd.arg("--system-prompt").arg(prompt);
        }

        cmd = cmd
            .env("LIVEKIT_URL", media.effective_server_url())
            .env("LIVEKIT_API_KEY", media.api_key()?)
            .env("LIVEKIT_API_SECRET", media.api_secret()?)
            .env("STORE_URL", self.config.store.effective_url());
        if let Some(ref dir) = agent.workdir {
            cmd = cmd.workdir(dir);
        }
        Ok(cmd)
    }

    fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.config.agent.terminate_grace_secs)
    }
}

/// IO failures other than "the binary does not exist / is not runnable"
/// are worth a retry.
fn is_transient(e: &Error) -> bool {
    match e {
        Error::Io(io) => !matches!(
            io.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
        ),
        _ => false,
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 500u64 * 2u64.saturating_pow(attempt - 1);
    let jitter = rand::rng().random_range(0..250);
    Duration::from_millis(base + jitter)
}
