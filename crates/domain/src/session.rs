//! The session record — one per voice conversation.
//!
//! A session is created on `POST /session/start` (or by the pool refill
//! sweep), mirrors through the shared state store, and is deleted together
//! with its index memberships on any termination path. The record is the
//! durable half of the pair; the OS process group is the live half.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session lifecycle states.
///
/// `Ended` is terminal and represented by *absence* of the record in the
/// store; `Error` is a brief intermediate that is reported once and then
/// collapses to `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Ready,
    Active,
    Error,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Ready => "ready",
            SessionStatus::Active => "active",
            SessionStatus::Error => "error",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(SessionStatus::Starting),
            "ready" => Some(SessionStatus::Ready),
            "active" => Some(SessionStatus::Active),
            "error" => Some(SessionStatus::Error),
            "ended" => Some(SessionStatus::Ended),
            _ => None,
        }
    }

    /// A session in a terminal state no longer counts against capacity
    /// or the per-user single-session invariant.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Error | SessionStatus::Ended)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable session state, mirrored into the shared store as a hash.
///
/// `agent_pid` / `agent_pgid` are recorded together, before any readiness
/// detection, and `pgid == pid` always (the agent is launched as its own
/// process-group leader). The pid is only meaningful on the host that
/// spawned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique id; also the media room name.
    pub id: String,
    /// Caller identity. Empty while the session sits in the pre-warm pool.
    #[serde(default)]
    pub user_identity: String,
    pub voice_id: String,
    #[serde(default)]
    pub opening_line: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Reference to the in-flight spawn job, if any.
    #[serde(default)]
    pub spawn_job_id: Option<String>,
    #[serde(default)]
    pub agent_pid: Option<i32>,
    #[serde(default)]
    pub agent_pgid: Option<i32>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// First media participant join, set once by the disconnect webhook
    /// handler. Billing duration is measured from here.
    #[serde(default)]
    pub conversation_start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Was this session born into the pool rather than for a caller.
    #[serde(default)]
    pub prewarmed: bool,
}

impl Session {
    /// New session for a specific caller, entering `starting`.
    pub fn new(id: impl Into<String>, user_identity: impl Into<String>, snapshot: ConfigSnapshot) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_identity: user_identity.into(),
            voice_id: snapshot.voice_id,
            opening_line: snapshot.opening_line,
            system_prompt: snapshot.system_prompt,
            spawn_job_id: None,
            agent_pid: None,
            agent_pgid: None,
            status: SessionStatus::Starting,
            created_at: now,
            last_active_at: now,
            conversation_start_at: None,
            duration_seconds: None,
            error_message: None,
            prewarmed: false,
        }
    }

    /// New pool-resident session: no caller yet, default configuration.
    pub fn prewarmed(id: impl Into<String>, snapshot: ConfigSnapshot) -> Self {
        let mut s = Self::new(id, "", snapshot);
        s.prewarmed = true;
        s
    }

    /// Record the agent's pid. The agent is its own group leader, so the
    /// pgid is the pid.
    pub fn attach_process(&mut self, pid: i32) {
        self.agent_pid = Some(pid);
        self.agent_pgid = Some(pid);
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    /// Seconds of conversation so far; zero if no participant ever joined.
    pub fn elapsed_conversation_seconds(&self, now: DateTime<Utc>) -> u64 {
        match self.conversation_start_at {
            Some(start) => now.signed_duration_since(start).num_seconds().max(0) as u64,
            None => 0,
        }
    }
}

/// Agent configuration captured at session creation and never mutated
/// after spawn. Keyed by session id in the store — never by user
/// identity, so concurrent sessions of one user cannot stomp each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub voice_id: String,
    #[serde(default)]
    pub opening_line: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Ceiling division used for billed minutes: 61 seconds bills as 2.
pub fn duration_minutes(duration_seconds: u64) -> u64 {
    duration_seconds.div_ceil(60)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cleanup report
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of one teardown step. Failures are reported, never thrown —
/// cleanup always runs to the end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "lowercase")]
pub enum StepOutcome {
    Done,
    /// Nothing to do (e.g. no process was ever attached).
    Skipped,
    Failed(String),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

/// Structured result of `Registry::remove`, enumerating per-step
/// outcomes so a caller can distinguish "gone" from "partially gone".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub session_id: String,
    /// Why the session was removed (api, disconnect, idle, process died).
    pub reason: String,
    /// True when another caller already completed this teardown; all
    /// steps below are `Skipped` in that case.
    pub already_removed: bool,
    pub marked_ended: StepOutcome,
    pub process_terminated: StepOutcome,
    pub state_deleted: StepOutcome,
    pub duration_seconds: u64,
}

impl CleanupReport {
    /// Report for a teardown that found nothing left to do.
    pub fn already_removed(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            reason: reason.into(),
            already_removed: true,
            marked_ended: StepOutcome::Skipped,
            process_terminated: StepOutcome::Skipped,
            state_deleted: StepOutcome::Skipped,
            duration_seconds: 0,
        }
    }

    pub fn fully_clean(&self) -> bool {
        !self.marked_ended.is_failed()
            && !self.process_terminated.is_failed()
            && !self.state_deleted.is_failed()
    }
}
