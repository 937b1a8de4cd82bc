//! Session ⇄ hash-field conversion.
//!
//! Records are stored as string-valued hashes so individual fields can be
//! patched atomically. Absent optional fields are simply not written.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use sb_domain::{Session, SessionStatus};

/// Field names of the record hash. Patches reference these.
pub mod fields {
    pub const ID: &str = "id";
    pub const USER_IDENTITY: &str = "user_identity";
    pub const VOICE_ID: &str = "voice_id";
    pub const OPENING_LINE: &str = "opening_line";
    pub const SYSTEM_PROMPT: &str = "system_prompt";
    pub const SPAWN_JOB_ID: &str = "spawn_job_id";
    pub const AGENT_PID: &str = "agent_pid";
    pub const AGENT_PGID: &str = "agent_pgid";
    pub const STATUS: &str = "status";
    pub const CREATED_AT: &str = "created_at";
    pub const LAST_ACTIVE_AT: &str = "last_active_at";
    pub const CONVERSATION_START_AT: &str = "conversation_start_at";
    pub const DURATION_SECONDS: &str = "duration_seconds";
    pub const ERROR_MESSAGE: &str = "error_message";
    pub const PREWARMED: &str = "prewarmed";
}

pub fn timestamp_to_string(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Flatten a record into hash fields. `None` fields are omitted.
pub fn to_fields(s: &Session) -> Vec<(String, String)> {
    let mut out = vec![
        (fields::ID.into(), s.id.clone()),
        (fields::USER_IDENTITY.into(), s.user_identity.clone()),
        (fields::VOICE_ID.into(), s.voice_id.clone()),
        (fields::STATUS.into(), s.status.as_str().into()),
        (fields::CREATED_AT.into(), timestamp_to_string(s.created_at)),
        (fields::LAST_ACTIVE_AT.into(), timestamp_to_string(s.last_active_at)),
        (fields::PREWARMED.into(), s.prewarmed.to_string()),
    ];
    if let Some(ref v) = s.opening_line {
        out.push((fields::OPENING_LINE.into(), v.clone()));
    }
    if let Some(ref v) = s.system_prompt {
        out.push((fields::SYSTEM_PROMPT.into(), v.clone()));
    }
    if let Some(ref v) = s.spawn_job_id {
        out.push((fields::SPAWN_JOB_ID.into(), v.clone()));
    }
    if let Some(pid) = s.agent_pid {
        out.push((fields::AGENT_PID.into(), pid.to_string()));
    }
    if let Some(pgid) = s.agent_pgid {
        out.push((fields::AGENT_PGID.into(), pgid.to_string()));
    }
    if let Some(ts) = s.conversation_start_at {
        out.push((fields::CONVERSATION_START_AT.into(), timestamp_to_string(ts)));
    }
    if let Some(d) = s.duration_seconds {
        out.push((fields::DURATION_SECONDS.into(), d.to_string()));
    }
    if let Some(ref m) = s.error_message {
        out.push((fields::ERROR_MESSAGE.into(), m.clone()));
    }
    out
}

/// Rebuild a record from hash fields. Returns `None` for an empty or
/// structurally broken hash (missing id/status) rather than guessing.
pub fn from_fields(map: &HashMap<String, String>) -> Option<Session> {
    let id = map.get(fields::ID)?.clone();
    let status = SessionStatus::parse(map.get(fields::STATUS)?)?;
    let created_at = parse_timestamp(map.get(fields::CREATED_AT)?)?;
    let last_active_at = map
        .get(fields::LAST_ACTIVE_AT)
        .and_then(|s| parse_timestamp(s))
        .unwrap_or(created_at);

    Some(Session {
        id,
        user_identity: map.get(fields::USER_IDENTITY).cloned().unwrap_or_default(),
        voice_id: map.get(fields::VOICE_ID).cloned().unwrap_or_default(),
        opening_line: map.get(fields::OPENING_LINE).cloned(),
        system_prompt: map.get(fields::SYSTEM_PROMPT).cloned(),
        spawn_job_id: map.get(fields::SPAWN_JOB_ID).cloned(),
        agent_pid: map.get(fields::AGENT_PID).and_then(|v| v.parse().ok()),
        agent_pgid: map.get(fields::AGENT_PGID).and_then(|v| v.parse().ok()),
        status,
        created_at,
        last_active_at,
        conversation_start_at: map
            .get(fields::CONVERSATION_START_AT)
            .and_then(|s| parse_timestamp(s)),
        duration_seconds: map.get(fields::DURATION_SECONDS).and_then(|v| v.parse().ok()),
        error_message: map.get(fields::ERROR_MESSAGE).cloned(),
        prewarmed: map
            .get(fields::PREWARMED)
            .map(|v| v == "true")
            .unwrap_or(false),
    })
}
