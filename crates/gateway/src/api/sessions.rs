//! Session endpoints.
//!
//! - `POST /session/start`     — begin (or rejoin) a voice session
//! - `POST /session/end`       — terminate a session
//! - `GET  /session/:id`       — status projection for pollers
//! - `GET  /session/:id/logs`  — recent agent output (debugging)

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use sb_domain::{duration_minutes, SessionStatus};
use sb_store::StateStore;

use super::ApiError;
use crate::runtime::lifecycle::StartRequest;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBody {
    pub user_name: String,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub opening_line: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Opaque correlation value echoed back to the caller.
    #[serde(default)]
    pub correlation_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    session_id: String,
    token: String,
    server_url: String,
    room_name: String,
    status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndBody {
    pub session_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /session/start
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn start(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<StartBody>,
) -> Result<Response, ApiError> {
    if body.user_name.trim().is_empty() {
        return Ok((
            axum::http::StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "userName is required" })),
        )
            .into_response());
    }

    let ip = client_ip(&headers, connect_info.as_deref());
    let outcome = state
        .lifecycle
        .start(
            StartRequest {
                user_identity: body.user_name,
                voice_id: body.voice_id,
                opening_line: body.opening_line,
                system_prompt: body.system_prompt,
            },
            &ip,
        )
        .await?;

    Ok(Json(StartResponse {
        room_name: outcome.session.id.clone(),
        session_id: outcome.session.id,
        token: outcome.token,
        server_url: state.config.media.effective_server_url(),
        status: outcome.session.status,
        correlation_token: body.correlation_token,
    })
    .into_response())
}

/// Rate-limit key for the caller: proxy header first, socket peer as
/// the fallback (tests drive the router without a socket).
fn client_ip(headers: &HeaderMap, connect_info: Option<&SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    connect_info
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /session/end
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn end(
    State(state): State<AppState>,
    Json(body): Json<EndBody>,
) -> Result<Response, ApiError> {
    let report = state.lifecycle.end(&body.session_id).await?;
    let duration_seconds = report.duration_seconds;

    Ok(Json(serde_json::json!({
        "cleanupReport": report,
        "durationSeconds": duration_seconds,
        "durationMinutes": duration_minutes(duration_seconds),
    }))
    .into_response())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /session/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .store
        .get_session(&id)
        .await
        .map_err(sb_domain::Error::from)?
        .ok_or(sb_domain::Error::NotFound(id))?;

    // Seconds from creation to the agent being usable: readiness for
    // sessions still waiting on a caller, first join once active.
    let startup_anchor = session
        .conversation_start_at
        .unwrap_or(session.last_active_at);
    let startup_time_seconds = match session.status {
        SessionStatus::Ready | SessionStatus::Active => Some(
            startup_anchor
                .signed_duration_since(session.created_at)
                .num_seconds()
                .max(0),
        ),
        _ => None,
    };

    Ok(Json(serde_json::json!({
        "sessionId": session.id,
        "status": session.status,
        "voiceId": session.voice_id,
        "prewarmed": session.prewarmed,
        "createdAt": session.created_at.to_rfc3339(),
        "lastActiveAt": session.last_active_at.to_rfc3339(),
        "conversationStartAt": session.conversation_start_at.map(|t| t.to_rfc3339()),
        "startupTimeSeconds": startup_time_seconds,
        "error": session.error_message,
    }))
    .into_response())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /session/:id/logs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    // Live ring log first; the store mirror covers agents this
    // orchestrator did not spawn (or errored records past teardown).
    let mut lines = state.supervisor.ring_logs().recent(&id);
    if lines.is_empty() {
        lines = state
            .store
            .recent_logs(&id)
            .await
            .map_err(sb_domain::Error::from)?;
    }

    if lines.is_empty()
        && state
            .store
            .get_session(&id)
            .await
            .map_err(sb_domain::Error::from)?
            .is_none()
    {
        return Err(ApiError(sb_domain::Error::NotFound(id)));
    }

    Ok(Json(serde_json::json!({
        "sessionId": id,
        "lines": lines,
    }))
    .into_response())
}
