//! Health probe.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use sb_store::{keys, StateStore};

use crate::state::AppState;

/// `GET /health` — store connectivity, session counts, capacity.
/// Degrades to 503 when the store is unreachable: the orchestrator
/// cannot start or end sessions without it.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store_connected = state.store.ping().await.is_ok();

    let (ready, starting, pool) = if store_connected {
        (
            state.store.index_size(keys::INDEX_READY).await.unwrap_or(0),
            state.store.index_size(keys::INDEX_STARTING).await.unwrap_or(0),
            state.store.index_size(keys::INDEX_POOL_READY).await.unwrap_or(0),
        )
    } else {
        (0, 0, 0)
    };

    let status = if store_connected { "ok" } else { "degraded" };
    let body = Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "storeConnected": store_connected,
        "sessions": {
            "ready": ready,
            "starting": starting,
            "pool": pool,
        },
        "capacity": {
            "maxBots": state.config.agent.max_bots,
            "inUse": ready + starting,
        },
    }));

    if store_connected {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}
