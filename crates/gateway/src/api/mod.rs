pub mod health;
pub mod sessions;
pub mod webhook;

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full API router. No auth middleware here: the public API
/// is assumed to sit behind an upstream authenticator; the webhook
/// authenticates itself with an HMAC signature.
pub fn router(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    Router::new()
        .route("/session/start", post(sessions::start))
        .route("/session/end", post(sessions::end))
        .route("/session/:id", get(sessions::get_session))
        .route("/session/:id/logs", get(sessions::get_logs))
        .route("/webhook/media", post(webhook::media_webhook))
        .route("/health", get(health::health))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error-kind → HTTP mapping. Every handler funnels failures through
/// this wrapper so status codes stay consistent with the error design.
pub(crate) struct ApiError(pub sb_domain::Error);

impl From<sb_domain::Error> for ApiError {
    fn from(e: sb_domain::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use sb_domain::Error;

        let (status, body) = match &self.0 {
            Error::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                serde_json::json!({ "error": "rate limited, slow down" }),
            ),
            Error::AtCapacity(detail) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": format!("at capacity: {detail}"), "retryAfterSeconds": 5 }),
            ),
            Error::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": "state store unavailable" }),
            ),
            Error::NotFound(id) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": format!("session not found: {id}") }),
            ),
            Error::SignatureInvalid => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "invalid webhook signature" }),
            ),
            other => {
                tracing::error!(error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": other.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
