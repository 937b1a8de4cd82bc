//! Inbound media-server webhook.
//!
//! `POST /webhook/media` carries room lifecycle events signed with
//! HMAC-SHA256 over the raw body (`X-Media-Signature: <hex>`, a
//! `sha256=` prefix is tolerated). Verification is constant-time.
//! Duplicate deliveries are normal and must answer 200.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::ApiError;
use crate::runtime::lifecycle::MediaEvent;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-media-signature";

pub async fn media_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match (&state.webhook_secret, signature) {
        (Some(secret), Some(sig)) => {
            if !verify_signature(secret.as_bytes(), &body, sig) {
                return Err(ApiError(sb_domain::Error::SignatureInvalid));
            }
        }
        (Some(_), None) => {
            // Unsigned delivery with a secret configured: only allowed
            // when development mode explicitly opted in.
            if !state.config.media.webhook.allow_unsigned {
                return Err(ApiError(sb_domain::Error::SignatureInvalid));
            }
        }
        // No secret configured (development): nothing to verify.
        (None, _) => {}
    }

    let event: MediaEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("bad webhook payload: {e}") })),
            )
                .into_response());
        }
    };

    state.lifecycle.handle_media_event(&event).await?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "event": event.event,
    }))
    .into_response())
}

/// HMAC-SHA256 over the raw body, hex-encoded, compared in constant
/// time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let sig_hex = signature.strip_prefix("sha256=").unwrap_or(signature);

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    let computed = hex::encode(mac.finalize().into_bytes());

    computed.as_bytes().ct_eq(sig_hex.as_bytes()).unwrap_u8() == 1
}

/// Hex signature for a payload — used by tests and by operators
/// verifying their webhook configuration.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"event":"participant_left"}"#;
        let sig = sign(b"shh", body);
        assert!(verify_signature(b"shh", body, &sig));
        // GitHub-style prefix is tolerated.
        assert!(verify_signature(b"shh", body, &format!("sha256={sig}")));
    }

    #[test]
    fn wrong_secret_or_body_fails() {
        let body = br#"{"event":"participant_left"}"#;
        let sig = sign(b"shh", body);
        assert!(!verify_signature(b"other", body, &sig));
        assert!(!verify_signature(b"shh", b"tampered", &sig));
        assert!(!verify_signature(b"shh", body, "deadbeef"));
        assert!(!verify_signature(b"shh", body, ""));
    }
}
