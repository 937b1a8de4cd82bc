//! Room-join token issuer.
//!
//! Pure function over process-level signing configuration: mints a
//! LiveKit-shaped HS256 JWT granting exactly one capability set — join
//! the named room, publish audio, subscribe. No service state, no
//! retries.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use sb_domain::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

/// Room capabilities embedded in the token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// API key of the issuing deployment.
    pub iss: String,
    /// Participant identity.
    pub sub: String,
    pub jti: String,
    pub nbf: i64,
    pub exp: i64,
    pub video: VideoGrant,
}

pub struct TokenIssuer {
    api_key: String,
    api_secret: String,
    ttl_secs: u64,
}

impl TokenIssuer {
    pub fn new(api_key: String, api_secret: String, ttl_secs: u64) -> Self {
        Self {
            api_key,
            api_secret,
            ttl_secs,
        }
    }

    /// Mint a join token for `(room, identity)`.
    pub fn mint(&self, room: &str, identity: &str) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: self.api_key.clone(),
            sub: identity.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            nbf: now,
            exp: now + self.ttl_secs as i64,
            video: VideoGrant {
                room: room.to_string(),
                room_join: true,
                can_publish: true,
                can_subscribe: true,
            },
        };

        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Header {
            alg: "HS256",
            typ: "JWT",
        })?);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{header}.{payload}");

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| Error::Token(e.to_string()))?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }

    /// Verify a token's signature and decode its claims. Used by tests
    /// and diagnostics; the media server is the real consumer.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut parts = token.splitn(3, '.');
        let (Some(header), Some(payload), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Token("malformed token".into()));
        };

        let signing_input = format!("{header}.{payload}");
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| Error::Token(e.to_string()))?;
        mac.update(signing_input.as_bytes());
        let expected = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        if expected != signature {
            return Err(Error::Token("signature mismatch".into()));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| Error::Token(e.to_string()))?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("api-key-1".into(), "super-secret".into(), 7200)
    }

    #[test]
    fn minted_token_verifies_and_carries_the_grant() {
        let issuer = issuer();
        let token = issuer.mint("room-42", "alice").unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.iss, "api-key-1");
        assert_eq!(claims.sub, "alice");
        assert_eq!(
            claims.video,
            VideoGrant {
                room: "room-42".into(),
                room_join: true,
                can_publish: true,
                can_subscribe: true,
            }
        );
        assert_eq!(claims.exp - claims.nbf, 7200);
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let token = issuer().mint("room-42", "alice").unwrap();
        let other = TokenIssuer::new("api-key-1".into(), "different".into(), 7200);
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let issuer = issuer();
        let token = issuer.mint("room-42", "alice").unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"sub":"mallory"}"#);
        parts[1] = &forged;
        assert!(issuer.verify(&parts.join(".")).is_err());
    }
}
