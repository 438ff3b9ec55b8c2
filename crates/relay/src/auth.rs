//! Bearer token verification.
//!
//! Tokens are compact HS256 JWTs: `base64url(header).base64url(claims).base64url(sig)`.
//! Only the checks the relay needs are performed: algorithm, signature and
//! expiry. Issuing tokens is the job of the auth service; [`TokenVerifier::sign`]
//! exists for tooling and tests.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use protocol::UserId;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Why a token was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No bearer token was sent.
    #[error("No token provided")]
    Missing,

    /// The token is not a well-formed JWT.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// The header names an algorithm other than HS256.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The signature does not match.
    #[error("Invalid signature")]
    BadSignature,

    /// The `exp` claim is in the past.
    #[error("Token expired")]
    Expired,

    /// The relay has no secret configured.
    #[error("Token verification is not configured")]
    Disabled,
}

#[derive(Debug, Deserialize, Serialize)]
struct Header {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

/// Claims the relay cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Expiry in seconds since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    /// Claims for `user_id` expiring at `exp`.
    pub fn for_user(user_id: impl Into<String>, exp: i64) -> Self {
        Self {
            sub: None,
            user_id: Some(user_id.into()),
            exp: Some(exp),
        }
    }

    /// The user the token was issued to, preferring `userId` over `sub`.
    pub fn user(&self) -> Option<UserId> {
        self.user_id
            .as_deref()
            .or(self.sub.as_deref())
            .filter(|u| !u.is_empty())
            .map(UserId::from)
    }
}

/// Verifies HS256 tokens against a shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

impl TokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::Disabled)
    }

    /// Verify a token at the current time.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    /// Verify a token as of `now` (seconds since epoch).
    pub fn verify_at(&self, token: &str, now: i64) -> Result<Claims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed("JWT must have 3 parts".into()));
        };
        let signing_input = &token[..header.len() + 1 + payload.len()];

        let header: Header = decode_segment(header)?;
        if header.alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| AuthError::Malformed(format!("signature decode failed: {e}")))?;
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims = decode_segment(payload)?;
        if claims.exp.is_some_and(|exp| exp <= now) {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    /// Produce a signed token for `claims`.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let header = Header {
            alg: "HS256".to_string(),
            typ: Some("JWT".to_string()),
        };
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap_or_default());
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());
        let signing_input = format!("{header}.{payload}");

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(format!("base64 decode failed: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::Malformed(format!("JSON parse failed: {e}")))
}
