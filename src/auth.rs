//! Handshake tokens.
//!
//! The relay identifies a connection by the `id` claim of a compact HS256 JWS
//! signed with a secret shared with the identity service. Only verification
//! happens on the hot path; [`TokenAuthority::issue`] backs the admin tool and
//! the tests.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no token supplied")]
    MissingToken,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("signing secret must not be empty")]
    EmptySecret,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    /// Issued-at, seconds since the UNIX epoch.
    pub iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

#[derive(Deserialize)]
struct JoseHeader {
    alg: String,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Clone)]
pub struct TokenAuthority {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenAuthority(..)")
    }
}

impl TokenAuthority {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, AuthError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        Ok(Self {
            secret: secret.to_vec(),
        })
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::EmptySecret)
    }

    /// Sign a token for `user_id`, valid for `ttl` (forever when `None`).
    pub fn issue(&self, user_id: &str, ttl: Option<Duration>) -> Result<String, AuthError> {
        let iat = now_secs();
        let claims = Claims {
            id: user_id.to_string(),
            iat,
            exp: ttl.map(|ttl| iat + ttl.as_secs()),
        };
        let payload =
            serde_json::to_vec(&claims).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed("expected three segments".into()));
        };

        let header_json = URL_SAFE_NO_PAD
            .decode(header)
            .map_err(|e| AuthError::Malformed(format!("header encoding: {e}")))?;
        let jose: JoseHeader = serde_json::from_slice(&header_json)
            .map_err(|e| AuthError::Malformed(format!("header: {e}")))?;
        if jose.alg != "HS256" {
            return Err(AuthError::Malformed(format!(
                "unsupported algorithm {}",
                jose.alg
            )));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| AuthError::Malformed(format!("signature encoding: {e}")))?;
        let mut mac = self.mac()?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| AuthError::Malformed(format!("payload encoding: {e}")))?;
        let claims: Claims = serde_json::from_slice(&payload)
            .map_err(|e| AuthError::Malformed(format!("claims: {e}")))?;
        if claims.id.is_empty() {
            return Err(AuthError::Malformed("empty id claim".into()));
        }
        if let Some(exp) = claims.exp {
            if now_secs() >= exp {
                return Err(AuthError::Expired);
            }
        }
        Ok(claims)
    }
}

/// Read the claims of a token without verifying it. Clients use this to learn
/// their own identity; the relay never does.
pub fn peek_claims(token: &str) -> Result<Claims, AuthError> {
    let payload = token
        .trim()
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::Malformed("expected three segments".into()))?;
    let payload = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::Malformed(format!("payload encoding: {e}")))?;
    serde_json::from_slice(&payload).map_err(|e| AuthError::Malformed(format!("claims: {e}")))
}

/// The token from an `Authorization: Bearer …` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::Malformed("authorization header is not ASCII".into()))?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)
}
