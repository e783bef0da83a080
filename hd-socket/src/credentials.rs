//! Credentials and the provider interface the connection manager pulls them from.
//!
//! Credentials are fetched fresh for every connect attempt because tokens
//! expire. Before a socket is opened the token is checked locally so an
//! obviously expired token never reaches the server.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use hd_core::constants::TOKEN_EXPIRY_SKEW_SECS;
use hd_core::error::HdResult;

/// Everything CONNECT needs to authenticate this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub auth_token: String,
    pub workspace_id: String,
    pub device_id: String,
    pub device_type: String,
}

/// Source of credentials, owned by the application.
///
/// The connection manager only reads from it, except for asking for a token
/// refresh when the current token is unusable.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// Current credentials. Called once per connect attempt.
    async fn get_credentials(&self) -> HdResult<Credentials>;

    /// Best-effort token refresh. The next `get_credentials` call should see the new token.
    async fn refresh_token(&self) -> HdResult<()>;
}

/// Outcome of checking a token locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Valid,
    /// The token has no content.
    Empty,
    /// A JWT whose `exp` claim is in the past (or within the skew window).
    Expired { expired_at: DateTime<Utc> },
    /// Looks like a JWT but the payload is unreadable.
    Malformed(String),
}

impl TokenStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid => write!(f, "valid"),
            Self::Empty => write!(f, "empty"),
            Self::Expired { expired_at } => write!(f, "expired at {}", expired_at.to_rfc3339()),
            Self::Malformed(reason) => write!(f, "malformed: {reason}"),
        }
    }
}

#[derive(Deserialize)]
struct JwtClaims {
    exp: Option<i64>,
}

/// Check a bearer token without contacting the server.
///
/// JWTs are decoded and their `exp` claim compared with `now`; opaque tokens
/// are accepted as long as they are non-empty.
pub fn validate_token(token: &str, now: DateTime<Utc>) -> TokenStatus {
    let token = token.trim();
    if token.is_empty() {
        return TokenStatus::Empty;
    }

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return TokenStatus::Valid;
    }

    let payload = match URL_SAFE_NO_PAD.decode(parts[1].trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(e) => return TokenStatus::Malformed(format!("payload is not base64url: {e}")),
    };
    let claims: JwtClaims = match serde_json::from_slice(&payload) {
        Ok(claims) => claims,
        Err(e) => return TokenStatus::Malformed(format!("payload is not JSON: {e}")),
    };

    let Some(exp) = claims.exp else {
        return TokenStatus::Valid;
    };
    let Some(expired_at) = Utc.timestamp_opt(exp, 0).single() else {
        return TokenStatus::Malformed(format!("exp out of range: {exp}"));
    };
    if expired_at.timestamp() - TOKEN_EXPIRY_SKEW_SECS <= now.timestamp() {
        TokenStatus::Expired { expired_at }
    } else {
        TokenStatus::Valid
    }
}
