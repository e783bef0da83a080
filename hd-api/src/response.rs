//! REST response types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use hd_core::error::{HdError, HdResult};

/// Optional response envelope: `{ "message": "...", "data": { ... } }`.
///
/// Some deployments wrap payloads this way and some return them bare;
/// [`ApiEnvelope::parse`] accepts both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T: DeserializeOwned> ApiEnvelope<T> {
    /// Decode `body` as an enveloped `T`, falling back to a bare `T`.
    pub fn parse(body: &str) -> HdResult<T> {
        if let Ok(ApiEnvelope { data: Some(data), .. }) = serde_json::from_str::<ApiEnvelope<T>>(body) {
            return Ok(data);
        }
        serde_json::from_str::<T>(body)
            .map_err(|e| HdError::Serialization(format!("failed to parse response: {e}")))
    }
}

/// Result of a token refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    #[serde(alias = "access_token")]
    pub access_token: String,
    /// Present when the server rotates refresh tokens.
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds, if reported.
    #[serde(default, alias = "expires_in")]
    pub expires_in: Option<u64>,
}
