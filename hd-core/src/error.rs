//! Global error types for the Huddle link.
//!
//! All error categories across the workspace are unified into a single
//! `HdError` enum with conversions from underlying library errors.

use thiserror::Error;

/// Convenience type alias for Results using HdError.
pub type HdResult<T> = Result<T, HdError>;

/// Unified error type covering all error categories in Huddle.
#[derive(Error, Debug)]
pub enum HdError {
    // -- Configuration errors --
    /// Failed to load or parse application configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required configuration value is missing.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    // -- Network errors --
    /// HTTP request failed.
    #[error("http error: {0}")]
    Http(String),

    /// Request or handshake timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// WebSocket transport error.
    #[error("socket error: {0}")]
    Socket(String),

    /// The socket is not open, so nothing could be written.
    #[error("socket closed")]
    SocketClosed,

    /// Server returned an error response.
    #[error("server error (status {status}): {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Error message from server.
        message: String,
    },

    // -- Auth errors --
    /// The server rejected our credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The locally held token is unusable (empty, malformed, or expired).
    #[error("invalid token: {0}")]
    TokenInvalid(String),

    // -- Protocol errors --
    /// A frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    // -- File/IO errors --
    /// File system operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // -- Service errors --
    /// A service failed to initialize.
    #[error("service init error: {0}")]
    ServiceInit(String),

    // -- Generic --
    /// An unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Wrapping anyhow errors for interop.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HdError {
    /// Whether this error means the credentials themselves were rejected.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthFailed(_) | Self::TokenInvalid(_))
    }
}

impl From<serde_json::Error> for HdError {
    fn from(e: serde_json::Error) -> Self {
        HdError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for HdError {
    fn from(e: toml::de::Error) -> Self {
        HdError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hd_error_display() {
        let err = HdError::Config("bad value".to_string());
        assert_eq!(err.to_string(), "configuration error: bad value");

        let err = HdError::ServerError { status: 401, message: "nope".into() };
        assert_eq!(err.to_string(), "server error (status 401): nope");
    }

    #[test]
    fn test_is_auth() {
        assert!(HdError::AuthFailed("rejected".into()).is_auth());
        assert!(HdError::TokenInvalid("expired".into()).is_auth());
        assert!(!HdError::SocketClosed.is_auth());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: HdError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, HdError::Serialization(_)));
    }
}
