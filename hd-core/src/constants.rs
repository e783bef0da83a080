//! Application-wide constants.

/// Application name.
pub const APP_NAME: &str = "Huddle";

/// Application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// STOMP protocol version advertised in CONNECT.
pub const STOMP_VERSION: &str = "1.2";

/// Default heart-beat interval in milliseconds, advertised in both directions.
pub const DEFAULT_HEARTBEAT_MS: u64 = 10_000;

/// Default number of consecutive failures before the link gives up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Tokens expiring within this many seconds are treated as already expired.
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 30;

/// Default content type of SEND frame bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Frame header names used on the wire.
pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const WORKSPACE_ID: &str = "Workspace-Id";
    pub const DEVICE_ID: &str = "Device-Id";
    pub const DEVICE_TYPE: &str = "Device-Type";
    pub const DESTINATION: &str = "destination";
    pub const SUBSCRIPTION_ID: &str = "id";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const MESSAGE: &str = "message";
}

/// WebSocket close codes with a fixed meaning to the link.
pub mod close_codes {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Protocol error; sent by servers after missed heart-beats.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Policy violation; used by the backend for rejected credentials.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Application-defined "unauthorized" close.
    pub const UNAUTHORIZED: u16 = 3401;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_default_is_whole_seconds() {
        assert_eq!(DEFAULT_HEARTBEAT_MS % 1000, 0);
    }

    #[test]
    fn test_header_names_are_distinct() {
        let names = [
            headers::ACCEPT_VERSION,
            headers::HEART_BEAT,
            headers::AUTHORIZATION,
            headers::WORKSPACE_ID,
            headers::DEVICE_ID,
            headers::DEVICE_TYPE,
            headers::DESTINATION,
            headers::SUBSCRIPTION_ID,
            headers::CONTENT_LENGTH,
            headers::CONTENT_TYPE,
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }
}
