//! Link state, lifecycle inputs, and the observable outputs of the connection manager.

use std::time::Duration;

use hd_core::config::TopicConfig;

/// Connection state of the link. Only the connection actor changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket and no attempt in flight.
    #[default]
    Disconnected,
    /// A connect attempt is in flight (credentials, socket open, or CONNECT handshake).
    Connecting,
    /// CONNECTED received; topics subscribed and heart-beats running.
    Connected,
    /// The last attempt failed. Terminal while `should_stop_retrying` is set.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Failure taxonomy surfaced through [`ContextSnapshot::last_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Server rejected the credentials. No retry.
    AuthenticationFailure,
    /// Connect timeout, unexpected close, or protocol-violation close. Retried with backoff.
    TransientNetworkFailure,
    /// Socket looked open but went silent. Retried immediately.
    StaleConnection,
    /// An inbound frame could not be decoded and was dropped.
    ProtocolDecodeError,
    /// A publish was refused because the link was not connected.
    PublishRejected,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthenticationFailure => write!(f, "authentication_failure"),
            Self::TransientNetworkFailure => write!(f, "transient_network_failure"),
            Self::StaleConnection => write!(f, "stale_connection"),
            Self::ProtocolDecodeError => write!(f, "protocol_decode_error"),
            Self::PublishRejected => write!(f, "publish_rejected"),
        }
    }
}

/// Why a lifecycle trigger asked for a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// App returned to the foreground.
    Foreground,
    /// Network connectivity came back.
    NetworkRestored,
    /// The active workspace changed.
    WorkspaceChanged,
    /// Explicit request from application code.
    Manual,
}

impl std::fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Foreground => write!(f, "foreground"),
            Self::NetworkRestored => write!(f, "network_restored"),
            Self::WorkspaceChanged => write!(f, "workspace_changed"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// What the auth/session observer knows about the user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub authenticated: bool,
    pub workspace_id: Option<String>,
}

impl SessionState {
    /// Authenticated with the given workspace selected.
    pub fn signed_in(workspace_id: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            workspace_id: Some(workspace_id.into()),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    /// A connection is only allowed with an authenticated user and a selected workspace.
    pub fn is_valid(&self) -> bool {
        self.authenticated && self.workspace_id.is_some()
    }
}

/// A destination subscribed after every CONNECTED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    pub destination: String,
    pub subscription_id: String,
}

impl TopicSubscription {
    pub fn new(destination: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            subscription_id: subscription_id.into(),
        }
    }
}

impl From<&TopicConfig> for TopicSubscription {
    fn from(config: &TopicConfig) -> Self {
        Self::new(config.destination.as_str(), config.subscription_id.as_str())
    }
}

/// A MESSAGE frame as seen by broadcast subscribers of the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Destination header of the frame.
    pub destination: String,
    /// Registered topic id that matched, if any.
    pub topic_id: Option<String>,
    /// Decoded body.
    pub body: String,
}

/// Read-only view of the connection context, published after every transition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContextSnapshot {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub should_stop_retrying: bool,
    pub is_connecting: bool,
    pub is_authenticated: bool,
    pub current_workspace: Option<String>,
    pub last_failure: Option<FailureKind>,
    /// Whether a reconnect timer is pending.
    pub reconnect_pending: bool,
    /// Inbound silence at the time of the snapshot, while a socket is current.
    pub idle: Option<Duration>,
}
