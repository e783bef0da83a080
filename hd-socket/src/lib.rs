//! Huddle Socket - STOMP-over-WebSocket realtime link.
//!
//! This crate provides the connection manager that handles:
//! - STOMP frame encoding and decoding
//! - Authenticated CONNECT and topic subscription
//! - Heart-beats and staleness detection
//! - Automatic reconnection with exponential backoff and jitter
//! - Routing inbound messages to per-topic handlers
//! - Fire-and-forget publishing of activity, typing and call signals

pub mod credentials;
pub mod dispatcher;
pub mod events;
pub mod frame;
pub mod heartbeat;
mod machine;
pub mod manager;
pub mod payloads;
pub mod policy;
pub mod publish;
pub mod timers;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export key types
pub use credentials::{validate_token, CredentialProvider, Credentials, TokenStatus};
pub use dispatcher::{DispatchOutcome, TopicDispatcher, TopicHandler};
pub use events::{
    ConnectionState, ContextSnapshot, FailureKind, InboundMessage, ReconnectReason,
    SessionState, TopicSubscription,
};
pub use frame::{Command, Frame};
pub use manager::{ConnectionManager, LinkSettings};
pub use payloads::{
    ActivityPayload, CallSignalPayload, CallSignalType, PresenceStatus, TypingPayload,
};
pub use policy::{Backoff, FailureClass, FailurePolicy};
pub use publish::{PublishDestinations, Publisher};
pub use transport::{SocketHandle, Transport, WsTransport};
