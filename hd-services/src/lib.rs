//! Huddle Services - application-side drivers for the realtime link.
//!
//! This crate provides the service trait and the lifecycle triggers that
//! translate session, connectivity and foreground changes into calls on
//! the [`ConnectionManager`](hd_socket::ConnectionManager):
//! - Session changes are forwarded as they happen
//! - Network restored, app foregrounded and workspace switches are
//!   coalesced into a single debounced reconnect

pub mod lifecycle;
pub mod service;

// Re-export key types
pub use lifecycle::{LifecycleTriggers, TriggerInputs};
pub use service::{Service, ServiceState};
