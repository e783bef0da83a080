//! Huddle API - HTTP client for the Huddle REST API.
//!
//! This crate provides the REST client used outside the realtime link:
//! custom headers, timeouts, and automatic retry with exponential backoff.
//! On top of it sits [`TokenClient`], the config-backed credential provider
//! that hands credentials to the connection manager and refreshes expired
//! access tokens.

pub mod client;
pub mod response;
pub mod token;

// Re-export key types
pub use client::{ApiClient, RetryConfig};
pub use response::{ApiEnvelope, TokenPair};
pub use token::TokenClient;
