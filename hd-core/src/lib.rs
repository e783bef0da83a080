//! Huddle Core - Foundation types, error handling, configuration, and logging.
//!
//! This crate provides the shared foundation used by all other Huddle crates:
//! - Application configuration (server endpoints, credentials, connection tuning)
//! - Global error type covering all error categories
//! - Structured logging with tracing
//! - Platform detection utilities
//! - Wire-level constants shared by the link crates

pub mod config;
pub mod error;
pub mod logging;
pub mod platform;
pub mod constants;

// Re-export commonly used items at the crate root
pub use config::AppConfig;
pub use error::{HdError, HdResult};
pub use logging::init_logging;
pub use platform::Platform;
