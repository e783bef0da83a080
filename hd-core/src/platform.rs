//! Platform detection and OS-specific utilities.

use std::path::PathBuf;
use crate::error::{HdError, HdResult};

/// Detected operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    /// Detect the current platform at compile time.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// Get the platform-specific application data directory.
    ///
    /// - Windows: `%APPDATA%/Huddle`
    /// - macOS: `~/Library/Application Support/Huddle`
    /// - Linux: `~/.local/share/Huddle`
    pub fn data_dir() -> HdResult<PathBuf> {
        let base = dirs::data_dir()
            .ok_or_else(|| HdError::Config("could not determine data directory".into()))?;
        Ok(base.join("Huddle"))
    }

    /// Get the platform-specific configuration directory.
    ///
    /// - Windows: `%APPDATA%/Huddle`
    /// - macOS: `~/Library/Application Support/Huddle`
    /// - Linux: `~/.config/Huddle`
    pub fn config_dir() -> HdResult<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| HdError::Config("could not determine config directory".into()))?;
        Ok(base.join("Huddle"))
    }

    /// Get a human-readable platform name.
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Windows => "Windows",
            Platform::MacOs => "macOS",
            Platform::Linux => "Linux",
        }
    }

    /// Device type reported to the backend in the `Device-Type` header.
    /// Every supported platform is a desktop client.
    pub fn device_type(&self) -> &'static str {
        match self {
            Platform::Windows | Platform::MacOs | Platform::Linux => "desktop",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        let p = Platform::current();
        assert!(matches!(p, Platform::Windows | Platform::MacOs | Platform::Linux));
    }

    #[test]
    fn test_platform_name() {
        assert_eq!(Platform::Windows.name(), "Windows");
        assert_eq!(Platform::MacOs.name(), "macOS");
        assert_eq!(Platform::Linux.name(), "Linux");
    }

    #[test]
    fn test_device_type_is_desktop() {
        assert_eq!(Platform::current().device_type(), "desktop");
        assert_eq!(Platform::MacOs.to_string(), "macOS");
    }
}
