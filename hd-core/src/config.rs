//! Application configuration management.
//!
//! Handles loading, saving, and accessing the link configuration: server
//! endpoints, stored credentials, device identity, connection tuning, topic
//! subscriptions, and publish destinations. Configuration is persisted as TOML
//! on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::constants;
use crate::error::{HdError, HdResult};
use crate::platform::Platform;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server endpoints.
    #[serde(default)]
    pub server: ServerConfig,

    /// Stored credentials used by the HTTP credential provider.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Identity of this device.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Connection manager tuning.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Topics subscribed after every successful CONNECT.
    #[serde(default = "default_topics")]
    pub topics: Vec<TopicConfig>,

    /// Destinations used by the publish API.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket endpoint carrying the STOMP session (e.g. "wss://chat.example.com/ws").
    #[serde(default)]
    pub ws_url: String,

    /// REST API root used for token refresh (e.g. "https://chat.example.com/api").
    #[serde(default)]
    pub api_url: String,

    /// Extra HTTP headers sent on the WebSocket upgrade and REST requests.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,

    /// REST request timeout in milliseconds.
    #[serde(default = "default_api_timeout")]
    pub api_timeout_ms: u64,
}

/// Stored credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token presented in CONNECT.
    #[serde(default)]
    pub access_token: String,

    /// Refresh token exchanged for a new access token.
    #[serde(default)]
    pub refresh_token: String,

    /// Currently selected workspace.
    #[serde(default)]
    pub workspace_id: String,
}

/// Device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable device identifier. Generated on first use when empty.
    #[serde(default)]
    pub device_id: String,

    /// Device type reported in the `Device-Type` header.
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

/// Connection manager tuning. All durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Heart-beat interval advertised in both directions.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_ms: u64,

    /// Time allowed between opening the socket and receiving CONNECTED.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Period of the staleness check while connected.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,

    /// Inbound silence after which a connected socket is considered dead.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_ms: u64,

    /// First reconnect delay.
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_delay_ms: u64,

    /// Growth factor applied per failed attempt.
    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,

    /// Upper bound of the un-jittered reconnect delay.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_delay_ms: u64,

    /// Maximum random jitter as a fraction of the delay (0.2 = up to +20%).
    #[serde(default = "default_jitter")]
    pub reconnect_jitter: f64,

    /// Consecutive failures tolerated before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_reconnect_attempts: u32,

    /// Window in which lifecycle signals coalesce into one reconnect.
    #[serde(default = "default_debounce")]
    pub lifecycle_debounce_ms: u64,

    /// Mapping from close codes and error keywords to fatal failures.
    #[serde(default)]
    pub failure_policy: FailurePolicyConfig,
}

/// Which close codes and error texts mean "credentials rejected, stop retrying".
///
/// Anything not listed here is treated as retryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePolicyConfig {
    /// WebSocket close codes that indicate an authentication failure.
    #[serde(default = "default_fatal_close_codes")]
    pub fatal_close_codes: Vec<u16>,

    /// Case-insensitive substrings of ERROR frame text that indicate an authentication failure.
    #[serde(default = "default_auth_keywords")]
    pub auth_keywords: Vec<String>,
}

/// A topic subscribed after CONNECTED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Server destination, e.g. "/user/queue/messages".
    pub destination: String,
    /// Subscription id sent in the SUBSCRIBE `id` header.
    pub subscription_id: String,
}

/// Destinations of outbound SEND frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_activity_destination")]
    pub activity_destination: String,
    #[serde(default = "default_typing_destination")]
    pub typing_destination: String,
    #[serde(default = "default_call_signal_destination")]
    pub call_signal_destination: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for log files. If empty, uses default location.
    #[serde(default)]
    pub directory: String,

    /// Enable JSON structured logging output.
    #[serde(default)]
    pub json_output: bool,
}

// Default value functions for serde

fn default_api_timeout() -> u64 {
    30_000
}

fn default_device_type() -> String {
    Platform::current().device_type().to_string()
}

fn default_heartbeat() -> u64 {
    constants::DEFAULT_HEARTBEAT_MS
}

fn default_connect_timeout() -> u64 {
    15_000
}

fn default_health_check_interval() -> u64 {
    5_000
}

fn default_stale_threshold() -> u64 {
    20_000
}

fn default_reconnect_base() -> u64 {
    1_000
}

fn default_reconnect_multiplier() -> f64 {
    2.0
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_max_attempts() -> u32 {
    constants::DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_debounce() -> u64 {
    200
}

fn default_fatal_close_codes() -> Vec<u16> {
    vec![
        constants::close_codes::POLICY_VIOLATION,
        constants::close_codes::UNAUTHORIZED,
    ]
}

fn default_auth_keywords() -> Vec<String> {
    ["unauthorized", "token", "expired", "auth"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_topics() -> Vec<TopicConfig> {
    vec![
        TopicConfig {
            destination: "/user/queue/messages".into(),
            subscription_id: "sub-messages".into(),
        },
        TopicConfig {
            destination: "/topic/presence".into(),
            subscription_id: "sub-presence".into(),
        },
        TopicConfig {
            destination: "/user/queue/typing".into(),
            subscription_id: "sub-typing".into(),
        },
        TopicConfig {
            destination: "/user/queue/call".into(),
            subscription_id: "sub-call".into(),
        },
    ]
}

fn default_activity_destination() -> String {
    "/app/presence.activity".to_string()
}

fn default_typing_destination() -> String {
    "/app/chat.typing".to_string()
}

fn default_call_signal_destination() -> String {
    "/app/call.signal".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            device: DeviceConfig::default(),
            connection: ConnectionConfig::default(),
            topics: default_topics(),
            publish: PublishConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            api_url: String::new(),
            custom_headers: HashMap::new(),
            api_timeout_ms: default_api_timeout(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            device_type: default_device_type(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat(),
            connect_timeout_ms: default_connect_timeout(),
            health_check_interval_ms: default_health_check_interval(),
            stale_threshold_ms: default_stale_threshold(),
            reconnect_base_delay_ms: default_reconnect_base(),
            reconnect_multiplier: default_reconnect_multiplier(),
            reconnect_max_delay_ms: default_reconnect_max(),
            reconnect_jitter: default_jitter(),
            max_reconnect_attempts: default_max_attempts(),
            lifecycle_debounce_ms: default_debounce(),
            failure_policy: FailurePolicyConfig::default(),
        }
    }
}

impl Default for FailurePolicyConfig {
    fn default() -> Self {
        Self {
            fatal_close_codes: default_fatal_close_codes(),
            auth_keywords: default_auth_keywords(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            activity_destination: default_activity_destination(),
            typing_destination: default_typing_destination(),
            call_signal_destination: default_call_signal_destination(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: String::new(),
            json_output: false,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn lifecycle_debounce(&self) -> Duration {
        Duration::from_millis(self.lifecycle_debounce_ms)
    }

    /// Reject settings the connection manager cannot work with.
    pub fn validate(&self) -> HdResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(HdError::Config("heartbeat_interval_ms must be > 0".into()));
        }
        if self.health_check_interval_ms == 0 {
            return Err(HdError::Config("health_check_interval_ms must be > 0".into()));
        }
        if self.stale_threshold_ms <= self.heartbeat_interval_ms {
            return Err(HdError::Config(format!(
                "stale_threshold_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.stale_threshold_ms, self.heartbeat_interval_ms
            )));
        }
        if self.reconnect_multiplier < 1.0 {
            return Err(HdError::Config("reconnect_multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(HdError::Config("reconnect_jitter must be within 0.0..=1.0".into()));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(HdError::Config("max_reconnect_attempts must be > 0".into()));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from the default config file path.
    pub fn load_default() -> HdResult<Self> {
        let path = Self::default_config_path()?;
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> HdResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a specific file path.
    pub fn save_to_file(&self, path: &Path) -> HdResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| HdError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> HdResult<PathBuf> {
        let config_dir = Platform::config_dir()?;
        Ok(config_dir.join("config.toml"))
    }

    /// Get the effective log directory, using the configured path or the default.
    pub fn effective_log_dir(&self) -> HdResult<PathBuf> {
        if self.logging.directory.is_empty() {
            let data_dir = Platform::data_dir()?;
            Ok(data_dir.join("logs"))
        } else {
            Ok(PathBuf::from(&self.logging.directory))
        }
    }

    /// Whether the WebSocket endpoint and a token are configured.
    pub fn is_server_configured(&self) -> bool {
        !self.server.ws_url.is_empty() && !self.auth.access_token.is_empty()
    }

    /// Assign a fresh device id if none is stored yet.
    ///
    /// Returns true when an id was generated, so callers know to persist it.
    pub fn ensure_device_id(&mut self) -> bool {
        if self.device.device_id.is_empty() {
            self.device.device_id = uuid::Uuid::new_v4().to_string();
            true
        } else {
            false
        }
    }

    /// Check the parts of the configuration the link cannot start without.
    pub fn validate(&self) -> HdResult<()> {
        if self.server.ws_url.is_empty() {
            return Err(HdError::MissingConfig("server.ws_url".into()));
        }
        if !(self.server.ws_url.starts_with("ws://") || self.server.ws_url.starts_with("wss://")) {
            return Err(HdError::Config(format!(
                "server.ws_url must use ws:// or wss://, got {}",
                self.server.ws_url
            )));
        }
        let mut ids = std::collections::HashSet::new();
        for topic in &self.topics {
            if !ids.insert(topic.subscription_id.as_str()) {
                return Err(HdError::Config(format!(
                    "duplicate subscription id: {}",
                    topic.subscription_id
                )));
            }
        }
        self.connection.validate()
    }
}

/// Thread-safe configuration holder for shared access across services.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<AppConfig>>,
}

impl ConfigHandle {
    /// Create a new configuration handle.
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Read the configuration.
    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, AppConfig> {
        self.inner.read().await
    }

    /// Write/update the configuration.
    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, AppConfig> {
        self.inner.write().await
    }

    /// Clone the current configuration.
    pub async fn snapshot(&self) -> AppConfig {
        self.inner.read().await.clone()
    }

    /// Save the current configuration to the given path.
    pub async fn save_to(&self, path: &Path) -> HdResult<()> {
        let config = self.inner.read().await;
        config.save_to_file(path)
    }
}
