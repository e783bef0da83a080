//! Retry policy: reconnect backoff and failure classification.

use std::time::Duration;

use hd_core::config::{ConnectionConfig, FailurePolicyConfig};

/// Exponential reconnect backoff with additive jitter.
///
/// With base 1s, multiplier 2 and max 30s the un-jittered sequence is
/// 1s, 2s, 4s, 8s, 16s, 30s, 30s, ...
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_delay_ms),
            multiplier: config.reconnect_multiplier,
            max: Duration::from_millis(config.reconnect_max_delay_ms),
            jitter: config.reconnect_jitter,
        }
    }

    /// Delay for the given zero-based attempt, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = (base_ms * self.multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay for the given zero-based attempt with up to `jitter` extra.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let extra = base.as_secs_f64() * self.jitter * rand::random::<f64>();
        base + Duration::from_secs_f64(extra)
    }
}

/// How a failure affects retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Credentials were rejected; retrying the same credentials is pointless.
    Fatal,
    /// Network or protocol trouble; retry with backoff.
    Retryable,
}

/// Table mapping close codes and error text to a [`FailureClass`].
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    fatal_close_codes: Vec<u16>,
    auth_keywords: Vec<String>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::from_config(&FailurePolicyConfig::default())
    }
}

impl FailurePolicy {
    pub fn from_config(config: &FailurePolicyConfig) -> Self {
        Self {
            fatal_close_codes: config.fatal_close_codes.clone(),
            auth_keywords: config
                .auth_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Classify a WebSocket close. A missing code (abnormal closure) is retryable.
    pub fn classify_close(&self, code: Option<u16>) -> FailureClass {
        match code {
            Some(code) if self.fatal_close_codes.contains(&code) => FailureClass::Fatal,
            _ => FailureClass::Retryable,
        }
    }

    /// Classify the text of an ERROR frame by case-insensitive keyword match.
    pub fn classify_error_text(&self, text: &str) -> FailureClass {
        let lower = text.to_lowercase();
        if self.auth_keywords.iter().any(|k| lower.contains(k.as_str())) {
            FailureClass::Fatal
        } else {
            FailureClass::Retryable
        }
    }
}
