//! Configuration for message queues
//!
//! Thresholds that drive the queue diagnostics can be tuned per queue, either
//! in code or from a TOML document such as:
//!
//! ```toml
//! name = "media-worker"
//! max_msg_latency_ms = 150
//! slow_dispatch_threshold_ms = 50
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default maximum latency for time-sensitive messages (150ms)
pub const DEFAULT_MAX_MSG_LATENCY: Duration = Duration::from_millis(150);

/// Default dispatch time above which a diagnostic is logged (50ms)
pub const DEFAULT_SLOW_DISPATCH_THRESHOLD: Duration = Duration::from_millis(50);

/// Per-queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    /// Name used in log output
    pub name: String,
    /// Deadline applied to messages posted as time-sensitive
    pub max_msg_latency_ms: u64,
    /// Dispatches taking at least this long are logged
    pub slow_dispatch_threshold_ms: u64,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            name: "message-queue".to_string(),
            max_msg_latency_ms: DEFAULT_MAX_MSG_LATENCY.as_millis() as u64,
            slow_dispatch_threshold_ms: DEFAULT_SLOW_DISPATCH_THRESHOLD.as_millis() as u64,
        }
    }
}

impl MessageQueueConfig {
    /// Create a default configuration with the given queue name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the time-sensitive delivery deadline
    pub fn with_max_msg_latency(mut self, latency: Duration) -> Self {
        self.max_msg_latency_ms = latency.as_millis() as u64;
        self
    }

    /// Set the slow dispatch logging threshold
    pub fn with_slow_dispatch_threshold(mut self, threshold: Duration) -> Self {
        self.slow_dispatch_threshold_ms = threshold.as_millis() as u64;
        self
    }

    /// Deadline applied to time-sensitive posts
    pub fn max_msg_latency(&self) -> Duration {
        Duration::from_millis(self.max_msg_latency_ms)
    }

    /// Slow dispatch logging threshold
    pub fn slow_dispatch_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_dispatch_threshold_ms)
    }

    /// Check that the thresholds are usable
    pub fn validate(&self) -> Result<()> {
        if self.max_msg_latency_ms == 0 {
            return Err(Error::config("max_msg_latency_ms must be non-zero"));
        }
        if self.slow_dispatch_threshold_ms == 0 {
            return Err(Error::config("slow_dispatch_threshold_ms must be non-zero"));
        }
        Ok(())
    }

    /// Parse and validate a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MessageQueueConfig::default();
        assert_eq!(config.max_msg_latency(), Duration::from_millis(150));
        assert_eq!(config.slow_dispatch_threshold(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = MessageQueueConfig::from_toml_str(
            r#"
            name = "jitter-buffer"
            slow_dispatch_threshold_ms = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "jitter-buffer");
        assert_eq!(config.slow_dispatch_threshold(), Duration::from_millis(10));
        // Unspecified fields keep their defaults
        assert_eq!(config.max_msg_latency(), DEFAULT_MAX_MSG_LATENCY);
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        let err = MessageQueueConfig::from_toml_str("max_msg_latency_ms = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = MessageQueueConfig::from_toml_str("name = ").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = MessageQueueConfig::from_file("/nonexistent/queue.toml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_builder_methods() {
        let config = MessageQueueConfig::named("signaling")
            .with_max_msg_latency(Duration::from_millis(20))
            .with_slow_dispatch_threshold(Duration::from_millis(5));
        assert_eq!(config.name, "signaling");
        assert_eq!(config.max_msg_latency_ms, 20);
        assert_eq!(config.slow_dispatch_threshold_ms, 5);
    }
}
