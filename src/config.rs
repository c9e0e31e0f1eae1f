//! Configuration for the recovery engine
//!
//! Engine-wide knobs shared by every policy of one engine instance. Per-policy
//! settings (trigger, handler, retry bound) live on [`crate::Policy`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay after the first trigger before the pending set is collected,
    /// so near-simultaneous triggers join one round
    pub coalesce_window_ms: u64,

    /// Upper bound on one recovery handler invocation; `None` waits forever
    pub recovery_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 20,
            recovery_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn recovery_timeout(&self) -> Option<Duration> {
        self.recovery_timeout_ms.map(Duration::from_millis)
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: EngineConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn coalesce_window(mut self, window: Duration) -> Self {
        self.config.coalesce_window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout_ms =
            Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

/// Load configuration from environment variables
///
/// Reads `RECOVERY_COALESCE_WINDOW_MS` and `RECOVERY_TIMEOUT_MS`; unset or
/// unparsable values keep their defaults.
pub fn from_env() -> EngineConfig {
    let mut config = EngineConfig::default();

    if let Ok(window) = std::env::var("RECOVERY_COALESCE_WINDOW_MS") {
        if let Ok(ms) = window.parse::<u64>() {
            config.coalesce_window_ms = ms;
        }
    }

    if let Ok(timeout) = std::env::var("RECOVERY_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.recovery_timeout_ms = Some(ms);
        }
    }

    config
}

/// Parse configuration from a TOML document
pub fn from_toml_str(contents: &str) -> Result<EngineConfig> {
    Ok(toml::from_str(contents)?)
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<EngineConfig> {
    let contents = std::fs::read_to_string(path)?;
    from_toml_str(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.coalesce_window(), Duration::from_millis(20));
        assert_eq!(config.recovery_timeout(), None);
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .coalesce_window(Duration::from_millis(5))
            .recovery_timeout(Duration::from_secs(2))
            .build();

        assert_eq!(config.coalesce_window_ms, 5);
        assert_eq!(config.recovery_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_builder_saturates_huge_durations() {
        let config = ConfigBuilder::new()
            .coalesce_window(Duration::MAX)
            .recovery_timeout(Duration::MAX)
            .build();

        assert_eq!(config.coalesce_window_ms, u64::MAX);
        assert_eq!(config.recovery_timeout_ms, Some(u64::MAX));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = from_toml_str("recovery_timeout_ms = 1500").unwrap();
        assert_eq!(config.coalesce_window_ms, 20);
        assert_eq!(config.recovery_timeout_ms, Some(1500));
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        let err = from_toml_str("coalesce_window_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_missing_file() {
        let err = from_file("/definitely/not/here/recovery.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("RECOVERY_COALESCE_WINDOW_MS", "7");
        std::env::set_var("RECOVERY_TIMEOUT_MS", "not-a-number");
        let config = from_env();
        std::env::remove_var("RECOVERY_COALESCE_WINDOW_MS");
        std::env::remove_var("RECOVERY_TIMEOUT_MS");

        assert_eq!(config.coalesce_window_ms, 7);
        assert_eq!(config.recovery_timeout_ms, None);
    }
}
