//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use stepwise_core::duration::go_format;
use stepwise_executor::{CheckConfig, LimiterConfig};
use stepwise_scheduler::ScannerConfig;

use super::logging::LogFormat;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// Config file path
        path: String,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level, overridden by `RUST_LOG`
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Interval of checkables without an explicit one
    #[serde(with = "go_format")]
    pub default_check_interval: Duration,
    /// Interval of checkables that receive webhooks
    #[serde(with = "go_format")]
    pub default_webhook_check_interval: Duration,
    /// Timeout of checks without an explicit one
    #[serde(with = "go_format")]
    pub default_check_timeout: Duration,
    /// How often a periodic check retries a held scope lock
    #[serde(with = "go_format")]
    pub check_lock_poll_interval: Duration,
    /// How often the scanner runs
    #[serde(with = "go_format")]
    pub scanner_interval: Duration,
    /// How often the checker runs without being woken
    #[serde(with = "go_format")]
    pub checker_interval: Duration,
    /// Fixed check rate when positive, derived from the checkable count
    /// when zero, unlimited when negative
    pub max_checks_per_second: f64,
    /// How long a checkable count is reused by the rate limiter
    #[serde(with = "go_format")]
    pub checkable_count_refresh_interval: Duration,
    /// Redact secret values from build output
    pub redact_secrets: bool,
    /// How long shutdown waits for running builds to stop
    #[serde(with = "go_format")]
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Plain,
            default_check_interval: Duration::from_secs(60),
            default_webhook_check_interval: Duration::from_secs(24 * 60 * 60),
            default_check_timeout: Duration::from_secs(60 * 60),
            check_lock_poll_interval: Duration::from_secs(1),
            scanner_interval: Duration::from_secs(10),
            checker_interval: Duration::from_secs(10),
            max_checks_per_second: 0.0,
            checkable_count_refresh_interval: Duration::from_secs(60),
            redact_secrets: true,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Parses and validates YAML configuration; missing fields keep their defaults
    ///
    /// # Errors
    ///
    /// Fails on malformed YAML, bad durations, or out-of-range values.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Checks values serde cannot
    ///
    /// # Errors
    ///
    /// Fails when an interval the loops tick on is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("scanner_interval", self.scanner_interval),
            ("checker_interval", self.checker_interval),
            ("check_lock_poll_interval", self.check_lock_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid("log_level must not be empty".to_string()));
        }
        Ok(())
    }

    /// Scanner settings
    #[must_use]
    pub fn scanner(&self) -> ScannerConfig {
        ScannerConfig {
            default_check_interval: self.default_check_interval,
            default_webhook_check_interval: self.default_webhook_check_interval,
        }
    }

    /// Check step settings
    #[must_use]
    pub fn checks(&self) -> CheckConfig {
        CheckConfig {
            default_check_interval: self.default_check_interval,
            default_check_timeout: self.default_check_timeout,
            lock_poll_interval: self.check_lock_poll_interval,
        }
    }

    /// Rate limiter settings
    #[must_use]
    pub fn limiter(&self) -> LimiterConfig {
        LimiterConfig {
            check_interval: self.default_check_interval,
            max_checks_per_second: self.max_checks_per_second,
            refresh_interval: self.checkable_count_refresh_interval,
        }
    }
}
