//! Unified configuration loading.
//!
//! Defaults live in [`defaults`], environment variable names in [`env_vars`].
//! A [`TwinConfig`] is built from defaults, optionally a TOML file, and then
//! environment overrides, in that order.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default values
pub mod defaults {
    /// Liveness check period in seconds
    pub const LIVENESS_CHECK_INTERVAL_SECS: u64 = 30;
    /// Inactivity window after which a collecting device goes offline
    pub const LIVENESS_OFFLINE_TIMEOUT_SECS: u64 = 300;
    /// Batches covering more devices than this are applied in parallel
    pub const INGEST_PARALLEL_THRESHOLD: usize = 8;
    /// Event bus buffer size
    pub const EVENT_CHANNEL_CAPACITY: usize = 1000;
    /// Diagnostics kept per device status machine
    pub const STATUS_MAX_DIAGNOSTICS: usize = 32;
    /// Log filter used when RUST_LOG is unset
    pub const LOG_FILTER: &str = "edgetwin=info";
}

/// Environment variable names
pub mod env_vars {
    pub const LIVENESS_TIMEOUT_SECS: &str = "EDGETWIN_LIVENESS_TIMEOUT_SECS";
    pub const LIVENESS_INTERVAL_SECS: &str = "EDGETWIN_LIVENESS_INTERVAL_SECS";
    pub const PARALLEL_THRESHOLD: &str = "EDGETWIN_PARALLEL_THRESHOLD";
    pub const EVENT_CAPACITY: &str = "EDGETWIN_EVENT_CAPACITY";
    pub const LOG_JSON: &str = "EDGETWIN_LOG_JSON";

    /// Parse an environment variable, ignoring unset or malformed values.
    pub fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
        std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
    }
}

/// Offline detection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    /// Whether the liveness monitor should run at all
    pub enabled: bool,
    /// How often stale devices are looked for
    pub check_interval_secs: u64,
    /// Inactivity window before a device is marked offline
    pub offline_timeout_secs: u64,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: defaults::LIVENESS_CHECK_INTERVAL_SECS,
            offline_timeout_secs: defaults::LIVENESS_OFFLINE_TIMEOUT_SECS,
        }
    }
}

impl LivenessSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Offline window in milliseconds, matching twin timestamps.
    pub fn offline_timeout_millis(&self) -> i64 {
        (self.offline_timeout_secs as i64).saturating_mul(1000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub parallel_threshold: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            parallel_threshold: defaults::INGEST_PARALLEL_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub channel_capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSettings {
    pub max_diagnostics: usize,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            max_diagnostics: defaults::STATUS_MAX_DIAGNOSTICS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Emit JSON lines instead of compact text
    pub json: bool,
    /// `EnvFilter` directive used when RUST_LOG is unset
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            json: false,
            filter: defaults::LOG_FILTER.to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinConfig {
    pub liveness: LivenessSettings,
    pub ingest: IngestSettings,
    pub events: EventSettings,
    pub status: StatusSettings,
    pub logging: LoggingSettings,
}

impl TwinConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Optional file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay any environment variables that are set and parse.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_vars::parsed(env_vars::LIVENESS_TIMEOUT_SECS) {
            self.liveness.offline_timeout_secs = v;
        }
        if let Some(v) = env_vars::parsed(env_vars::LIVENESS_INTERVAL_SECS) {
            self.liveness.check_interval_secs = v;
        }
        if let Some(v) = env_vars::parsed(env_vars::PARALLEL_THRESHOLD) {
            self.ingest.parallel_threshold = v;
        }
        if let Some(v) = env_vars::parsed(env_vars::EVENT_CAPACITY) {
            self.events.channel_capacity = v;
        }
        if let Some(v) = env_vars::parsed(env_vars::LOG_JSON) {
            self.logging.json = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.liveness.check_interval_secs == 0 {
            return Err(Error::Config(
                "liveness.check_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.liveness.offline_timeout_secs == 0 {
            return Err(Error::Config(
                "liveness.offline_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(Error::Config(
                "events.channel_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TwinConfig::default();
        assert_eq!(config.liveness.offline_timeout_secs, 300);
        assert_eq!(config.liveness.offline_timeout_millis(), 300_000);
        assert_eq!(config.ingest.parallel_threshold, 8);
        assert!(!config.logging.json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TwinConfig::from_toml_str(
            r#"
            [liveness]
            offline_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.liveness.offline_timeout_secs, 60);
        assert_eq!(config.liveness.check_interval_secs, 30);
        assert_eq!(config.events.channel_capacity, 1000);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = TwinConfig::from_toml_str("[liveness]\ncheck_interval_secs = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(TwinConfig::from_toml_str("[liveness\n").is_err());
    }
}
