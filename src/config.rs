//! Poller configuration.
//!
//! Settings come from an optional TOML file; every key has a default, so an
//! empty file (or no file) describes the charging evaluation board on
//! `/dev/ttyUSB0`. Command line flags are applied on top by the binary.
//!
//! ```toml
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! profile = "four-channel-voltage"
//! period_sec = 5.0
//! settle_ms = 100
//! failure_policy = "skip"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::client::{DEFAULT_BAUD_RATE, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SETTLE};
use crate::errors::DriverError;
use crate::measurement::DEFAULT_CAPACITY;
use crate::messenger::BoardProfile;
use crate::scheduler::FailurePolicy;

pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_PERIOD_SEC: f64 = 2.0;

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_period_sec() -> f64 {
    DEFAULT_PERIOD_SEC
}

fn default_settle_ms() -> u64 {
    DEFAULT_SETTLE.as_millis() as u64
}

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64
}

fn default_buffer_capacity() -> usize {
    DEFAULT_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollerConfig {
    /// Serial device of the board.
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Which firmware the board runs.
    #[serde(default)]
    pub profile: BoardProfile,
    /// Timer period in seconds.
    #[serde(default = "default_period_sec")]
    pub period_sec: f64,
    /// Wait between request and reply, in milliseconds.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Samples per channel (the ring keeps one more).
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Fallback log level when neither `DAS_LOG` nor `RUST_LOG` is set.
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            profile: BoardProfile::default(),
            period_sec: default_period_sec(),
            settle_ms: default_settle_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            buffer_capacity: default_buffer_capacity(),
            failure_policy: FailurePolicy::default(),
            log_level: None,
        }
    }
}

impl PollerConfig {
    /// Read and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), DriverError> {
        if !(self.period_sec.is_finite() && self.period_sec > 0.0) {
            return Err(DriverError::Config(format!(
                "period_sec must be positive, got {}",
                self.period_sec
            )));
        }
        if Duration::try_from_secs_f64(self.period_sec).is_err() {
            return Err(DriverError::Config(format!(
                "period_sec {} is too large",
                self.period_sec
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(DriverError::Config("buffer_capacity must be at least 1".into()));
        }
        if self.baud_rate == 0 {
            return Err(DriverError::Config("baud_rate must be non-zero".into()));
        }
        if self.port.trim().is_empty() {
            return Err(DriverError::Config("port must not be empty".into()));
        }
        Ok(())
    }

    /// Timer period; falls back to the default for values `validate` rejects.
    pub fn period(&self) -> Duration {
        Duration::try_from_secs_f64(self.period_sec)
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_PERIOD_SEC))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = PollerConfig::from_toml("").unwrap();
        assert_eq!(config, PollerConfig::default());
        assert_eq!(config.period(), Duration::from_secs(2));
        assert_eq!(config.settle(), Duration::from_millis(100));
        assert_eq!(config.profile, BoardProfile::ChargingEvaluation);
    }

    #[test]
    fn parses_profile_and_policy_names() {
        let config = PollerConfig::from_toml(
            r#"
            profile = "four-channel-voltage"
            failure_policy = "record-zero"
            period_sec = 5.0
            buffer_capacity = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.profile, BoardProfile::FourChannelVoltage);
        assert_eq!(config.failure_policy, FailurePolicy::RecordZero);
        assert_eq!(config.period(), Duration::from_secs(5));
        assert_eq!(config.buffer_capacity, 50);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(PollerConfig::from_toml("period_sec = 0.0").is_err());
        assert!(PollerConfig::from_toml("period_sec = -1.0").is_err());
        assert!(PollerConfig::from_toml("buffer_capacity = 0").is_err());
        assert!(PollerConfig::from_toml("profile = \"toaster\"").is_err());
        assert!(PollerConfig::from_toml("portt = \"/dev/ttyACM0\"").is_err());
    }

    #[test]
    fn rejects_period_beyond_duration_range() {
        let err = PollerConfig::from_toml("period_sec = 1e20").unwrap_err();
        assert!(err.to_string().contains("too large"), "{err:#}");

        let config = PollerConfig {
            period_sec: 1e20,
            ..PollerConfig::default()
        };
        assert!(matches!(config.validate(), Err(DriverError::Config(_))));
        assert_eq!(config.period(), Duration::from_secs(2));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"/dev/ttyACM0\"").unwrap();
        writeln!(file, "profile = \"temperature\"").unwrap();
        writeln!(file, "log_level = \"debug\"").unwrap();

        let config = PollerConfig::load(file.path()).unwrap();
        assert_eq!(config.port, "/dev/ttyACM0");
        assert_eq!(config.profile, BoardProfile::Temperature);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = PollerConfig::load(Path::new("/nonexistent/das.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/das.toml"));
    }
}
