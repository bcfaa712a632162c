//! Meter configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding [`MeterConfig::refresh_interval`], in milliseconds.
pub const ENV_REFRESH_INTERVAL_MS: &str = "METER_REFRESH_INTERVAL_MS";

const DEFAULT_REFRESH_INTERVAL_MS: u64 = 60_000;

/// Runtime settings of a [`Meterer`](crate::Meterer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfig {
    /// How often the background refresher asks the provider to refresh.
    #[serde(rename = "refresh_interval_ms", with = "duration_ms")]
    pub refresh_interval: Duration,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(DEFAULT_REFRESH_INTERVAL_MS),
        }
    }
}

/// Invalid meter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable held an unparsable value.
    #[error("invalid value for {name}: {value}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value found.
        value: String,
    },
    /// The refresh interval was zero.
    #[error("refresh interval must be greater than zero")]
    ZeroRefreshInterval,
    /// The JSON document could not be decoded.
    #[error("config decode error: {0}")]
    Decode(String),
}

impl MeterConfig {
    /// Defaults overridden by `METER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(raw) = env::var(ENV_REFRESH_INTERVAL_MS) {
            let millis = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_REFRESH_INTERVAL_MS,
                    value: raw.clone(),
                })?;
            config.refresh_interval = Duration::from_millis(millis);
        }
        config.validate()?;
        Ok(config)
    }

    /// Decodes and validates a JSON document such as `{"refresh_interval_ms": 5000}`.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(contents).map_err(|err| ConfigError::Decode(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides the refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Checks the settings are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroRefreshInterval);
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
