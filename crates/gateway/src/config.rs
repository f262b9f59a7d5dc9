use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Gateway runtime configuration.
/// Every field is optional in YAML; defaults reproduce the stock build.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Connections served before the gateway shuts down
    pub max_connections: usize,
    /// Per-field receive timeout on sensor connections
    pub receive_timeout_secs: u64,
    pub analyzer: AnalyzerConfig,
    pub storage: StorageConfig,
    /// Event log output path
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Path of the room/sensor mapping file
    pub sensor_map: PathBuf,
    /// Number of values in each running-average window
    pub window_length: usize,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub poll_interval_micros: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_file: PathBuf,
    pub poll_interval_micros: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: 3,
            receive_timeout_secs: 5,
            analyzer: AnalyzerConfig::default(),
            storage: StorageConfig::default(),
            log_file: PathBuf::from("gateway.log"),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sensor_map: PathBuf::from("room_sensor.map"),
            window_length: 5,
            min_temperature: 10.0,
            max_temperature: 25.0,
            poll_interval_micros: 1,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("data.csv"),
            poll_interval_micros: 10,
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if self.receive_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "receive_timeout_secs must be greater than zero".to_string(),
            ));
        }
        self.analyzer.validate()
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_length == 0 {
            return Err(ConfigError::Invalid(
                "window_length must be greater than zero".to_string(),
            ));
        }
        if self.min_temperature > self.max_temperature {
            return Err(ConfigError::Invalid(format!(
                "min_temperature {} exceeds max_temperature {}",
                self.min_temperature, self.max_temperature
            )));
        }
        Ok(())
    }

    /// Value every window starts with, halfway between the bounds
    pub fn seed_value(&self) -> f64 {
        (self.min_temperature + self.max_temperature) / 2.0
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_micros)
    }
}

impl StorageConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_micros)
    }
}
