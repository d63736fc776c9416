//! Engine configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQ_STREAM_`, nested keys separated
//!    by `__` (for example `DAQ_STREAM_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use daq_stream::config::EngineConfig;
//!
//! let config = EngineConfig::load_from("config/daq-stream.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), daq_stream::config::ConfigError>(())
//! ```

use crate::signal::StreamTiming;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq-stream.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "DAQ_STREAM_";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or merged
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// `application.log_level` is not a level name
    #[error("Invalid log_level '{level}'. Must be one of: {allowed}")]
    InvalidLogLevel {
        /// Configured value
        level: String,
        /// Accepted names
        allowed: String,
    },

    /// Two devices share an ident
    #[error("Duplicate device ident: {0}")]
    DuplicateDevice(String),

    /// `start_source` does not name a configured input
    #[error("Device '{device}' names unknown start source '{source_ident}'")]
    UnknownStartSource {
        /// Device ident
        device: String,
        /// Configured start source
        source_ident: String,
    },

    /// `inherit_rate` set without `start_source`
    #[error("Device '{0}' inherits a sample rate but has no start source")]
    InheritWithoutSource(String),

    /// Update interval out of range
    #[error("update_time {update:?} must be positive and at most half of buffer_time {buffer:?}")]
    InvalidTiming {
        /// Configured update interval
        update: Duration,
        /// Configured buffer length
        buffer: Duration,
    },

    /// Trace subscriber queues cannot be empty
    #[error("subscriber_capacity must be at least 1")]
    InvalidSubscriberCapacity,
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Streaming defaults for every trial
    #[serde(default)]
    pub acquire: AcquireConfig,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default)]
    pub log_format: crate::logging::OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: crate::logging::OutputFormat::default(),
        }
    }
}

/// Streaming defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireConfig {
    /// Software ring buffer length in time
    #[serde(with = "humantime_serde", default = "default_buffer_time")]
    pub buffer_time: Duration,
    /// Pump wake-up interval
    #[serde(with = "humantime_serde", default = "default_update_time")]
    pub update_time: Duration,
    /// How long `wait` blocks before giving up
    #[serde(with = "humantime_serde", default = "default_wait_timeout")]
    pub wait_timeout: Duration,
    /// Queue length of sample batch subscribers
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            buffer_time: default_buffer_time(),
            update_time: default_update_time(),
            wait_timeout: default_wait_timeout(),
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

impl AcquireConfig {
    /// Stream timing of every signal list.
    pub fn timing(&self) -> StreamTiming {
        StreamTiming::new(self.buffer_time, self.update_time)
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier
    pub ident: String,
    /// Backend driver type (e.g. "sim_input", "sim_output")
    #[serde(rename = "type")]
    pub driver: String,
    /// Device path handed to the backend
    pub path: String,
    /// Whether this device is opened
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Ident of the input device whose start trigger starts this one
    #[serde(default)]
    pub start_source: Option<String>,
    /// Whether to run at the start source's sample rate
    #[serde(default)]
    pub inherit_rate: bool,
    /// Backend-specific options (dynamic)
    #[serde(default = "empty_table")]
    pub options: toml::Value,
}

impl DeviceConfig {
    /// Device entry without sync declarations or backend options.
    pub fn new(ident: impl Into<String>, driver: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            driver: driver.into(),
            path: path.into(),
            enabled: true,
            start_source: None,
            inherit_rate: false,
            options: empty_table(),
        }
    }

    /// Starts the device from the trigger of input `ident`.
    pub fn with_start_source(mut self, ident: impl Into<String>, inherit_rate: bool) -> Self {
        self.start_source = Some(ident.into());
        self.inherit_rate = inherit_rate;
        self
    }

    /// Replaces the backend options table.
    pub fn with_options(mut self, options: toml::Value) -> Self {
        self.options = options;
        self
    }
}

// Default value functions
fn default_name() -> String {
    "daq-stream".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_buffer_time() -> Duration {
    Duration::from_secs(1)
}

fn default_update_time() -> Duration {
    Duration::from_millis(100)
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_subscriber_capacity() -> usize {
    64
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl EngineConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel {
                level: self.application.log_level.clone(),
                allowed: valid_levels.join(", "),
            });
        }

        let acquire = &self.acquire;
        if acquire.update_time.is_zero() || acquire.update_time > acquire.buffer_time / 2 {
            return Err(ConfigError::InvalidTiming {
                update: acquire.update_time,
                buffer: acquire.buffer_time,
            });
        }
        if acquire.subscriber_capacity == 0 {
            return Err(ConfigError::InvalidSubscriberCapacity);
        }

        let mut idents = HashSet::new();
        for device in &self.devices {
            if !idents.insert(device.ident.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.ident.clone()));
            }
        }

        let enabled: HashSet<&str> = self
            .enabled_devices()
            .into_iter()
            .map(|d| d.ident.as_str())
            .collect();
        for device in self.enabled_devices() {
            match &device.start_source {
                Some(source) if !enabled.contains(source.as_str()) => {
                    return Err(ConfigError::UnknownStartSource {
                        device: device.ident.clone(),
                        source_ident: source.clone(),
                    });
                }
                None if device.inherit_rate => {
                    return Err(ConfigError::InheritWithoutSource(device.ident.clone()));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Get all enabled devices
    pub fn enabled_devices(&self) -> Vec<&DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }

    /// Entry with the given ident, if configured.
    pub fn device(&self, ident: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.ident == ident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [application]
        name = "rig-2"
        log_level = "debug"

        [acquire]
        buffer_time = "500ms"
        update_time = "50ms"

        [[devices]]
        ident = "ai"
        type = "sim_input"
        path = "sim/ai0"

        [[devices]]
        ident = "ao"
        type = "sim_output"
        path = "sim/ao0"
        start_source = "ai"
        inherit_rate = true

        [devices.options]
        mode = "realistic"
        fifo_size = 512
    "#;

    #[test]
    fn test_parse_sample() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "rig-2");
        assert_eq!(config.acquire.update_time, Duration::from_millis(50));
        assert_eq!(config.acquire.wait_timeout, Duration::from_secs(30));
        assert_eq!(config.devices.len(), 2);

        let ao = config.device("ao").unwrap();
        assert_eq!(ao.driver, "sim_output");
        assert_eq!(ao.start_source.as_deref(), Some("ai"));
        assert_eq!(ao.options.get("fifo_size").and_then(|v| v.as_integer()), Some(512));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_without_file_content() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.acquire.buffer_time, Duration::from_secs(1));
        assert!(config.devices.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = EngineConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel { .. })
        ));
    }

    #[test]
    fn test_invalid_timing() {
        let mut config = EngineConfig::default();
        config.acquire.update_time = Duration::from_millis(600);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTiming { .. })
        ));
    }

    #[test]
    fn test_duplicate_device_idents() {
        let config = EngineConfig {
            devices: vec![
                DeviceConfig::new("a", "sim_input", "sim/ai0"),
                DeviceConfig::new("a", "sim_output", "sim/ao0"),
            ],
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateDevice(ident)) if ident == "a"
        ));
    }

    #[test]
    fn test_unknown_or_disabled_start_source() {
        let mut input = DeviceConfig::new("ai", "sim_input", "sim/ai0");
        input.enabled = false;
        let config = EngineConfig {
            devices: vec![
                input,
                DeviceConfig::new("ao", "sim_output", "sim/ao0").with_start_source("ai", false),
            ],
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownStartSource { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_load_from_file_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        std::env::set_var("DAQ_STREAM_APPLICATION__LOG_LEVEL", "warn");
        let loaded = EngineConfig::load_from(file.path());
        std::env::remove_var("DAQ_STREAM_APPLICATION__LOG_LEVEL");

        let config = loaded.unwrap();
        assert_eq!(config.application.log_level, "warn");
        assert_eq!(config.application.name, "rig-2");
    }

    #[test]
    #[serial]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.name, "daq-stream");
    }
}
