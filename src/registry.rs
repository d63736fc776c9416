//! Explicit device registry.
//!
//! The registry is built at startup and passed to whatever needs devices;
//! nothing registers itself globally.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                DeviceRegistry                │
//! │  factories: "sim_input" ─▶ SimInputFactory   │
//! │             "sim_output" ─▶ SimOutputFactory │
//! │  devices:   ai ─▶ Arc<AnalogDevice>          │
//! │             ao ─▶ Arc<AnalogDevice>          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use daq_stream::config::DeviceConfig;
//! use daq_stream::registry::{register_builtin, DeviceRegistry};
//!
//! let mut registry = DeviceRegistry::new();
//! register_builtin(&mut registry);
//!
//! let ai = registry
//!     .open_device(&DeviceConfig::new("ai", "sim_input", "sim/ai0"))
//!     .unwrap();
//! assert!(ai.is_open());
//! assert_eq!(registry.inputs().len(), 1);
//! ```

use crate::config::DeviceConfig;
use crate::device::{AnalogDevice, Backend};
use crate::error::DeviceError;
use crate::signal::Direction;
use crate::sim::{SimConfig, SimInput, SimOutput};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No factory for the configured `type`
    #[error("Unknown driver type '{driver}' for device '{ident}'")]
    UnknownDriver {
        /// Device ident
        ident: String,
        /// Configured driver type
        driver: String,
    },

    /// Ident already taken
    #[error("Device '{0}' is already registered")]
    DuplicateDevice(String),

    /// Backend options rejected by the factory
    #[error("Invalid options for '{driver}': {message}")]
    InvalidOptions {
        /// Driver type
        driver: String,
        /// Deserializer or validation message
        message: String,
    },

    /// No device with this ident
    #[error("Device '{0}' not found")]
    NotFound(String),

    /// Opening a device failed
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Builds backends of one driver type.
pub trait BackendFactory: Send + Sync + 'static {
    /// Driver type name used in the configuration `type` field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for listings and error messages.
    fn name(&self) -> &'static str;

    /// Stream direction of every backend this factory builds.
    fn direction(&self) -> Direction;

    /// Checks backend options without building anything.
    fn validate(&self, _options: &toml::Value) -> Result<(), RegistryError> {
        Ok(())
    }

    /// Builds a closed backend from validated options.
    fn build(&self, options: &toml::Value) -> Result<Box<dyn Backend>, RegistryError>;
}

/// Summary of a registered device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Device ident
    pub ident: String,
    /// Driver type
    pub driver: String,
    /// Backend path
    pub path: String,
    /// Stream direction
    pub direction: Direction,
    /// [`AnalogDevice::info`] of the open device
    pub info: String,
}

struct Entry {
    config: DeviceConfig,
    device: Arc<AnalogDevice>,
}

/// Factories plus the devices opened through them, in open order.
#[derive(Default)]
pub struct DeviceRegistry {
    factories: HashMap<&'static str, Box<dyn BackendFactory>>,
    devices: Vec<Entry>,
}

impl DeviceRegistry {
    /// Registry without factories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a factory; a later factory for the same type replaces the earlier.
    pub fn register_factory(&mut self, factory: Box<dyn BackendFactory>) {
        let driver = factory.driver_type();
        if self.factories.insert(driver, factory).is_some() {
            warn!(driver, "Replaced backend factory");
        } else {
            debug!(driver, "Registered backend factory");
        }
    }

    /// Registered driver types, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Builds, opens and registers the device described by `config`.
    pub fn open_device(&mut self, config: &DeviceConfig) -> Result<Arc<AnalogDevice>, RegistryError> {
        if self.contains(&config.ident) {
            return Err(RegistryError::DuplicateDevice(config.ident.clone()));
        }
        let factory =
            self.factories
                .get(config.driver.as_str())
                .ok_or_else(|| RegistryError::UnknownDriver {
                    ident: config.ident.clone(),
                    driver: config.driver.clone(),
                })?;

        factory.validate(&config.options)?;
        let backend = factory.build(&config.options)?;
        let device = Arc::new(AnalogDevice::new(config.ident.clone(), backend));
        device.open(&config.path)?;

        info!(
            device = %config.ident,
            driver = %config.driver,
            path = %config.path,
            "Registered device"
        );
        self.devices.push(Entry {
            config: config.clone(),
            device: Arc::clone(&device),
        });
        Ok(device)
    }

    /// Opens every enabled device in `configs`, stopping at the first failure.
    pub fn open_all<'a>(
        &mut self,
        configs: impl IntoIterator<Item = &'a DeviceConfig>,
    ) -> Result<usize, RegistryError> {
        let mut opened = 0;
        for config in configs.into_iter().filter(|c| c.enabled) {
            self.open_device(config)?;
            opened += 1;
        }
        Ok(opened)
    }

    /// Device with the given ident.
    pub fn get(&self, ident: &str) -> Option<Arc<AnalogDevice>> {
        self.entry(ident).map(|e| Arc::clone(&e.device))
    }

    /// Configuration the device was registered with.
    pub fn config(&self, ident: &str) -> Option<&DeviceConfig> {
        self.entry(ident).map(|e| &e.config)
    }

    /// Whether `ident` is registered.
    pub fn contains(&self, ident: &str) -> bool {
        self.entry(ident).is_some()
    }

    /// Input devices in open order.
    pub fn inputs(&self) -> Vec<Arc<AnalogDevice>> {
        self.by_direction(Direction::Input)
    }

    /// Output devices in open order.
    pub fn outputs(&self) -> Vec<Arc<AnalogDevice>> {
        self.by_direction(Direction::Output)
    }

    /// Summaries of every device, in open order.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .map(|e| DeviceInfo {
                ident: e.config.ident.clone(),
                driver: e.config.driver.clone(),
                path: e.config.path.clone(),
                direction: e.device.direction(),
                info: e.device.info(),
            })
            .collect()
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// No device registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Closes and forgets every device.
    pub fn close_all(&mut self) {
        for entry in self.devices.drain(..) {
            entry.device.close();
        }
    }

    fn entry(&self, ident: &str) -> Option<&Entry> {
        self.devices.iter().find(|e| e.config.ident == ident)
    }

    fn by_direction(&self, direction: Direction) -> Vec<Arc<AnalogDevice>> {
        self.devices
            .iter()
            .filter(|e| e.device.direction() == direction)
            .map(|e| Arc::clone(&e.device))
            .collect()
    }
}

fn sim_config(driver: &str, options: &toml::Value) -> Result<SimConfig, RegistryError> {
    options
        .clone()
        .try_into()
        .map_err(|e: toml::de::Error| RegistryError::InvalidOptions {
            driver: driver.to_string(),
            message: e.to_string(),
        })
}

/// Factory for [`SimInput`] boards.
pub struct SimInputFactory;

impl BackendFactory for SimInputFactory {
    fn driver_type(&self) -> &'static str {
        "sim_input"
    }

    fn name(&self) -> &'static str {
        "Simulated analog input"
    }

    fn direction(&self) -> Direction {
        Direction::Input
    }

    fn validate(&self, options: &toml::Value) -> Result<(), RegistryError> {
        sim_config(self.driver_type(), options).map(|_| ())
    }

    fn build(&self, options: &toml::Value) -> Result<Box<dyn Backend>, RegistryError> {
        Ok(Box::new(SimInput::new(sim_config(self.driver_type(), options)?)))
    }
}

/// Factory for [`SimOutput`] boards.
pub struct SimOutputFactory;

impl BackendFactory for SimOutputFactory {
    fn driver_type(&self) -> &'static str {
        "sim_output"
    }

    fn name(&self) -> &'static str {
        "Simulated analog output"
    }

    fn direction(&self) -> Direction {
        Direction::Output
    }

    fn validate(&self, options: &toml::Value) -> Result<(), RegistryError> {
        sim_config(self.driver_type(), options).map(|_| ())
    }

    fn build(&self, options: &toml::Value) -> Result<Box<dyn Backend>, RegistryError> {
        Ok(Box::new(SimOutput::new(sim_config(self.driver_type(), options)?)))
    }
}

/// Installs the built-in simulated board factories.
pub fn register_builtin(registry: &mut DeviceRegistry) {
    registry.register_factory(Box::new(SimInputFactory));
    registry.register_factory(Box::new(SimOutputFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tracing_test::traced_test;

    fn registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        register_builtin(&mut registry);
        registry
    }

    #[test]
    #[traced_test]
    fn test_replacing_a_factory_is_logged() {
        let mut registry = registry();
        registry.register_factory(Box::new(SimInputFactory));
        assert_eq!(registry.driver_types().len(), 2);
        assert!(logs_contain("Replaced backend factory"));
    }

    #[test]
    fn test_builtin_factories() {
        let registry = registry();
        assert_eq!(registry.driver_types(), vec!["sim_input", "sim_output"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_open_and_lookup() {
        let mut registry = registry();
        let configs = vec![
            DeviceConfig::new("ai", "sim_input", "sim/ai0"),
            DeviceConfig::new("ao", "sim_output", "sim/ao0"),
        ];
        assert_eq!(registry.open_all(&configs).unwrap(), 2);

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("ai"));
        assert_eq!(registry.inputs().len(), 1);
        assert_eq!(registry.outputs()[0].ident(), "ao");
        assert_eq!(registry.config("ao").unwrap().path, "sim/ao0");

        let listing = registry.list_devices();
        assert_eq!(listing[0].direction, Direction::Input);
        assert!(listing[0].info.starts_with("channels: 4"));

        registry.close_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_driver_and_duplicates() {
        let mut registry = registry();
        assert!(matches!(
            registry.open_device(&DeviceConfig::new("x", "comedi", "/dev/comedi0")),
            Err(RegistryError::UnknownDriver { .. })
        ));

        registry
            .open_device(&DeviceConfig::new("ai", "sim_input", "sim/ai0"))
            .unwrap();
        assert!(matches!(
            registry.open_device(&DeviceConfig::new("ai", "sim_input", "sim/ai1")),
            Err(RegistryError::DuplicateDevice(ident)) if ident == "ai"
        ));
    }

    #[test]
    fn test_options_are_parsed() {
        let mut registry = registry();
        let options: toml::Value = toml::from_str("channels = 2\nmode = \"realistic\"").unwrap();
        let ai = registry
            .open_device(&DeviceConfig::new("ai", "sim_input", "sim/ai0").with_options(options))
            .unwrap();
        assert_eq!(ai.channels(), 2);

        let bad: toml::Value = toml::from_str("channels = \"many\"").unwrap();
        assert!(matches!(
            registry.open_device(&DeviceConfig::new("ao", "sim_output", "sim/ao0").with_options(bad)),
            Err(RegistryError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn test_open_failure_propagates() {
        let mut registry = registry();
        let options: toml::Value = toml::from_str("[faults]\nfail_open = true").unwrap();
        let err = registry
            .open_device(&DeviceConfig::new("ai", "sim_input", "sim/ai0").with_options(options))
            .unwrap_err();
        match err {
            RegistryError::Device(e) => assert_eq!(e.kind(), ErrorKind::NoDevice),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!registry.contains("ai"));
    }
}
