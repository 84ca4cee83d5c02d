//! Driver discovery.
//!
//! Maps a driver name to a factory building the driver from its
//! [`ConnectionConfig`]. A process-wide registry can be installed once at
//! startup; until then [`global`] serves the built-in drivers.

use crate::config::ConnectionConfig;
use crate::drivers::graphite::{self, GraphiteDriver};
use crate::drivers::influxdb::{self, InfluxDriver};
use crate::drivers::null::{self, NullDriver};
use crate::drivers::rrd::{self, RrdDriver};
use crate::drivers::Driver;
use crate::error::{Error, Result};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds a driver from resolved connection settings.
pub type DriverFactory = fn(&ConnectionConfig) -> Result<Arc<dyn Driver>>;

static GLOBAL: OnceCell<DriverRegistry> = OnceCell::new();

#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `influxdb`, `rrd`, `graphite` and `null`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_driver(influxdb::DRIVER_NAME, InfluxDriver::from_config);
        registry.register_driver(rrd::DRIVER_NAME, RrdDriver::from_config);
        registry.register_driver(graphite::DRIVER_NAME, GraphiteDriver::from_config);
        registry.register_driver(null::DRIVER_NAME, NullDriver::from_config);
        registry
    }

    /// Adds or replaces a factory. Returns the factory previously registered
    /// under `name`, if any.
    pub fn register_driver(&mut self, name: impl Into<String>, factory: DriverFactory) -> Option<DriverFactory> {
        let name = name.into();
        debug!(driver = %name, "registering driver");
        self.factories.insert(name, factory)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Builds the driver named by `config.driver`.
    pub fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Driver>> {
        let factory = self.factories.get(&config.driver).ok_or_else(|| {
            Error::Configuration(format!(
                "unknown driver '{}' (available: {})",
                config.driver,
                self.names().join(", ")
            ))
        })?;
        let driver = factory(config)?;
        info!(driver = %config.driver, "created driver");
        Ok(driver)
    }
}

/// Installs the process-wide registry. Fails if one is already installed.
pub fn install(registry: DriverRegistry) -> Result<()> {
    GLOBAL
        .set(registry)
        .map_err(|_| Error::Configuration("driver registry already installed".to_string()))
}

/// The installed registry, or the built-ins when nothing was installed.
pub fn global() -> &'static DriverRegistry {
    GLOBAL.get_or_init(DriverRegistry::with_builtins)
}
