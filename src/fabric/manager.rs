//! Driver manager
//!
//! Owns the running driver instances by name. Start and stop go through an
//! exclusive lock on the instance map; lookups take it shared so calls into
//! distinct running drivers proceed concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info};
use parking_lot::RwLock;

use crate::error::{DriverError, DriverResult};
use super::{DriverConfig, DriverFactory, DriverHandle};

pub struct DriverManager {
    drivers: RwLock<HashMap<String, DriverHandle>>,
    factory: Arc<DriverFactory>,
}

impl DriverManager {
    pub fn new(factory: Arc<DriverFactory>) -> Self {
        Self { drivers: RwLock::new(HashMap::new()), factory }
    }

    /// Create, initialize and start a driver. Instance names are unique.
    pub fn start_driver(&self, driver_type: &str, config: &DriverConfig) -> DriverResult<()> {
        let mut drivers = self.drivers.write();
        if drivers.contains_key(&config.name) {
            return Err(DriverError::Config(format!(
                "driver {} already running",
                config.name
            )));
        }

        let handle = self.factory.create(driver_type, config)?;
        handle.driver().initialize(config)?;
        handle.driver().start()?;

        drivers.insert(config.name.clone(), handle);
        info!("manager: started driver '{}'", config.name);
        Ok(())
    }

    /// Stop a driver and forget it.
    pub fn stop_driver(&self, name: &str) -> DriverResult<()> {
        let mut drivers = self.drivers.write();
        let handle = drivers
            .remove(name)
            .ok_or_else(|| DriverError::NotFound(format!("driver {}", name)))?;
        handle.driver().stop()?;
        info!("manager: stopped driver '{}'", name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<DriverHandle> {
        self.drivers.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Best-effort shutdown of every driver. Per-driver failures are logged;
    /// the last error seen is returned.
    pub fn stop_all(&self) -> DriverResult<()> {
        let mut drivers = self.drivers.write();
        let mut last_err = Ok(());
        for (name, handle) in drivers.drain() {
            if let Err(err) = handle.driver().stop() {
                error!("manager: error stopping {}: {}", name, err);
                last_err = Err(err);
            }
        }
        last_err
    }
}
