//! Driver factory
//!
//! Maps a driver type name to a constructor. Registrations are unique and
//! the registry is safe for concurrent use.

use std::collections::HashMap;

use log::info;
use parking_lot::RwLock;

use crate::error::{DriverError, DriverResult};
use super::{DriverConfig, DriverHandle};

/// Constructor producing a driver capability record from its config.
pub type DriverConstructor =
    Box<dyn Fn(&DriverConfig) -> DriverResult<DriverHandle> + Send + Sync>;

pub struct DriverFactory {
    registry: RwLock<HashMap<String, DriverConstructor>>,
}

impl DriverFactory {
    pub fn new() -> Self {
        Self { registry: RwLock::new(HashMap::new()) }
    }

    /// Register a constructor for a driver type. Duplicate registrations
    /// fail.
    pub fn register(&self, driver_type: &str, constructor: DriverConstructor) -> DriverResult<()> {
        let mut registry = self.registry.write();
        if registry.contains_key(driver_type) {
            return Err(DriverError::Config(format!(
                "driver type {} already registered",
                driver_type
            )));
        }
        registry.insert(driver_type.to_string(), constructor);
        info!("factory: registered driver type '{}'", driver_type);
        Ok(())
    }

    /// Instantiate a driver of the given type.
    pub fn create(&self, driver_type: &str, config: &DriverConfig) -> DriverResult<DriverHandle> {
        let registry = self.registry.read();
        let constructor = registry
            .get(driver_type)
            .ok_or_else(|| DriverError::Config(format!("unknown driver type: {}", driver_type)))?;
        let handle = constructor(config)?;
        info!(
            "factory: created driver '{}' of type '{}'",
            config.name, driver_type
        );
        Ok(handle)
    }

    /// All registered type names.
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.registry.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for DriverFactory {
    fn default() -> Self {
        Self::new()
    }
}
