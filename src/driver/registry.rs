//! Process-wide driver registry
//!
//! A mapping from driver name to driver instance, initialized at first use
//! and never torn down. The built-in CPU driver registers itself during
//! initialization; external backends call [`register_driver`] when they
//! load. This map is the only process-wide mutable state the core keeps.

use super::Driver;
use crate::backend::cpu::CpuDriver;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

static REGISTRY: OnceLock<RwLock<HashMap<&'static str, Arc<dyn Driver>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<&'static str, Arc<dyn Driver>>> {
    REGISTRY.get_or_init(|| {
        let mut drivers: HashMap<&'static str, Arc<dyn Driver>> = HashMap::new();
        let cpu: Arc<dyn Driver> = Arc::new(CpuDriver::new());
        log::debug!("registering built-in driver '{}'", cpu.name());
        drivers.insert(cpu.name(), cpu);
        RwLock::new(drivers)
    })
}

/// Register a driver under its own name, replacing any previous entry
pub fn register_driver(driver: Arc<dyn Driver>) {
    let name = driver.name();
    let previous = registry().write().insert(name, driver);
    if previous.is_some() {
        log::warn!("driver '{name}' re-registered");
    } else {
        log::debug!("registered driver '{name}'");
    }
}

/// Look up a driver by name
pub fn driver(name: &str) -> Result<Arc<dyn Driver>> {
    registry()
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::UnknownDriver {
            name: name.to_string(),
        })
}

/// Names of all registered drivers
pub fn driver_names() -> Vec<&'static str> {
    registry().read().keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_driver_preregistered() {
        let cpu = driver("cpu").unwrap();
        assert_eq!(cpu.name(), "cpu");
        assert!(driver_names().contains(&"cpu"));
    }

    #[test]
    fn test_unknown_driver() {
        let err = driver("tpu").unwrap_err();
        assert!(matches!(err, Error::UnknownDriver { name } if name == "tpu"));
    }
}
