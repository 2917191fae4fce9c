//! Process-wide device driver registry.
//!
//! Drivers register an enumerator (which devices exist) and a constructor (open one of them)
//! under a driver name. Any crate can register; backend crates do so from a static initializer
//! on load. An [`Instance`](crate::runtime::Instance) takes a snapshot of the registry when it is
//! created and never consults the global table again.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::device::{DeviceBackend, DeviceInfo, DeviceWrapper, ErasedDevice};
use super::spec::BackendResult;

/// Lists the devices a driver can currently open.
pub type DeviceEnumerator = Arc<dyn Fn() -> Vec<DeviceInfo> + Send + Sync>;

/// Opens one enumerated device.
pub type DeviceConstructor =
    Arc<dyn Fn(&DeviceInfo) -> BackendResult<Box<dyn ErasedDevice>> + Send + Sync>;

/// Registered driver: enumerate + construct.
#[derive(Clone)]
pub struct DriverEntry {
    name: String,
    enumerate: DeviceEnumerator,
    construct: DeviceConstructor,
}

impl DriverEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enumerate(&self) -> Vec<DeviceInfo> {
        (self.enumerate)()
    }

    pub fn open(&self, info: &DeviceInfo) -> BackendResult<Box<dyn ErasedDevice>> {
        (self.construct)(info)
    }
}

impl std::fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct DriverRegistry {
    drivers: RwLock<BTreeMap<String, DriverEntry>>,
}

impl DriverRegistry {
    fn new() -> Self {
        Self {
            drivers: RwLock::new(BTreeMap::new()),
        }
    }

    fn register(&self, entry: DriverEntry) {
        self.drivers.write().insert(entry.name.clone(), entry);
    }

    fn snapshot(&self) -> BTreeMap<String, DriverEntry> {
        self.drivers.read().clone()
    }

    fn list_drivers(&self) -> Vec<String> {
        self.drivers.read().keys().cloned().collect()
    }

    fn has_driver(&self, name: &str) -> bool {
        self.drivers.read().contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();

fn global_registry() -> &'static DriverRegistry {
    GLOBAL_REGISTRY.get_or_init(DriverRegistry::new)
}

/// Register a driver by name. Re-registering a name replaces the previous entry.
///
/// # Example
/// ```ignore
/// use tandem::backend::registry::register_driver;
///
/// pub fn register() {
///     register_driver("my-driver", enumerate_devices, |info| {
///         Ok(Box::new(DeviceWrapper::new(MyDevice::open(info)?)))
///     });
/// }
/// ```
pub fn register_driver<E, F>(name: impl Into<String>, enumerate: E, construct: F)
where
    E: Fn() -> Vec<DeviceInfo> + Send + Sync + 'static,
    F: Fn(&DeviceInfo) -> BackendResult<Box<dyn ErasedDevice>> + Send + Sync + 'static,
{
    global_registry().register(DriverEntry {
        name: name.into(),
        enumerate: Arc::new(enumerate),
        construct: Arc::new(construct),
    });
}

/// Register a concrete [`DeviceBackend`] implementation.
///
/// Convenience wrapper that handles the [`DeviceWrapper`] boilerplate.
pub fn register_device_driver<D, E, F>(name: impl Into<String>, enumerate: E, construct: F)
where
    D: DeviceBackend + 'static,
    E: Fn() -> Vec<DeviceInfo> + Send + Sync + 'static,
    F: Fn(&DeviceInfo) -> BackendResult<D> + Send + Sync + 'static,
{
    register_driver(name, enumerate, move |info| {
        let device = construct(info)?;
        Ok(Box::new(DeviceWrapper::new(device)) as Box<dyn ErasedDevice>)
    });
}

/// Copy of every registered driver at this moment.
pub fn snapshot_drivers() -> BTreeMap<String, DriverEntry> {
    global_registry().snapshot()
}

/// List all registered driver names, sorted.
pub fn list_drivers() -> Vec<String> {
    global_registry().list_drivers()
}

pub fn has_driver(name: &str) -> bool {
    global_registry().has_driver(name)
}

/// Builds the single [`DeviceInfo`] for drivers that expose exactly one device.
pub fn single_device(driver: &str, name: &str) -> DeviceInfo {
    DeviceInfo {
        driver: driver.to_string(),
        ordinal: 0,
        id: 0,
        path: String::new(),
        name: name.to_string(),
    }
}
