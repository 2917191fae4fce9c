use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::device::DeviceInfo;
use crate::backend::registry::{snapshot_drivers, DriverEntry};
use crate::error::{Result, RuntimeError};
use crate::runtime::device::DeviceHandle;
use crate::runtime::query::DeviceQuery;

/// Instance construction options.
#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    /// Restrict the instance to these drivers. `None` keeps every registered driver.
    pub drivers: Option<Vec<String>>,
}

impl InstanceOptions {
    pub fn with_drivers<I, S>(drivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            drivers: Some(drivers.into_iter().map(Into::into).collect()),
        }
    }
}

pub(crate) struct InstanceShared {
    drivers: BTreeMap<String, DriverEntry>,
}

/// Process-level runtime context owning the set of available drivers.
///
/// Cheap to clone. Devices resolved from an instance keep its driver table alive, so the
/// instance value itself may be dropped before them.
#[derive(Clone)]
pub struct Instance {
    shared: Arc<InstanceShared>,
}

impl Instance {
    /// Snapshot of the global driver registry filtered by `options`.
    ///
    /// Requested drivers that are not registered are skipped; an instance with no drivers is
    /// valid and fails every resolve.
    pub fn new(options: InstanceOptions) -> Result<Self> {
        let mut drivers = snapshot_drivers();
        if let Some(wanted) = &options.drivers {
            for name in wanted.iter().filter(|name| !drivers.contains_key(*name)) {
                warn!(driver = %name, "requested driver is not registered");
            }
            drivers.retain(|name, _| wanted.iter().any(|w| w == name));
        }
        info!(drivers = %join(drivers.keys()), "created instance");
        Ok(Self {
            shared: Arc::new(InstanceShared { drivers }),
        })
    }

    pub fn with_all_drivers() -> Result<Self> {
        Self::new(InstanceOptions::default())
    }

    /// Driver names known to this instance, sorted.
    pub fn drivers(&self) -> Vec<String> {
        self.shared.drivers.keys().cloned().collect()
    }

    pub fn has_driver(&self, name: &str) -> bool {
        self.shared.drivers.contains_key(name)
    }

    /// Every device every driver currently enumerates.
    pub fn available_devices(&self) -> Vec<DeviceInfo> {
        self.shared
            .drivers
            .values()
            .flat_map(DriverEntry::enumerate)
            .collect()
    }

    /// Resolves a query string (`local-task`, `accel:1`, `accel@0x2`, `accel://path`) to a
    /// freshly opened device.
    pub fn resolve_device(&self, query: &str) -> Result<DeviceHandle> {
        let parsed =
            DeviceQuery::parse(query).map_err(|reason| RuntimeError::device_not_found(query, reason))?;
        let entry = self.shared.drivers.get(&parsed.driver).ok_or_else(|| {
            RuntimeError::device_not_found(
                query,
                format!(
                    "no driver named `{}` (available: {})",
                    parsed.driver,
                    join(self.shared.drivers.keys())
                ),
            )
        })?;
        let devices = entry.enumerate();
        let info = parsed.select(&devices).cloned().ok_or_else(|| {
            RuntimeError::device_not_found(
                query,
                format!(
                    "driver `{}` has {} device(s), none matching",
                    parsed.driver,
                    devices.len()
                ),
            )
        })?;
        let backend = entry
            .open(&info)
            .map_err(|err| RuntimeError::device_not_found(query, err.to_string()))?;
        debug!(%query, device = %info, "resolved device");
        Ok(DeviceHandle::new(info, backend, Arc::clone(&self.shared)))
    }

    /// Number of live references to the instance's driver table, this one included.
    pub fn outstanding_references(&self) -> usize {
        Arc::strong_count(&self.shared)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("drivers", &self.drivers())
            .finish()
    }
}

fn join<'a>(names: impl Iterator<Item = &'a String>) -> String {
    let names: Vec<&str> = names.map(String::as_str).collect();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}
