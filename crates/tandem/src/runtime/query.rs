//! Device query strings.
//!
//! Accepted forms:
//! - `driver` selects the driver's first device
//! - `driver:N` selects ordinal `N`
//! - `driver@ID` selects the device whose id is `ID` (decimal or `0x` hex)
//! - `driver://PATH` selects by device path; an empty path means the first device

use std::fmt;

use crate::backend::device::DeviceInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Default,
    Ordinal(usize),
    Id(u64),
    Path(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceQuery {
    pub driver: String,
    pub selector: DeviceSelector,
}

impl DeviceQuery {
    pub fn parse(src: &str) -> Result<Self, String> {
        let src = src.trim();
        if src.is_empty() {
            return Err("device query is empty".to_string());
        }
        let (driver, selector) = if let Some((driver, path)) = src.split_once("://") {
            let selector = if path.is_empty() {
                DeviceSelector::Default
            } else {
                DeviceSelector::Path(path.to_string())
            };
            (driver, selector)
        } else if let Some((driver, id)) = src.split_once('@') {
            (driver, DeviceSelector::Id(parse_id(id)?))
        } else if let Some((driver, ordinal)) = src.split_once(':') {
            let ordinal = ordinal
                .parse::<usize>()
                .map_err(|_| format!("invalid device ordinal `{ordinal}`"))?;
            (driver, DeviceSelector::Ordinal(ordinal))
        } else {
            (src, DeviceSelector::Default)
        };
        if driver.is_empty() {
            return Err(format!("device query `{src}` has no driver name"));
        }
        if !driver
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(format!("invalid driver name `{driver}`"));
        }
        Ok(Self {
            driver: driver.to_string(),
            selector,
        })
    }

    /// Picks the matching device from a driver's enumeration.
    pub fn select<'a>(&self, devices: &'a [DeviceInfo]) -> Option<&'a DeviceInfo> {
        match &self.selector {
            DeviceSelector::Default => devices.first(),
            DeviceSelector::Ordinal(ordinal) => devices.iter().find(|d| d.ordinal == *ordinal),
            DeviceSelector::Id(id) => devices.iter().find(|d| d.id == *id),
            DeviceSelector::Path(path) => devices.iter().find(|d| &d.path == path),
        }
    }
}

fn parse_id(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    };
    parsed.map_err(|_| format!("invalid device id `{raw}`"))
}

impl fmt::Display for DeviceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            DeviceSelector::Default => write!(f, "{}", self.driver),
            DeviceSelector::Ordinal(ordinal) => write!(f, "{}:{ordinal}", self.driver),
            DeviceSelector::Id(id) => write!(f, "{}@{id:#x}", self.driver),
            DeviceSelector::Path(path) => write!(f, "{}://{path}", self.driver),
        }
    }
}
