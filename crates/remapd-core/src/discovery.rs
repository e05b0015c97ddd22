// Remapd Device Discovery
// Enumeration and selector matching for /dev/input event devices

use std::collections::HashSet;
use std::path::PathBuf;

use evdev::Device;

use crate::mapping::DeviceSelector;

/// Identity of a discovered input device, for the listing mode
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device node path
    pub path: String,
    /// Physical location string, if the device reports one
    pub phys: Option<String>,
    /// Kernel-reported device name
    pub name: String,
}

impl DeviceInfo {
    fn from_device(path: &std::path::Path, device: &Device) -> Self {
        Self {
            path: path.display().to_string(),
            phys: device.physical_path().map(str::to_string),
            name: device.name().unwrap_or("Unknown").to_string(),
        }
    }
}

/// List every enumerable event device
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices: Vec<DeviceInfo> = evdev::enumerate()
        .map(|(path, device)| DeviceInfo::from_device(&path, &device))
        .collect();
    // enumerate() walks in unspecified order; sort by node path for a
    // stable listing.
    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices
}

/// Find the node of the first device matching the selector, skipping
/// nodes already claimed by an active session. The session re-opens the
/// path itself; the enumeration handle is dropped here.
pub fn find_match(selector: &DeviceSelector, claimed: &HashSet<String>) -> Option<PathBuf> {
    for (path, device) in evdev::enumerate() {
        let path_str = path.display().to_string();
        if claimed.contains(&path_str) {
            continue;
        }
        if selector.matches(device.name(), device.physical_path(), &path_str) {
            log::debug!("selector [{selector}] matched {path_str}");
            return Some(path);
        }
    }
    None
}

/// Resolve one device by name, physical address, node path, or bare event
/// number. Used by the read-events authoring mode.
pub fn resolve(query: &str) -> Option<(PathBuf, Device)> {
    for (path, device) in evdev::enumerate() {
        let path_str = path.display().to_string();
        let number = path_str
            .strip_prefix("/dev/input/event")
            .unwrap_or_default();
        if path_str == query
            || number == query
            || device.name() == Some(query)
            || device.physical_path() == Some(query)
        {
            return Some((path, device));
        }
    }
    None
}
