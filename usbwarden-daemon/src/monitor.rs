//! Hotplug detection by polling the sysfs device tree.
//!
//! A scan every second is cheap (one directory listing plus a few small
//! attribute reads per device) and avoids a udev dependency. The monitor
//! diffs successive scans and feeds connect/disconnect events to the
//! coordinator.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use usbwarden_core::{DeviceId, DeviceInfo};

use crate::bridge::CoordinatorHandle;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct UsbMonitor {
    devices_root: PathBuf,
    interval: Duration,
    handle: CoordinatorHandle,
    seen: HashMap<DeviceId, DeviceInfo>,
}

impl UsbMonitor {
    pub fn new(handle: CoordinatorHandle) -> Self {
        Self::with_root("/sys/bus/usb/devices", handle)
    }

    pub fn with_root(root: impl Into<PathBuf>, handle: CoordinatorHandle) -> Self {
        Self {
            devices_root: root.into(),
            interval: POLL_INTERVAL,
            handle,
            seen: HashMap::new(),
        }
    }

    /// Poll until the coordinator goes away.
    pub async fn run(mut self) {
        // Devices present at startup are treated as already trusted; only
        // arrivals after this first scan go through authorization.
        self.seen = scan(&self.devices_root);
        tracing::info!(count = self.seen.len(), "initial usb scan complete");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let current = scan(&self.devices_root);

            for (id, info) in &current {
                if !self.seen.contains_key(id) {
                    self.handle.device_added(info.clone()).await;
                }
            }
            for id in self.seen.keys() {
                if !current.contains_key(id) {
                    self.handle.device_removed(id.clone()).await;
                }
            }
            self.seen = current;
        }
    }
}

/// Enumerate USB devices (not hubs, not interfaces) under `root`.
pub fn scan(root: &Path) -> HashMap<DeviceId, DeviceInfo> {
    let mut devices = HashMap::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(root = %root.display(), %err, "cannot enumerate usb devices");
            return devices;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        // Root hubs are usbN; interface directories contain ':'.
        if name.starts_with("usb") || name.contains(':') || !name.contains('-') {
            continue;
        }
        let Ok(device_id) = DeviceId::parse(name) else {
            continue;
        };
        let dir = entry.path();
        let Some(vendor_id) = read_attr(&dir, "idVendor") else {
            continue;
        };
        let Some(product_id) = read_attr(&dir, "idProduct") else {
            continue;
        };
        let info = DeviceInfo {
            device_path: dir.to_string_lossy().into_owned(),
            vendor_id,
            product_id,
            vendor_name: read_attr(&dir, "manufacturer").unwrap_or_default(),
            product_name: read_attr(&dir, "product").unwrap_or_default(),
            serial_number: read_attr(&dir, "serial"),
            device_id: device_id.clone(),
        };
        devices.insert(device_id, info);
    }
    devices
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(name)).ok()?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
