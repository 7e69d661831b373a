//! Kernel-side enforcement through the sysfs `authorized` interface.

use std::fs;
use std::path::PathBuf;

use usbwarden_core::{AccessMode, DefaultPolicy, DeviceId};

/// Where device access is actually enforced.
///
/// Methods return `true` on success. Failures are logged here; callers only
/// need the boolean to decide whether the state transition took effect.
pub trait DevicePort: Send + Sync {
    /// Apply an access mode to one device.
    fn set_mode(&self, device_id: &DeviceId, mode: AccessMode) -> bool;

    /// Apply the default policy for future connections on every bus.
    fn set_default_policy(&self, policy: DefaultPolicy) -> bool;
}

/// Production port writing `/sys/bus/usb/devices/<id>/authorized`.
pub struct SysfsPort {
    devices_root: PathBuf,
}

impl SysfsPort {
    pub fn new() -> Self {
        Self::with_root("/sys/bus/usb/devices")
    }

    /// Use an alternate sysfs root. Exists for tests against a temp dir.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            devices_root: root.into(),
        }
    }

    fn device_dir(&self, device_id: &DeviceId) -> PathBuf {
        self.devices_root.join(device_id.as_str())
    }

    fn write_authorized(&self, device_id: &DeviceId, value: &str) -> bool {
        let path = self.device_dir(device_id).join("authorized");
        match fs::write(&path, value) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(device = %device_id, path = %path.display(), %err,
                    "failed to write authorized attribute");
                false
            }
        }
    }

    /// Unbind every interface driver of a device. Best effort: a failure on
    /// one interface does not stop the others.
    fn unbind_interfaces(&self, device_id: &DeviceId) {
        let dir = self.device_dir(device_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Interfaces live in subdirectories named <id>:<config>.<iface>.
            if !name.starts_with(device_id.as_str()) || !name.contains(':') {
                continue;
            }
            let driver = entry.path().join("driver");
            if !driver.exists() {
                continue;
            }
            let unbind = driver.join("unbind");
            if let Err(err) = fs::write(&unbind, name.as_bytes()) {
                tracing::debug!(interface = %name, %err, "interface unbind failed");
            }
        }
    }
}

impl Default for SysfsPort {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePort for SysfsPort {
    fn set_mode(&self, device_id: &DeviceId, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Full => self.write_authorized(device_id, "1"),
            AccessMode::Blocked => self.write_authorized(device_id, "0"),
            // The kernel has no per-port power-only primitive. Deauthorize
            // and detach drivers; the port keeps supplying power on most
            // controllers.
            AccessMode::PowerOnly => {
                let ok = self.write_authorized(device_id, "0");
                if ok {
                    self.unbind_interfaces(device_id);
                }
                ok
            }
        }
    }

    fn set_default_policy(&self, policy: DefaultPolicy) -> bool {
        let value = match policy {
            DefaultPolicy::Allow => "1",
            DefaultPolicy::Block => "0",
        };
        let entries = match fs::read_dir(&self.devices_root) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(root = %self.devices_root.display(), %err,
                    "failed to enumerate usb buses");
                return false;
            }
        };
        let mut all_ok = true;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Root hubs are named usb1, usb2, ...
            if !name.starts_with("usb") {
                continue;
            }
            let path = entry.path().join("authorized_default");
            if let Err(err) = fs::write(&path, value) {
                tracing::warn!(bus = %name, %err, "failed to set authorized_default");
                all_ok = false;
            }
        }
        all_ok
    }
}
