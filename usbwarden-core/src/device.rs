//! USB device identity and access modes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error when a device id fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device id: {0:?}")]
pub struct DeviceIdError(pub String);

/// Kernel bus id of a USB device (e.g. `1-4` under `/sys/bus/usb/devices`).
///
/// Stable for the lifetime of one connection; reused by the kernel after
/// disconnect, so it must never be treated as a durable device identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl TryFrom<String> for DeviceId {
    type Error = DeviceIdError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl DeviceId {
    /// Parse and validate a device id.
    ///
    /// Only `[A-Za-z0-9_.:-]` is accepted. The id is later joined onto a
    /// sysfs path, so anything that could traverse out of the devices
    /// directory is rejected here.
    pub fn parse(raw: impl Into<String>) -> Result<Self, DeviceIdError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
        if valid {
            Ok(Self(raw))
        } else {
            Err(DeviceIdError(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access mode applied to a device through the authorization port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Full data and power access.
    Full,
    /// No access. Power may still flow on some host controllers.
    Blocked,
    /// Charging only. The kernel has no true power-only primitive for a
    /// single port, so this degrades to `Blocked` plus a best-effort
    /// interface unbind.
    PowerOnly,
}

/// Default authorization policy for devices that connect in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    Allow,
    Block,
}

/// Descriptive metadata for a connected USB device.
///
/// Everything except `device_id` is advisory: vendor/product strings come
/// from the device itself and must never influence a security decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    /// Full sysfs path, kept for the audit trail.
    pub device_path: String,
    pub vendor_id: String,
    pub product_id: String,
    pub vendor_name: String,
    pub product_name: String,
    /// Absent serial means the device cannot be whitelisted.
    pub serial_number: Option<String>,
}

impl DeviceInfo {
    /// Human-readable name for dialogs and logs.
    pub fn display_name(&self) -> String {
        if !self.vendor_name.is_empty() && !self.product_name.is_empty() {
            format!("{} {}", self.vendor_name, self.product_name)
        } else if !self.product_name.is_empty() {
            self.product_name.clone()
        } else {
            format!("USB Device {}:{}", self.vendor_id, self.product_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_accepts_sysfs_names() {
        assert!(DeviceId::parse("1-4").is_ok());
        assert!(DeviceId::parse("1-4.2").is_ok());
        assert!(DeviceId::parse("3-10:1.0").is_ok());
        assert!(DeviceId::parse("usb1").is_ok());
    }

    #[test]
    fn device_id_rejects_traversal() {
        assert!(DeviceId::parse("../1-4").is_err());
        assert!(DeviceId::parse("1-4/authorized").is_err());
        assert!(DeviceId::parse("").is_err());
        assert!(DeviceId::parse("1-4 ").is_err());
    }

    fn info(vendor_name: &str, product_name: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: DeviceId::parse("1-4").unwrap(),
            device_path: "/sys/bus/usb/devices/1-4".into(),
            vendor_id: "046d".into(),
            product_id: "c52b".into(),
            vendor_name: vendor_name.into(),
            product_name: product_name.into(),
            serial_number: None,
        }
    }

    #[test]
    fn display_name_fallback_chain() {
        assert_eq!(
            info("Logitech", "Unifying Receiver").display_name(),
            "Logitech Unifying Receiver"
        );
        assert_eq!(info("", "Unifying Receiver").display_name(), "Unifying Receiver");
        assert_eq!(info("", "").display_name(), "USB Device 046d:c52b");
    }

    #[test]
    fn device_id_deserialization_validates() {
        assert!(serde_json::from_str::<DeviceId>(r#""1-4""#).is_ok());
        assert!(serde_json::from_str::<DeviceId>(r#""../1-4""#).is_err());
    }

    #[test]
    fn access_mode_snake_case() {
        assert_eq!(
            serde_json::to_string(&AccessMode::PowerOnly).unwrap(),
            r#""power_only""#
        );
    }
}
