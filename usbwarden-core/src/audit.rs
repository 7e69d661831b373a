//! Audit event types for the security trail.
//!
//! One event per state transition of interest. The daemon persists these to
//! an append-only SQLite table; the action strings are part of that stable
//! on-disk format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;

/// Action being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Device appeared on the bus.
    Connected,
    /// Device left the bus.
    Disconnected,
    /// A presented code verified successfully.
    AuthSuccess,
    /// A presented code failed verification.
    AuthFailed,
    /// Device was granted full access.
    Authorized,
    /// Device was granted power-only access.
    AuthorizedPowerOnly,
    /// Device was denied (by the user or by timeout).
    Denied,
    /// Serial number was added to the whitelist.
    WhitelistAdded,
    /// Serial number was removed from the whitelist.
    WhitelistRemoved,
}

impl AuditAction {
    /// Stable string used in the events table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailed => "auth_failed",
            Self::Authorized => "authorized",
            Self::AuthorizedPowerOnly => "authorized_power_only",
            Self::Denied => "denied",
            Self::WhitelistAdded => "whitelist_added",
            Self::WhitelistRemoved => "whitelist_removed",
        }
    }
}

/// How a successful verification was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Totp,
    Recovery,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Recovery => "recovery",
        }
    }
}

/// One row of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub action: AuditAction,
    pub device_path: Option<String>,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub vendor_name: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub auth_method: Option<AuthMethod>,
    pub success: Option<bool>,
    pub details: Option<String>,
}

impl AuditEvent {
    /// Create a bare event with the current timestamp.
    pub fn new(action: AuditAction) -> Self {
        Self {
            ts: Utc::now(),
            action,
            device_path: None,
            vendor_id: None,
            product_id: None,
            vendor_name: None,
            product_name: None,
            serial_number: None,
            auth_method: None,
            success: None,
            details: None,
        }
    }

    /// Create an event carrying a device's descriptive fields.
    pub fn for_device(action: AuditAction, info: &DeviceInfo) -> Self {
        let mut event = Self::new(action);
        event.device_path = Some(info.device_path.clone());
        event.vendor_id = Some(info.vendor_id.clone());
        event.product_id = Some(info.product_id.clone());
        event.vendor_name = Some(info.vendor_name.clone());
        event.product_name = Some(info.product_name.clone());
        event.serial_number = info.serial_number.clone();
        event
    }

    pub fn with_auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = Some(method);
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;

    #[test]
    fn action_snake_case() {
        assert_eq!(
            serde_json::to_string(&AuditAction::AuthorizedPowerOnly).unwrap(),
            r#""authorized_power_only""#
        );
        assert_eq!(
            serde_json::to_string(&AuditAction::AuthFailed).unwrap(),
            r#""auth_failed""#
        );
    }

    #[test]
    fn action_as_str_matches_serde() {
        let actions = [
            AuditAction::Connected,
            AuditAction::Disconnected,
            AuditAction::AuthSuccess,
            AuditAction::AuthFailed,
            AuditAction::Authorized,
            AuditAction::AuthorizedPowerOnly,
            AuditAction::Denied,
            AuditAction::WhitelistAdded,
            AuditAction::WhitelistRemoved,
        ];
        for action in actions {
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
            let parsed: AuditAction = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, action);
        }
    }

    #[test]
    fn for_device_copies_descriptive_fields() {
        let info = DeviceInfo {
            device_id: DeviceId::parse("1-4").unwrap(),
            device_path: "/sys/bus/usb/devices/1-4".into(),
            vendor_id: "0781".into(),
            product_id: "5583".into(),
            vendor_name: "SanDisk".into(),
            product_name: "Ultra USB 3.0".into(),
            serial_number: Some("XYZ789012".into()),
        };

        let event = AuditEvent::for_device(AuditAction::Connected, &info);
        assert_eq!(event.action, AuditAction::Connected);
        assert_eq!(event.device_path.as_deref(), Some("/sys/bus/usb/devices/1-4"));
        assert_eq!(event.serial_number.as_deref(), Some("XYZ789012"));
        assert_eq!(event.auth_method, None);
        assert_eq!(event.success, None);
    }

    #[test]
    fn builder_chains() {
        let event = AuditEvent::new(AuditAction::AuthSuccess)
            .with_auth_method(AuthMethod::Recovery)
            .with_success(true)
            .with_details("recovery code consumed");
        assert_eq!(event.auth_method, Some(AuthMethod::Recovery));
        assert_eq!(event.success, Some(true));
        assert_eq!(event.details.as_deref(), Some("recovery code consumed"));
    }
}
