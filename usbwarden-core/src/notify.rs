//! Decision and notification types shared across the IPC boundary.

use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, DeviceInfo};

/// What the user chose for a pending device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    /// Grant full access (requires a valid code).
    Full,
    /// Grant charging-only access (requires a valid code).
    PowerOnly,
    /// Deny. No code required.
    Deny,
}

/// Result of submitting a decision for a pending device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// The decision was applied.
    Success,
    /// The presented code did not verify. The device stays pending and its
    /// deadline is unchanged.
    AuthFailed,
    /// The device was no longer pending (timed out, disconnected, or already
    /// decided).
    Stale,
    /// The decision could not be applied; the device ends up blocked.
    Error,
}

/// Asynchronous event delivered to every subscribed client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum Notification {
    /// A device connected, was blocked, and is awaiting a decision.
    DeviceConnected { device: DeviceInfo },
    /// A device left the bus.
    DeviceDisconnected { device_id: DeviceId },
    /// Terminal outcome for a pending authorization.
    ///
    /// `result` is one of `authorized`, `power_only`, `denied`, `error`.
    AuthorizationResult {
        device_id: DeviceId,
        result: String,
        success: bool,
    },
    /// Protection was enabled or disabled.
    ProtectionStateChanged { enabled: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_representation() {
        let n = Notification::DeviceDisconnected {
            device_id: DeviceId::parse("1-4").unwrap(),
        };
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(json, r#"{"event":"device_disconnected","device_id":"1-4"}"#);
        let parsed: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, n);
    }

    #[test]
    fn decision_snake_case() {
        assert_eq!(
            serde_json::to_string(&DecisionMode::PowerOnly).unwrap(),
            r#""power_only""#
        );
        assert_eq!(
            serde_json::to_string(&DecisionOutcome::AuthFailed).unwrap(),
            r#""auth_failed""#
        );
    }

    #[test]
    fn authorization_result_roundtrip() {
        let n = Notification::AuthorizationResult {
            device_id: DeviceId::parse("2-1.3").unwrap(),
            result: "authorized".into(),
            success: true,
        };
        let json = serde_json::to_string(&n).unwrap();
        let parsed: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, n);
    }
}
