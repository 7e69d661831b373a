//! The usbwarden daemon: blocks new USB devices until the operator proves
//! presence with a TOTP or recovery code.
//!
//! Layout:
//! - [`monitor`] watches sysfs for hotplug events
//! - [`port`] enforces access through the kernel `authorized` attribute
//! - [`pending`] tracks devices awaiting a decision
//! - [`coordinator`] owns all state and serializes every transition
//! - [`bridge`] is the handle other tasks use to reach the coordinator
//! - [`ipc`] exposes the control socket
//! - [`audit_log`] and [`whitelist`] persist history and known devices

pub mod audit_log;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod ipc;
pub mod monitor;
pub mod pending;
pub mod port;
pub mod whitelist;
