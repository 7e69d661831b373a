//! Shared types for the usbwarden daemon and its clients.
//!
//! This crate is intentionally IO-free:
//! - No filesystem operations
//! - No database interactions
//! - No logging
//!
//! The daemon crate owns all side effects; clients only need these types to
//! speak the IPC protocol and interpret audit rows.

pub mod audit;
pub mod device;
pub mod notify;

pub use audit::{AuditAction, AuditEvent, AuthMethod};
pub use device::{AccessMode, DefaultPolicy, DeviceId, DeviceIdError, DeviceInfo};
pub use notify::{DecisionMode, DecisionOutcome, Notification};
