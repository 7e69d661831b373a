//! Single-owner authorization state machine.
//!
//! All mutable daemon state (the pending table, the credential verifier,
//! the config) is owned by one task running [`Coordinator::run`]. Every
//! input, whether a hotplug event, a client decision, or an expired
//! deadline, arrives as a [`Command`] on one queue, so handlers never
//! interleave and check-then-act sequences need no locks.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use usbwarden_auth::{CredentialVerifier, VerifiedMethod};
use usbwarden_core::{
    AccessMode, AuditAction, AuditEvent, AuthMethod, DecisionMode, DecisionOutcome, DefaultPolicy,
    DeviceId, DeviceInfo, Notification,
};

use crate::audit_log::AuditLog;
use crate::bridge::CoordinatorHandle;
use crate::config::ConfigStore;
use crate::pending::PendingTable;
use crate::port::DevicePort;
use crate::whitelist::{Whitelist, WhitelistEntry};

const QUEUE_CAPACITY: usize = 64;
const NOTIFY_CAPACITY: usize = 64;

/// One unit of work for the coordinator.
pub enum Command {
    /// A device appeared on the bus.
    DeviceAdded(DeviceInfo),
    /// A device left the bus.
    DeviceRemoved(DeviceId),
    /// A client decided the fate of a pending device.
    Decision {
        device_id: DeviceId,
        code: String,
        mode: DecisionMode,
        remember: bool,
        reply: oneshot::Sender<DecisionOutcome>,
    },
    /// A pending device's deadline expired. Sent by the timer task armed at
    /// insert; `generation` identifies which pending entry it was armed for.
    DeadlineElapsed { device_id: DeviceId, generation: u64 },
    SetEnabled {
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    /// Reply carries the clamped value actually stored, `None` if the
    /// config could not be persisted.
    SetTimeout {
        seconds: u64,
        reply: oneshot::Sender<Option<u64>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
    ListPending {
        reply: oneshot::Sender<Vec<PendingDevice>>,
    },
    WhitelistAdd {
        info: DeviceInfo,
        notes: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    WhitelistRemove {
        serial_number: String,
        reply: oneshot::Sender<bool>,
    },
    WhitelistList {
        reply: oneshot::Sender<Vec<WhitelistEntry>>,
    },
    Shutdown,
}

/// Daemon state snapshot for clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub pending_count: usize,
    pub credential_enrolled: bool,
    pub recovery_codes_remaining: i64,
}

/// A pending device as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDevice {
    pub device: DeviceInfo,
    pub seconds_remaining: u64,
    /// Serial is on the whitelist. Display hint only.
    pub known: bool,
}

pub struct Coordinator {
    rx: mpsc::Receiver<Command>,
    /// Clone handed to timer tasks so deadlines come back through the queue.
    tx: mpsc::Sender<Command>,
    notify: broadcast::Sender<Notification>,
    port: Arc<dyn DevicePort>,
    verifier: Option<CredentialVerifier>,
    pending: PendingTable,
    audit: AuditLog,
    whitelist: Whitelist,
    config: ConfigStore,
}

impl Coordinator {
    pub fn new(
        port: Arc<dyn DevicePort>,
        verifier: Option<CredentialVerifier>,
        audit: AuditLog,
        whitelist: Whitelist,
        config: ConfigStore,
    ) -> (Self, CoordinatorHandle) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        let handle = CoordinatorHandle::new(tx.clone(), notify.clone());
        let coordinator = Self {
            rx,
            tx,
            notify,
            port,
            verifier,
            pending: PendingTable::new(),
            audit,
            whitelist,
            config,
        };
        (coordinator, handle)
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::DeviceAdded(info) => self.handle_device_added(info).await,
                Command::DeviceRemoved(id) => self.handle_device_removed(id).await,
                Command::Decision {
                    device_id,
                    code,
                    mode,
                    remember,
                    reply,
                } => {
                    let outcome = self.handle_decision(&device_id, &code, mode, remember).await;
                    let _ = reply.send(outcome);
                }
                Command::DeadlineElapsed {
                    device_id,
                    generation,
                } => self.handle_deadline(device_id, generation).await,
                Command::SetEnabled { enabled, reply } => {
                    let _ = reply.send(self.handle_set_enabled(enabled));
                }
                Command::SetTimeout { seconds, reply } => {
                    let _ = reply.send(self.handle_set_timeout(seconds));
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.status().await);
                }
                Command::ListPending { reply } => {
                    let _ = reply.send(self.list_pending().await);
                }
                Command::WhitelistAdd { info, notes, reply } => {
                    let _ = reply.send(self.handle_whitelist_add(info, notes.as_deref()).await);
                }
                Command::WhitelistRemove {
                    serial_number,
                    reply,
                } => {
                    let _ = reply.send(self.handle_whitelist_remove(&serial_number).await);
                }
                Command::WhitelistList { reply } => {
                    let list = match self.whitelist.list().await {
                        Ok(list) => list,
                        Err(err) => {
                            tracing::error!(%err, "whitelist listing failed");
                            Vec::new()
                        }
                    };
                    let _ = reply.send(list);
                }
                Command::Shutdown => {
                    let drained = self.pending.drain_and_cancel();
                    if !drained.is_empty() {
                        tracing::info!(
                            count = drained.len(),
                            "shutting down with pending devices, leaving them blocked"
                        );
                    }
                    break;
                }
            }
        }
    }

    async fn handle_device_added(&mut self, info: DeviceInfo) {
        if self.pending.contains(&info.device_id) {
            tracing::error!(device = %info.device_id,
                "connect event for a device that is already pending");
            return;
        }
        self.record(AuditEvent::for_device(AuditAction::Connected, &info))
            .await;

        if !self.config.enabled() || self.verifier.is_none() {
            self.port.set_mode(&info.device_id, AccessMode::Full);
            tracing::info!(device = %info.device_id, name = %info.display_name(),
                "protection inactive, device allowed through");
            return;
        }

        // Fail closed before anything else. If even this write fails the
        // device is likely gone already; the pending entry still goes in and
        // resolves through the normal paths.
        if !self.port.set_mode(&info.device_id, AccessMode::Blocked) {
            tracing::warn!(device = %info.device_id, "could not block device on connect");
        }

        let timeout = Duration::from_secs(self.config.timeout_seconds());
        let deadline = Instant::now() + timeout;
        let generation = self.pending.next_generation();

        let tx = self.tx.clone();
        let timer_id = info.device_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx
                .send(Command::DeadlineElapsed {
                    device_id: timer_id,
                    generation,
                })
                .await;
        })
        .abort_handle();

        let device = info.clone();
        if self.pending.insert(info, deadline, generation, timer.clone()).is_err() {
            // Unreachable given the contains() check above; this task is the
            // table's only writer.
            timer.abort();
            return;
        }

        tracing::info!(device = %device.device_id, name = %device.display_name(),
            timeout_seconds = timeout.as_secs(), "device blocked, awaiting authorization");
        self.publish(Notification::DeviceConnected { device });
    }

    async fn handle_device_removed(&mut self, device_id: DeviceId) {
        let entry = self.pending.remove_and_cancel(&device_id);
        let event = match &entry {
            Some(entry) => AuditEvent::for_device(AuditAction::Disconnected, &entry.info),
            None => {
                let mut event = AuditEvent::new(AuditAction::Disconnected);
                event.device_path = Some(device_id.to_string());
                event
            }
        };
        self.record(event).await;

        if entry.is_some() {
            tracing::info!(device = %device_id, "pending device disconnected, prompt withdrawn");
        }
        self.publish(Notification::DeviceDisconnected { device_id });
    }

    async fn handle_decision(
        &mut self,
        device_id: &DeviceId,
        code: &str,
        mode: DecisionMode,
        remember: bool,
    ) -> DecisionOutcome {
        let Some(info) = self.pending.get(device_id).map(|e| e.info.clone()) else {
            tracing::warn!(device = %device_id, "decision for a device no longer pending");
            return DecisionOutcome::Stale;
        };

        if mode == DecisionMode::Deny {
            self.pending.remove_and_cancel(device_id);
            self.port.set_mode(device_id, AccessMode::Blocked);
            self.record(
                AuditEvent::for_device(AuditAction::Denied, &info)
                    .with_success(true)
                    .with_details("denied by user"),
            )
            .await;
            tracing::info!(device = %device_id, "device denied by user");
            self.publish(Notification::AuthorizationResult {
                device_id: device_id.clone(),
                result: "denied".into(),
                success: false,
            });
            return DecisionOutcome::Success;
        }

        let Some(verifier) = self.verifier.as_mut() else {
            // A pending entry only exists while a credential is enrolled.
            tracing::error!(device = %device_id, "decision without an enrolled credential");
            return DecisionOutcome::Error;
        };

        let method = match verifier.verify(code).await {
            Ok(method) => method,
            Err(err) => {
                // The entry stays pending; its deadline still applies.
                tracing::error!(device = %device_id, %err,
                    "credential store failure during verification");
                return DecisionOutcome::Error;
            }
        };
        let Some(method) = method else {
            self.record(
                AuditEvent::for_device(AuditAction::AuthFailed, &info)
                    .with_success(false)
                    .with_details("invalid code"),
            )
            .await;
            tracing::warn!(device = %device_id, "invalid code, device stays pending");
            return DecisionOutcome::AuthFailed;
        };
        let auth_method = match method {
            VerifiedMethod::Totp => AuthMethod::Totp,
            VerifiedMethod::Recovery => AuthMethod::Recovery,
        };
        self.record(
            AuditEvent::for_device(AuditAction::AuthSuccess, &info)
                .with_auth_method(auth_method)
                .with_success(true),
        )
        .await;

        let access = match mode {
            DecisionMode::Full => AccessMode::Full,
            DecisionMode::PowerOnly => AccessMode::PowerOnly,
            DecisionMode::Deny => unreachable!("deny handled above"),
        };
        let applied = self.port.set_mode(device_id, access);
        // The decision is terminal either way.
        self.pending.remove_and_cancel(device_id);

        let (action, result) = match mode {
            DecisionMode::Full => (AuditAction::Authorized, "authorized"),
            DecisionMode::PowerOnly => (AuditAction::AuthorizedPowerOnly, "power_only"),
            DecisionMode::Deny => unreachable!("deny handled above"),
        };

        if !applied {
            self.port.set_mode(device_id, AccessMode::Blocked);
            self.record(
                AuditEvent::for_device(action, &info)
                    .with_auth_method(auth_method)
                    .with_success(false)
                    .with_details("could not apply access mode"),
            )
            .await;
            tracing::error!(device = %device_id, "access mode not applied, device left blocked");
            self.publish(Notification::AuthorizationResult {
                device_id: device_id.clone(),
                result: "error".into(),
                success: false,
            });
            return DecisionOutcome::Error;
        }

        self.update_whitelist_after_grant(&info, remember).await;

        self.record(
            AuditEvent::for_device(action, &info)
                .with_auth_method(auth_method)
                .with_success(true),
        )
        .await;
        tracing::info!(device = %device_id, name = %info.display_name(),
            mode = result, "device authorized");
        self.publish(Notification::AuthorizationResult {
            device_id: device_id.clone(),
            result: result.into(),
            success: true,
        });
        DecisionOutcome::Success
    }

    /// Whitelist upkeep after a grant. Advisory data: failures are logged
    /// and do not undo the authorization.
    async fn update_whitelist_after_grant(&mut self, info: &DeviceInfo, remember: bool) {
        let Some(serial) = info.serial_number.as_deref() else {
            if remember {
                tracing::warn!(device = %info.device_id,
                    "device has no serial number and cannot be remembered");
            }
            return;
        };
        match self.whitelist.touch_usage(serial).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                tracing::error!(%err, serial, "whitelist usage update failed");
                return;
            }
        }
        if !remember {
            return;
        }
        match self.whitelist.add(info, None).await {
            Ok(_) => {
                self.record(
                    AuditEvent::for_device(AuditAction::WhitelistAdded, info).with_success(true),
                )
                .await;
                tracing::info!(serial, "device added to whitelist");
            }
            Err(err) => tracing::error!(%err, serial, "whitelist add failed"),
        }
    }

    async fn handle_deadline(&mut self, device_id: DeviceId, generation: u64) {
        let current = match self.pending.get(&device_id) {
            Some(entry) => entry.generation,
            None => return,
        };
        if current != generation {
            tracing::debug!(device = %device_id, "deadline for a superseded pending entry");
            return;
        }
        let entry = match self.pending.remove_and_cancel(&device_id) {
            Some(entry) => entry,
            None => return,
        };

        self.port.set_mode(&device_id, AccessMode::Blocked);
        self.record(
            AuditEvent::for_device(AuditAction::Denied, &entry.info)
                .with_success(true)
                .with_details("authorization timeout"),
        )
        .await;
        tracing::info!(device = %device_id, name = %entry.info.display_name(),
            "authorization timed out, device denied");
        self.publish(Notification::AuthorizationResult {
            device_id,
            result: "denied".into(),
            success: false,
        });
    }

    fn handle_set_enabled(&mut self, enabled: bool) -> bool {
        if let Err(err) = self.config.set_enabled(enabled) {
            tracing::error!(%err, "failed to persist enabled flag");
            return false;
        }
        let policy = if enabled && self.verifier.is_some() {
            DefaultPolicy::Block
        } else {
            DefaultPolicy::Allow
        };
        if enabled && self.verifier.is_none() {
            tracing::warn!("protection enabled but no credential is enrolled, devices stay allowed");
        }
        self.port.set_default_policy(policy);
        tracing::info!(enabled, "protection state changed");
        self.publish(Notification::ProtectionStateChanged { enabled });
        true
    }

    /// Applies to devices that connect after this call. Already-pending
    /// entries keep the deadline they were armed with.
    fn handle_set_timeout(&mut self, seconds: u64) -> Option<u64> {
        match self.config.set_timeout(seconds) {
            Ok(stored) => {
                tracing::info!(timeout_seconds = stored, "authorization timeout changed");
                Some(stored)
            }
            Err(err) => {
                tracing::error!(%err, "failed to persist timeout");
                None
            }
        }
    }

    async fn status(&self) -> StatusReport {
        let recovery_codes_remaining = match &self.verifier {
            Some(verifier) => match verifier.remaining_recovery_codes().await {
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(%err, "failed to count recovery codes");
                    0
                }
            },
            None => 0,
        };
        StatusReport {
            enabled: self.config.enabled(),
            timeout_seconds: self.config.timeout_seconds(),
            pending_count: self.pending.len(),
            credential_enrolled: self.verifier.is_some(),
            recovery_codes_remaining,
        }
    }

    async fn list_pending(&self) -> Vec<PendingDevice> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(self.pending.len());
        for info in self.pending.devices() {
            let entry = match self.pending.get(&info.device_id) {
                Some(entry) => entry,
                None => continue,
            };
            let known = match info.serial_number.as_deref() {
                Some(serial) => self.whitelist.contains(serial).await.unwrap_or(false),
                None => false,
            };
            out.push(PendingDevice {
                seconds_remaining: entry.deadline.saturating_duration_since(now).as_secs(),
                device: info,
                known,
            });
        }
        out
    }

    async fn handle_whitelist_add(&mut self, info: DeviceInfo, notes: Option<&str>) -> bool {
        match self.whitelist.add(&info, notes).await {
            Ok(true) => {
                self.record(
                    AuditEvent::for_device(AuditAction::WhitelistAdded, &info).with_success(true),
                )
                .await;
                true
            }
            Ok(false) => {
                tracing::warn!(device = %info.device_id,
                    "whitelist add refused, device has no serial number");
                false
            }
            Err(err) => {
                tracing::error!(%err, "whitelist add failed");
                false
            }
        }
    }

    async fn handle_whitelist_remove(&mut self, serial_number: &str) -> bool {
        match self.whitelist.remove(serial_number).await {
            Ok(true) => {
                let mut event = AuditEvent::new(AuditAction::WhitelistRemoved).with_success(true);
                event.serial_number = Some(serial_number.to_string());
                self.record(event).await;
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::error!(%err, "whitelist remove failed");
                false
            }
        }
    }

    async fn record(&self, event: AuditEvent) {
        if let Err(err) = self.audit.log(&event).await {
            tracing::error!(%err, action = event.action.as_str(),
                "failed to append audit event");
        }
    }

    fn publish(&self, notification: Notification) {
        // No subscribers is fine; the daemon runs headless until a client
        // attaches.
        let _ = self.notify.send(notification);
    }
}
