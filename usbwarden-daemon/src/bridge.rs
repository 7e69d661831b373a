//! Cheap clonable handle for talking to the coordinator task.

use tokio::sync::{broadcast, mpsc, oneshot};

use usbwarden_core::{DecisionMode, DecisionOutcome, DeviceId, DeviceInfo, Notification};

use crate::coordinator::{Command, PendingDevice, StatusReport};
use crate::whitelist::WhitelistEntry;

/// Entry point for everything outside the coordinator task: the monitor,
/// IPC connections, and the shutdown path all go through one of these.
///
/// Request methods resolve once the coordinator has fully handled the
/// command. If the coordinator is gone they return the safe value for
/// their operation.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
    notify: broadcast::Sender<Notification>,
}

impl CoordinatorHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<Command>,
        notify: broadcast::Sender<Notification>,
    ) -> Self {
        Self { tx, notify }
    }

    /// Subscribe to daemon notifications. A lagging subscriber misses
    /// events rather than stalling the coordinator.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }

    pub async fn device_added(&self, info: DeviceInfo) {
        let _ = self.tx.send(Command::DeviceAdded(info)).await;
    }

    pub async fn device_removed(&self, device_id: DeviceId) {
        let _ = self.tx.send(Command::DeviceRemoved(device_id)).await;
    }

    pub async fn decide(
        &self,
        device_id: DeviceId,
        code: String,
        mode: DecisionMode,
        remember: bool,
    ) -> DecisionOutcome {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Command::Decision {
                device_id,
                code,
                mode,
                remember,
                reply,
            })
            .await;
        if sent.is_err() {
            return DecisionOutcome::Error;
        }
        rx.await.unwrap_or(DecisionOutcome::Error)
    }

    pub async fn set_enabled(&self, enabled: bool) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::SetEnabled { enabled, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn set_timeout(&self, seconds: u64) -> Option<u64> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::SetTimeout { seconds, reply }).await.is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub async fn status(&self) -> Option<StatusReport> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Status { reply }).await.is_err() {
            return None;
        }
        rx.await.ok()
    }

    pub async fn list_pending(&self) -> Vec<PendingDevice> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::ListPending { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn whitelist_add(&self, info: DeviceInfo, notes: Option<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Command::WhitelistAdd { info, notes, reply })
            .await;
        if sent.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn whitelist_remove(&self, serial_number: String) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Command::WhitelistRemove {
                serial_number,
                reply,
            })
            .await;
        if sent.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn whitelist_list(&self) -> Vec<WhitelistEntry> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::WhitelistList { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Ask the coordinator to stop. Pending devices stay blocked.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}
