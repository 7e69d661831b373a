//! In-memory table of devices awaiting an authorization decision.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use usbwarden_core::{DeviceId, DeviceInfo};

#[derive(Debug, thiserror::Error)]
pub enum PendingError {
    #[error("device {0} already has a pending authorization")]
    AlreadyPending(DeviceId),
}

/// One device waiting for a decision.
pub struct PendingAuthorization {
    pub info: DeviceInfo,
    pub deadline: Instant,
    pub created_at: DateTime<Utc>,
    /// Distinguishes this pending entry from earlier entries for the same
    /// bus id. A deadline event carrying an older generation is stale.
    pub generation: u64,
    timer: AbortHandle,
}

/// Owner of all pending entries and their deadline timers.
///
/// Not synchronized; the coordinator task is the only holder, so every
/// check-then-insert is atomic by construction.
pub struct PendingTable {
    entries: HashMap<DeviceId, PendingAuthorization>,
    next_generation: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Reserve the generation for an entry about to be inserted. The timer
    /// task must carry this value so its deadline event can be matched to
    /// the entry it was armed for.
    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Insert a pending entry. Fails without touching the existing entry if
    /// the device already has one; the caller must abort `timer` in that
    /// case.
    pub fn insert(
        &mut self,
        info: DeviceInfo,
        deadline: Instant,
        generation: u64,
        timer: AbortHandle,
    ) -> Result<(), PendingError> {
        let id = info.device_id.clone();
        if self.entries.contains_key(&id) {
            return Err(PendingError::AlreadyPending(id));
        }
        self.entries.insert(
            id,
            PendingAuthorization {
                info,
                deadline,
                created_at: Utc::now(),
                generation,
                timer,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &DeviceId) -> Option<&PendingAuthorization> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove an entry and cancel its deadline timer.
    pub fn remove_and_cancel(&mut self, id: &DeviceId) -> Option<PendingAuthorization> {
        let entry = self.entries.remove(id)?;
        entry.timer.abort();
        Some(entry)
    }

    /// Remove every entry, cancelling all timers. Returns how many there
    /// were.
    pub fn drain_and_cancel(&mut self) -> Vec<PendingAuthorization> {
        let drained: Vec<PendingAuthorization> = self
            .entries
            .drain()
            .map(|(_, entry)| {
                entry.timer.abort();
                entry
            })
            .collect();
        drained
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn info(id: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: DeviceId::parse(id).unwrap(),
            device_path: format!("/sys/bus/usb/devices/{id}"),
            vendor_id: "0781".into(),
            product_id: "5583".into(),
            vendor_name: "SanDisk".into(),
            product_name: "Ultra".into(),
            serial_number: None,
        }
    }

    fn dummy_timer() -> AbortHandle {
        tokio::spawn(std::future::pending::<()>()).abort_handle()
    }

    #[tokio::test]
    async fn insert_then_remove() {
        let mut table = PendingTable::new();
        let id = DeviceId::parse("1-4").unwrap();
        let generation = table.next_generation();
        table
            .insert(info("1-4"), Instant::now() + Duration::from_secs(30), generation, dummy_timer())
            .unwrap();

        assert!(table.contains(&id));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&id).unwrap().generation, generation);

        let removed = table.remove_and_cancel(&id).unwrap();
        assert_eq!(removed.info.device_id, id);
        assert!(table.is_empty());
        assert!(table.remove_and_cancel(&id).is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let mut table = PendingTable::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        let first = table.next_generation();
        table.insert(info("1-4"), deadline, first, dummy_timer()).unwrap();

        let second = table.next_generation();
        let err = table
            .insert(info("1-4"), deadline, second, dummy_timer())
            .unwrap_err();
        assert!(matches!(err, PendingError::AlreadyPending(_)));
        // Original entry survives.
        assert_eq!(table.get(&DeviceId::parse("1-4").unwrap()).unwrap().generation, first);
    }

    #[tokio::test]
    async fn generations_are_unique() {
        let mut table = PendingTable::new();
        let a = table.next_generation();
        let b = table.next_generation();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn remove_cancels_timer() {
        let mut table = PendingTable::new();
        let handle = tokio::spawn(std::future::pending::<()>());
        let abort = handle.abort_handle();
        let generation = table.next_generation();
        table
            .insert(info("1-4"), Instant::now() + Duration::from_secs(30), generation, abort)
            .unwrap();

        table.remove_and_cancel(&DeviceId::parse("1-4").unwrap());
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn drain_cancels_everything() {
        let mut table = PendingTable::new();
        for id in ["1-1", "1-2", "1-3"] {
            let generation = table.next_generation();
            table
                .insert(info(id), Instant::now() + Duration::from_secs(30), generation, dummy_timer())
                .unwrap();
        }
        let drained = table.drain_and_cancel();
        assert_eq!(drained.len(), 3);
        assert!(table.is_empty());
    }
}
