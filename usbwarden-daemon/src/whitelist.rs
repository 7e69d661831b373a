//! Advisory whitelist of known devices, keyed by serial number.
//!
//! Membership never bypasses authorization; it only lets a client surface
//! "you have approved this device before" alongside the prompt. USB serial
//! numbers are trivially forgeable, which is why this table cannot grant
//! anything by itself.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use usbwarden_core::DeviceInfo;

/// One whitelisted device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub serial_number: String,
    pub vendor_id: String,
    pub product_id: String,
    pub vendor_name: String,
    pub product_name: String,
    pub notes: Option<String>,
    /// Unix seconds when the entry was added.
    pub added_at: i64,
    /// Unix seconds of the most recent authorization, if any.
    pub last_used_at: Option<i64>,
    pub use_count: i64,
}

#[derive(Debug, Clone)]
pub struct Whitelist {
    pool: SqlitePool,
}

impl Whitelist {
    pub async fn open(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS whitelist (
                serial_number TEXT PRIMARY KEY,
                vendor_id TEXT NOT NULL,
                product_id TEXT NOT NULL,
                vendor_name TEXT NOT NULL,
                product_name TEXT NOT NULL,
                notes TEXT,
                added_at INTEGER NOT NULL,
                last_used_at INTEGER,
                use_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Add or refresh a device. Re-adding an existing serial resets its
    /// usage statistics along with the descriptive fields.
    pub async fn add(&self, info: &DeviceInfo, notes: Option<&str>) -> Result<bool, sqlx::Error> {
        let Some(serial) = info.serial_number.as_deref() else {
            return Ok(false);
        };
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO whitelist
                (serial_number, vendor_id, product_id, vendor_name, product_name,
                 notes, added_at, last_used_at, use_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, 0)
            "#,
        )
        .bind(serial)
        .bind(&info.vendor_id)
        .bind(&info.product_id)
        .bind(&info.vendor_name)
        .bind(&info.product_name)
        .bind(notes)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    /// Remove a serial. Returns whether a row existed.
    pub async fn remove(&self, serial_number: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM whitelist WHERE serial_number = ?")
            .bind(serial_number)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn contains(&self, serial_number: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM whitelist WHERE serial_number = ?")
            .bind(serial_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn get(&self, serial_number: &str) -> Result<Option<WhitelistEntry>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM whitelist WHERE serial_number = ?")
            .bind(serial_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_entry(&r)))
    }

    pub async fn list(&self) -> Result<Vec<WhitelistEntry>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM whitelist ORDER BY added_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_entry).collect())
    }

    /// Record that a whitelisted device was just authorized. Returns whether
    /// the serial was present.
    pub async fn touch_usage(&self, serial_number: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE whitelist SET last_used_at = ?, use_count = use_count + 1
             WHERE serial_number = ?",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(serial_number)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> WhitelistEntry {
    WhitelistEntry {
        serial_number: row.get("serial_number"),
        vendor_id: row.get("vendor_id"),
        product_id: row.get("product_id"),
        vendor_name: row.get("vendor_name"),
        product_name: row.get("product_name"),
        notes: row.get("notes"),
        added_at: row.get("added_at"),
        last_used_at: row.get("last_used_at"),
        use_count: row.get("use_count"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbwarden_core::DeviceId;

    async fn test_whitelist() -> Whitelist {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Whitelist::open(pool).await.unwrap()
    }

    fn device(serial: Option<&str>) -> DeviceInfo {
        DeviceInfo {
            device_id: DeviceId::parse("1-4").unwrap(),
            device_path: "/sys/bus/usb/devices/1-4".into(),
            vendor_id: "0781".into(),
            product_id: "5583".into(),
            vendor_name: "SanDisk".into(),
            product_name: "Ultra".into(),
            serial_number: serial.map(Into::into),
        }
    }

    #[tokio::test]
    async fn add_get_remove() {
        let wl = test_whitelist().await;
        assert!(wl.add(&device(Some("SER123")), Some("work laptop key")).await.unwrap());
        assert!(wl.contains("SER123").await.unwrap());

        let entry = wl.get("SER123").await.unwrap().unwrap();
        assert_eq!(entry.vendor_name, "SanDisk");
        assert_eq!(entry.notes.as_deref(), Some("work laptop key"));
        assert_eq!(entry.use_count, 0);

        assert!(wl.remove("SER123").await.unwrap());
        assert!(!wl.contains("SER123").await.unwrap());
        assert!(!wl.remove("SER123").await.unwrap());
    }

    #[tokio::test]
    async fn device_without_serial_not_added() {
        let wl = test_whitelist().await;
        assert!(!wl.add(&device(None), None).await.unwrap());
        assert!(wl.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_usage_counts() {
        let wl = test_whitelist().await;
        wl.add(&device(Some("SER123")), None).await.unwrap();

        assert!(wl.touch_usage("SER123").await.unwrap());
        assert!(wl.touch_usage("SER123").await.unwrap());
        assert!(!wl.touch_usage("UNKNOWN").await.unwrap());

        let entry = wl.get("SER123").await.unwrap().unwrap();
        assert_eq!(entry.use_count, 2);
        assert!(entry.last_used_at.is_some());
    }

    #[tokio::test]
    async fn re_add_resets_stats() {
        let wl = test_whitelist().await;
        wl.add(&device(Some("SER123")), None).await.unwrap();
        wl.touch_usage("SER123").await.unwrap();

        wl.add(&device(Some("SER123")), Some("re-approved")).await.unwrap();
        let entry = wl.get("SER123").await.unwrap().unwrap();
        assert_eq!(entry.use_count, 0);
        assert_eq!(entry.last_used_at, None);
        assert_eq!(entry.notes.as_deref(), Some("re-approved"));
    }
}
