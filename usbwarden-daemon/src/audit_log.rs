//! Append-only audit trail in SQLite.
//!
//! Every device connection, decision, and whitelist change lands here.
//! Rows are only ever inserted or aged out; nothing updates them.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use usbwarden_core::{AuditAction, AuditEvent, AuthMethod};

#[derive(Debug, Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    /// Open the log, creating the table and indexes if needed.
    pub async fn open(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usb_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                action TEXT NOT NULL,
                device_path TEXT,
                vendor_id TEXT,
                product_id TEXT,
                vendor_name TEXT,
                product_name TEXT,
                serial_number TEXT,
                auth_method TEXT,
                success INTEGER,
                details TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_usb_events_ts ON usb_events (ts)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usb_events_serial ON usb_events (serial_number)",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Append one event. Returns the row id.
    pub async fn log(&self, event: &AuditEvent) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO usb_events
                (ts, action, device_path, vendor_id, product_id,
                 vendor_name, product_name, serial_number, auth_method, success, details)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.ts.timestamp_millis())
        .bind(event.action.as_str())
        .bind(&event.device_path)
        .bind(&event.vendor_id)
        .bind(&event.product_id)
        .bind(&event.vendor_name)
        .bind(&event.product_name)
        .bind(&event.serial_number)
        .bind(event.auth_method.map(|m| m.as_str()))
        .bind(event.success.map(i64::from))
        .bind(&event.details)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEvent>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM usb_events ORDER BY ts DESC, id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(row_to_event).collect())
    }

    /// Events for one serial number, newest first.
    pub async fn device_history(
        &self,
        serial_number: &str,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM usb_events WHERE serial_number = ? ORDER BY ts DESC, id DESC LIMIT ?",
        )
        .bind(serial_number)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(row_to_event).collect())
    }

    /// Count of failed verification attempts since `since`.
    pub async fn failed_auth_count_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM usb_events WHERE action = 'auth_failed' AND ts >= ?",
        )
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Delete events older than `days` days. Returns rows removed.
    pub async fn cleanup_older_than(&self, days: i64) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now().timestamp_millis() - days * 24 * 60 * 60 * 1000;
        let result = sqlx::query("DELETE FROM usb_events WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Option<AuditEvent> {
    let action_str: String = row.get("action");
    let action: AuditAction = match serde_json::from_str(&format!("\"{action_str}\"")) {
        Ok(action) => action,
        Err(_) => {
            tracing::warn!(action = %action_str, "unknown action in audit table");
            return None;
        }
    };
    let ts_millis: i64 = row.get("ts");
    let ts = DateTime::<Utc>::from_timestamp_millis(ts_millis)?;
    let auth_method: Option<AuthMethod> = row
        .get::<Option<String>, _>("auth_method")
        .and_then(|m| serde_json::from_str(&format!("\"{m}\"")).ok());
    Some(AuditEvent {
        ts,
        action,
        device_path: row.get("device_path"),
        vendor_id: row.get("vendor_id"),
        product_id: row.get("product_id"),
        vendor_name: row.get("vendor_name"),
        product_name: row.get("product_name"),
        serial_number: row.get("serial_number"),
        auth_method,
        success: row.get::<Option<i64>, _>("success").map(|v| v != 0),
        details: row.get("details"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use usbwarden_core::{DeviceId, DeviceInfo};

    async fn test_log() -> AuditLog {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        AuditLog::open(pool).await.unwrap()
    }

    fn device() -> DeviceInfo {
        DeviceInfo {
            device_id: DeviceId::parse("1-4").unwrap(),
            device_path: "/sys/bus/usb/devices/1-4".into(),
            vendor_id: "0781".into(),
            product_id: "5583".into(),
            vendor_name: "SanDisk".into(),
            product_name: "Ultra".into(),
            serial_number: Some("SER123".into()),
        }
    }

    #[tokio::test]
    async fn log_and_read_back() {
        let log = test_log().await;
        let event = AuditEvent::for_device(AuditAction::Authorized, &device())
            .with_auth_method(AuthMethod::Totp)
            .with_success(true);
        log.log(&event).await.unwrap();

        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        let read = &recent[0];
        assert_eq!(read.action, AuditAction::Authorized);
        assert_eq!(read.auth_method, Some(AuthMethod::Totp));
        assert_eq!(read.success, Some(true));
        assert_eq!(read.serial_number.as_deref(), Some("SER123"));
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let log = test_log().await;
        let mut early = AuditEvent::new(AuditAction::Connected);
        early.ts = Utc::now() - Duration::hours(1);
        log.log(&early).await.unwrap();
        log.log(&AuditEvent::new(AuditAction::Denied)).await.unwrap();

        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent[0].action, AuditAction::Denied);
        assert_eq!(recent[1].action, AuditAction::Connected);
    }

    #[tokio::test]
    async fn device_history_filters_by_serial() {
        let log = test_log().await;
        log.log(&AuditEvent::for_device(AuditAction::Connected, &device()))
            .await
            .unwrap();
        log.log(&AuditEvent::new(AuditAction::Connected)).await.unwrap();

        let history = log.device_history("SER123", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(log.device_history("OTHER", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_auth_counting() {
        let log = test_log().await;
        let since = Utc::now() - Duration::minutes(5);

        log.log(&AuditEvent::new(AuditAction::AuthFailed).with_success(false))
            .await
            .unwrap();
        log.log(&AuditEvent::new(AuditAction::AuthSuccess).with_success(true))
            .await
            .unwrap();
        let mut old = AuditEvent::new(AuditAction::AuthFailed);
        old.ts = Utc::now() - Duration::hours(2);
        log.log(&old).await.unwrap();

        assert_eq!(log.failed_auth_count_since(since).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_rows() {
        let log = test_log().await;
        let mut old = AuditEvent::new(AuditAction::Connected);
        old.ts = Utc::now() - Duration::days(100);
        log.log(&old).await.unwrap();
        log.log(&AuditEvent::new(AuditAction::Connected)).await.unwrap();

        assert_eq!(log.cleanup_older_than(90).await.unwrap(), 1);
        assert_eq!(log.recent(10).await.unwrap().len(), 1);
    }
}
