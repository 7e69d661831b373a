//! SQLite-backed persistence for the enrolled credential.
//!
//! One TOTP secret and a batch of recovery-code hashes. The single-row
//! `credentials` table makes "is anything enrolled" a cheap existence check,
//! and consuming a recovery code is a single `DELETE` so a code can never be
//! accepted twice.

use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// Errors from the credential store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no credential is enrolled")]
    NotConfigured,
    #[error("recovery code was already used")]
    CodeAlreadyUsed,
}

/// Handle to the credential tables.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
}

impl CredentialStore {
    /// Open the store, creating tables if needed.
    pub async fn open(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                totp_secret TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recovery_codes (
                code_hash TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// True once a secret has been enrolled.
    pub async fn is_configured(&self) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM credentials WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Enroll a secret and its recovery hashes, replacing any previous
    /// enrollment. The write is transactional: either the new credential is
    /// fully in place or the old one is untouched.
    pub async fn save(&self, secret: &str, recovery_hashes: &[String]) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM credentials").execute(&mut *tx).await?;
        sqlx::query("INSERT INTO credentials (id, totp_secret, created_at) VALUES (1, ?, ?)")
            .bind(secret)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM recovery_codes").execute(&mut *tx).await?;
        for (position, hash) in recovery_hashes.iter().enumerate() {
            sqlx::query(
                "INSERT INTO recovery_codes (code_hash, position, created_at) VALUES (?, ?, ?)",
            )
            .bind(hash)
            .bind(position as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Replace only the recovery codes, keeping the enrolled secret.
    pub async fn replace_recovery_codes(
        &self,
        recovery_hashes: &[String],
    ) -> Result<(), StoreError> {
        if !self.is_configured().await? {
            return Err(StoreError::NotConfigured);
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM recovery_codes").execute(&mut *tx).await?;
        for (position, hash) in recovery_hashes.iter().enumerate() {
            sqlx::query(
                "INSERT INTO recovery_codes (code_hash, position, created_at) VALUES (?, ?, ?)",
            )
            .bind(hash)
            .bind(position as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// The enrolled TOTP secret, if any.
    pub async fn load_secret(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT totp_secret FROM credentials WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("totp_secret")))
    }

    /// Remaining recovery hashes in enrollment order.
    pub async fn recovery_hashes(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT code_hash FROM recovery_codes ORDER BY position")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<String, _>("code_hash"))
            .collect())
    }

    /// Number of recovery codes not yet used.
    pub async fn remaining_recovery_codes(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM recovery_codes")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Remove a recovery hash, failing if it was already gone.
    ///
    /// The single-statement `DELETE` is the consumption gate: whoever gets
    /// `rows_affected() == 1` owns the code, any later caller gets
    /// [`StoreError::CodeAlreadyUsed`].
    pub async fn consume_recovery_code(&self, code_hash: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM recovery_codes WHERE code_hash = ?")
            .bind(code_hash)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CodeAlreadyUsed);
        }
        Ok(())
    }

    /// Drop the enrollment entirely.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM credentials").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM recovery_codes").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
