//! Device key/value state repository.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use sqlx::SqlitePool;

use crate::Result;
use crate::database::time::now_ms;

/// Well-known device state keys.
pub mod keys {
    pub const DEVICE_TOKEN: &str = "device_token";
    pub const DEVICE_ID: &str = "device_id";
    pub const SCREEN_ID: &str = "screen_id";
    pub const API_BASE_URL: &str = "api_base_url";
    pub const LAST_SNAPSHOT: &str = "last_snapshot";
    pub const LAST_SYNC: &str = "last_sync";
    pub const ERROR_COUNTERS: &str = "error_counters";
    pub const RESTART_HISTORY: &str = "restart_history";

    /// Keys removed when the backend reports the terminal as unpaired.
    pub const CREDENTIALS: &[&str] = &[DEVICE_TOKEN, DEVICE_ID, SCREEN_ID];
}

/// Device state repository trait.
#[async_trait]
pub trait DeviceStateRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete several keys in one transaction.
    async fn delete_many(&self, keys: &[&str]) -> Result<()>;
}

/// Read a JSON value; an unparsable value is treated as missing.
pub async fn get_json<T: DeserializeOwned>(
    repo: &dyn DeviceStateRepository,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = repo.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(key, error = %e, "Discarding unreadable device state value");
            Ok(None)
        }
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    repo: &dyn DeviceStateRepository,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    repo.set(key, &raw).await
}

/// SQLx implementation of DeviceStateRepository.
pub struct SqlxDeviceStateRepository {
    pool: SqlitePool,
}

impl SqlxDeviceStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStateRepository for SqlxDeviceStateRepository {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM device_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_state (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM device_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[&str]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query("DELETE FROM device_state WHERE key = ?")
                .bind(*key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
