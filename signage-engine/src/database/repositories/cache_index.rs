//! Cache index repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::CacheEntryDbModel;

#[async_trait]
pub trait CacheIndexRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<CacheEntryDbModel>>;

    /// Insert or replace the entry for `entry.media_id`.
    async fn upsert(&self, entry: &CacheEntryDbModel) -> Result<()>;

    async fn remove(&self, media_id: &str) -> Result<()>;

    async fn touch(&self, media_id: &str, last_accessed: i64) -> Result<()>;

    /// Remove every entry. Returns the number of rows deleted.
    async fn clear(&self) -> Result<u64>;
}

/// SQLx implementation of CacheIndexRepository.
pub struct SqlxCacheIndexRepository {
    pool: SqlitePool,
}

impl SqlxCacheIndexRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheIndexRepository for SqlxCacheIndexRepository {
    async fn list(&self) -> Result<Vec<CacheEntryDbModel>> {
        let entries = sqlx::query_as::<_, CacheEntryDbModel>(
            "SELECT * FROM cache_entries ORDER BY last_accessed ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn upsert(&self, entry: &CacheEntryDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (
                media_id, local_path, url, url_hash, mime_type, size, downloaded_at, last_accessed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(media_id) DO UPDATE SET
                local_path = excluded.local_path,
                url = excluded.url,
                url_hash = excluded.url_hash,
                mime_type = excluded.mime_type,
                size = excluded.size,
                downloaded_at = excluded.downloaded_at,
                last_accessed = excluded.last_accessed
            "#,
        )
        .bind(&entry.media_id)
        .bind(&entry.local_path)
        .bind(&entry.url)
        .bind(&entry.url_hash)
        .bind(&entry.mime_type)
        .bind(entry.size)
        .bind(entry.downloaded_at)
        .bind(entry.last_accessed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, media_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE media_id = ?")
            .bind(media_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch(&self, media_id: &str, last_accessed: i64) -> Result<()> {
        sqlx::query("UPDATE cache_entries SET last_accessed = ? WHERE media_id = ?")
            .bind(last_accessed)
            .bind(media_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
