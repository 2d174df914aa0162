//! Cache index row.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One promoted media file.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct CacheEntryDbModel {
    pub media_id: String,
    /// Absolute path of the promoted file.
    pub local_path: String,
    pub url: String,
    /// SHA-256 hex of `url`; a different hash for the same media id means the remote
    /// file was replaced.
    pub url_hash: String,
    pub mime_type: String,
    pub size: i64,
    /// Unix epoch milliseconds (UTC).
    pub downloaded_at: i64,
    /// Unix epoch milliseconds (UTC).
    pub last_accessed: i64,
}
