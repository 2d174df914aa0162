use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::database::CacheEntryDbModel;
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::MediaAsset;
use crate::utils::filename::sanitize_component;

/// SHA-256 hex digest of an asset URL.
pub fn url_fingerprint(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Content-addressed cache filename: `<hash16>-<name>.<ext>`.
pub(crate) fn cache_file_name(asset: &MediaAsset) -> String {
    let mut hasher = Sha256::new();
    hasher.update(asset.id.as_bytes());
    hasher.update([0u8]);
    hasher.update(asset.url.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let stem = if asset.name.is_empty() {
        sanitize_component(&asset.id)
    } else {
        sanitize_component(&asset.name)
    };
    format!("{}-{}.{}", &digest[..16], stem, asset.file_extension())
}

/// A media file promoted into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub media_id: String,
    pub local_path: PathBuf,
    pub url: String,
    pub url_hash: String,
    pub mime_type: String,
    pub size: u64,
    pub downloaded_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(asset: &MediaAsset, local_path: PathBuf, size: u64) -> Self {
        let now = Utc::now();
        Self {
            media_id: asset.id.clone(),
            local_path,
            url: asset.url.clone(),
            url_hash: url_fingerprint(&asset.url),
            mime_type: asset.mime_type.clone(),
            size,
            downloaded_at: now,
            last_accessed: now,
        }
    }

    /// Whether this entry was downloaded from the asset's current URL.
    pub fn matches_url(&self, asset: &MediaAsset) -> bool {
        self.url_hash == url_fingerprint(&asset.url)
    }
}

impl From<&CacheEntry> for CacheEntryDbModel {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            media_id: entry.media_id.clone(),
            local_path: entry.local_path.to_string_lossy().into_owned(),
            url: entry.url.clone(),
            url_hash: entry.url_hash.clone(),
            mime_type: entry.mime_type.clone(),
            size: i64::try_from(entry.size).unwrap_or(i64::MAX),
            downloaded_at: datetime_to_ms(entry.downloaded_at),
            last_accessed: datetime_to_ms(entry.last_accessed),
        }
    }
}

impl From<CacheEntryDbModel> for CacheEntry {
    fn from(row: CacheEntryDbModel) -> Self {
        Self {
            media_id: row.media_id,
            local_path: PathBuf::from(row.local_path),
            url: row.url,
            url_hash: row.url_hash,
            mime_type: row.mime_type,
            size: u64::try_from(row.size).unwrap_or(0),
            downloaded_at: ms_to_datetime(row.downloaded_at),
            last_accessed: ms_to_datetime(row.last_accessed),
        }
    }
}
