//! Cache store.
//!
//! The in-memory index is the authority for "safe to render": an asset is cache-valid
//! only while its entry exists, was downloaded from the asset's current URL and its file
//! is still on disk with the recorded size. Every index change is mirrored to the
//! [`CacheIndexRepository`] so the cache survives restarts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, cache_file_name};
use crate::config::CacheConfig;
use crate::database::CacheIndexRepository;
use crate::database::time::datetime_to_ms;
use crate::domain::MediaAsset;
use crate::utils::fs::{ensure_dir_all, remove_file_if_exists};
use crate::{Error, Result};

const STAGING_DIR: &str = ".staging";

/// Snapshot of cache occupancy for the status surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

pub struct CacheStore {
    config: CacheConfig,
    staging_dir: PathBuf,
    index: Mutex<HashMap<String, CacheEntry>>,
    /// Media ids referenced by the current snapshot; never evicted by the size cap.
    protected: RwLock<HashSet<String>>,
    repo: Arc<dyn CacheIndexRepository>,
}

impl CacheStore {
    /// Open the cache directory and reload the persisted index.
    ///
    /// Leftover staging files from an interrupted run are removed, and index rows whose
    /// file disappeared are dropped.
    pub async fn open(config: CacheConfig, repo: Arc<dyn CacheIndexRepository>) -> Result<Self> {
        let staging_dir = config.dir.join(STAGING_DIR);
        ensure_dir_all(&config.dir).await?;
        ensure_dir_all(&staging_dir).await?;

        let stray = clear_dir_files(&staging_dir).await?;
        if stray > 0 {
            info!(count = stray, "Removed stray staging files");
        }

        let mut index = HashMap::new();
        for row in repo.list().await? {
            let entry = CacheEntry::from(row);
            if file_matches(&entry).await {
                index.insert(entry.media_id.clone(), entry);
            } else {
                debug!(media_id = %entry.media_id, "Dropping cache entry with missing file");
                repo.remove(&entry.media_id).await?;
            }
        }
        info!(entries = index.len(), dir = %config.dir.display(), "Media cache opened");

        Ok(Self {
            config,
            staging_dir,
            index: Mutex::new(index),
            protected: RwLock::new(HashSet::new()),
            repo,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Where a fully downloaded asset lives.
    pub fn final_path(&self, asset: &MediaAsset) -> PathBuf {
        self.config.dir.join(cache_file_name(asset))
    }

    /// Where an in-flight download is written before promotion.
    pub fn staging_path(&self, asset: &MediaAsset) -> PathBuf {
        self.staging_dir
            .join(format!("{}.part", cache_file_name(asset)))
    }

    pub fn entry(&self, media_id: &str) -> Option<CacheEntry> {
        self.index.lock().get(media_id).cloned()
    }

    /// Whether `asset` can be rendered from the cache without a download.
    pub async fn is_cache_valid(&self, asset: &MediaAsset) -> bool {
        match self.entry(&asset.id) {
            Some(entry) => entry.matches_url(asset) && file_matches(&entry).await,
            None => false,
        }
    }

    /// Path of a cache-valid file for `asset`.
    ///
    /// A stale entry (URL changed, file missing or truncated) is dropped so the next
    /// sync re-downloads it.
    pub async fn cached_path(&self, asset: &MediaAsset) -> Option<PathBuf> {
        let entry = self.entry(&asset.id)?;

        if entry.matches_url(asset) && file_matches(&entry).await {
            self.touch(&entry.media_id).await;
            return Some(entry.local_path);
        }

        debug!(media_id = %asset.id, "Cache entry is stale");
        if let Err(e) = self.remove(&asset.id).await {
            warn!(media_id = %asset.id, error = %e, "Failed to drop stale cache entry");
        }
        None
    }

    async fn touch(&self, media_id: &str) {
        let now = Utc::now();
        {
            let mut index = self.index.lock();
            if let Some(entry) = index.get_mut(media_id) {
                entry.last_accessed = now;
            }
        }
        if let Err(e) = self.repo.touch(media_id, datetime_to_ms(now)).await {
            warn!(media_id, error = %e, "Failed to persist cache access time");
        }
    }

    /// Check a finished download before promotion.
    ///
    /// Empty files are always rejected. A size differing from the declared size by more
    /// than the configured tolerance is rejected only with `reject_size_mismatch`;
    /// otherwise it is logged and accepted (servers may transcode).
    pub fn validate_download(&self, asset: &MediaAsset, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Err(Error::validation(format!("download of {} is empty", asset.id)));
        }

        let Some(declared) = asset.file_size.filter(|s| *s > 0) else {
            return Ok(());
        };
        let deviation = bytes.abs_diff(declared) as f64 / declared as f64;
        if deviation <= self.config.size_tolerance {
            return Ok(());
        }

        if self.config.reject_size_mismatch {
            return Err(Error::validation(format!(
                "size of {} is {bytes} bytes, declared {declared}",
                asset.id
            )));
        }
        warn!(
            media_id = %asset.id,
            bytes,
            declared,
            deviation_pct = (deviation * 100.0).round(),
            "Downloaded size differs from declared size, accepting"
        );
        Ok(())
    }

    /// Move a validated staging file into place and index it.
    pub async fn promote(&self, asset: &MediaAsset, staging: &Path, size: u64) -> Result<PathBuf> {
        let final_path = self.final_path(asset);
        tokio::fs::rename(staging, &final_path)
            .await
            .map_err(|e| Error::io_path("promoting download", &final_path, e))?;

        let entry = CacheEntry::new(asset, final_path.clone(), size);
        let previous = self.index.lock().insert(asset.id.clone(), entry.clone());

        // The asset URL changed: the old file has a different name.
        if let Some(previous) = previous
            && previous.local_path != final_path
        {
            remove_file_if_exists(&previous.local_path).await?;
        }

        if let Err(e) = self.repo.upsert(&(&entry).into()).await {
            warn!(media_id = %asset.id, error = %e, "Failed to persist cache entry");
        }
        debug!(media_id = %asset.id, path = %final_path.display(), size, "Promoted download");
        Ok(final_path)
    }

    /// Remove one entry and its file.
    pub async fn remove(&self, media_id: &str) -> Result<bool> {
        let removed = self.index.lock().remove(media_id);
        let Some(entry) = removed else {
            return Ok(false);
        };
        remove_file_if_exists(&entry.local_path).await?;
        self.repo.remove(media_id).await?;
        Ok(true)
    }

    /// Mark the media ids of the current snapshot as protected from size eviction.
    pub fn set_protected<I>(&self, media_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        *self.protected.write() = media_ids.into_iter().collect();
    }

    /// Remove entries not accessed within `max_age`.
    pub async fn evict_older_than(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| Error::config(format!("cache max age out of range: {e}")))?;
        let cutoff = Utc::now() - max_age;

        let expired: Vec<String> = {
            let protected = self.protected.read();
            self.index
                .lock()
                .values()
                .filter(|e| e.last_accessed < cutoff && !protected.contains(&e.media_id))
                .map(|e| e.media_id.clone())
                .collect()
        };

        let mut removed = 0;
        for media_id in expired {
            if self.remove(&media_id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Evicted expired cache entries");
        }
        Ok(removed)
    }

    /// Evict least recently accessed entries until the cache fits its size cap.
    pub async fn enforce_size_limit(&self) -> Result<usize> {
        let victims: Vec<String> = {
            let protected = self.protected.read();
            let index = self.index.lock();
            let mut total: u64 = index.values().map(|e| e.size).sum();
            if total <= self.config.max_size_bytes {
                return Ok(0);
            }

            let mut candidates: Vec<&CacheEntry> = index
                .values()
                .filter(|e| !protected.contains(&e.media_id))
                .collect();
            candidates.sort_by_key(|e| e.last_accessed);

            let mut victims = Vec::new();
            for entry in candidates {
                if total <= self.config.max_size_bytes {
                    break;
                }
                total = total.saturating_sub(entry.size);
                victims.push(entry.media_id.clone());
            }
            victims
        };

        let mut removed = 0;
        for media_id in &victims {
            if self.remove(media_id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, max_bytes = self.config.max_size_bytes, "Evicted cache entries over size cap");
        }
        Ok(removed)
    }

    /// Remove every cached file and index entry. In-flight staging files are left alone.
    pub async fn wipe_all(&self) -> Result<usize> {
        let count = {
            let mut index = self.index.lock();
            let count = index.len();
            index.clear();
            count
        };
        self.repo.clear().await?;
        clear_dir_files(&self.config.dir).await?;
        info!(entries = count, "Media cache wiped");
        Ok(count)
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        CacheStats {
            entries: index.len(),
            total_bytes: index.values().map(|e| e.size).sum(),
            max_bytes: self.config.max_size_bytes,
        }
    }
}

/// Whether the entry's file exists with the recorded, non-zero size.
async fn file_matches(entry: &CacheEntry) -> bool {
    match tokio::fs::metadata(&entry.local_path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0 && meta.len() == entry.size,
        Err(_) => false,
    }
}

/// Delete the regular files directly inside `dir`. Returns how many were removed.
async fn clear_dir_files(dir: &Path) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::io_path("reading directory", dir, e))?;
    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("reading directory", dir, e))?
    {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && remove_file_if_exists(&entry.path()).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqlxCacheIndexRepository;
    use crate::database::test_support::setup_test_db;

    fn asset(id: &str, size: Option<u64>) -> MediaAsset {
        MediaAsset {
            id: id.into(),
            name: format!("asset {id}"),
            url: format!("https://cdn.example.com/{id}.jpg"),
            mime_type: "image/jpeg".into(),
            file_size: size,
            duration: None,
        }
    }

    struct Fixture {
        store: CacheStore,
        pool: crate::database::DbPool,
        config: CacheConfig,
        _db_dir: tempfile::TempDir,
        _cache_dir: tempfile::TempDir,
    }

    async fn fixture(max_size_bytes: u64) -> Fixture {
        let (pool, db_dir) = setup_test_db().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            dir: cache_dir.path().join("media"),
            max_size_bytes,
            ..CacheConfig::default()
        };
        let repo = Arc::new(SqlxCacheIndexRepository::new(pool.clone()));
        let store = CacheStore::open(config.clone(), repo).await.unwrap();
        Fixture {
            store,
            pool,
            config,
            _db_dir: db_dir,
            _cache_dir: cache_dir,
        }
    }

    async fn put(store: &CacheStore, asset: &MediaAsset, bytes: &[u8]) -> PathBuf {
        let staging = store.staging_path(asset);
        tokio::fs::write(&staging, bytes).await.unwrap();
        store
            .promote(asset, &staging, bytes.len() as u64)
            .await
            .unwrap()
    }

    /// Backdate last access times, in seconds before now.
    fn age(store: &CacheStore, ages: &[(&str, i64)]) {
        let now = Utc::now();
        let mut index = store.index.lock();
        for (id, secs) in ages {
            if let Some(entry) = index.get_mut(*id) {
                entry.last_accessed = now - chrono::Duration::seconds(*secs);
            }
        }
    }

    #[tokio::test]
    async fn test_promote_then_cached_path_then_wipe() {
        let f = fixture(u64::MAX).await;
        let a = asset("a", Some(5));

        assert_eq!(f.store.cached_path(&a).await, None);
        let path = put(&f.store, &a, b"hello").await;

        let cached = f.store.cached_path(&a).await.unwrap();
        assert_eq!(cached, path);
        assert_eq!(std::fs::metadata(&cached).unwrap().len(), 5);

        assert_eq!(f.store.wipe_all().await.unwrap(), 1);
        assert_eq!(f.store.cached_path(&a).await, None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_url_change_drops_entry() {
        let f = fixture(u64::MAX).await;
        let a = asset("a", None);
        put(&f.store, &a, b"data").await;

        let mut moved = a.clone();
        moved.url = "https://cdn.example.com/a-v2.jpg".into();
        assert!(!f.store.is_cache_valid(&moved).await);
        assert_eq!(f.store.cached_path(&moved).await, None);
        assert!(f.store.entry("a").is_none());
    }

    #[tokio::test]
    async fn test_truncated_file_is_invalid() {
        let f = fixture(u64::MAX).await;
        let a = asset("a", None);
        let path = put(&f.store, &a, b"full content").await;
        tokio::fs::write(&path, b"cut").await.unwrap();
        assert!(!f.store.is_cache_valid(&a).await);
    }

    #[tokio::test]
    async fn test_validate_download_tolerance() {
        let mut f = fixture(u64::MAX).await;
        let declared = asset("a", Some(1000));

        assert!(f.store.validate_download(&declared, 0).is_err());
        assert!(f.store.validate_download(&declared, 700).is_ok());
        // Way off, but accepted by default.
        assert!(f.store.validate_download(&declared, 100).is_ok());

        f.store.config.reject_size_mismatch = true;
        assert!(f.store.validate_download(&declared, 100).is_err());
        assert!(f.store.validate_download(&declared, 1200).is_ok());
    }

    #[tokio::test]
    async fn test_size_cap_evicts_lru_but_not_protected() {
        let f = fixture(10).await;
        let a = asset("a", None);
        let b = asset("b", None);
        let c = asset("c", None);
        put(&f.store, &a, b"aaaa").await;
        put(&f.store, &b, b"bbbb").await;
        put(&f.store, &c, b"cccc").await;
        age(&f.store, &[("a", 30), ("b", 20), ("c", 10)]);

        // `a` is the oldest but protected; `b` goes instead.
        f.store.set_protected(["a".to_string()]);
        assert_eq!(f.store.enforce_size_limit().await.unwrap(), 1);
        assert!(f.store.entry("a").is_some());
        assert!(f.store.entry("b").is_none());
        assert!(f.store.entry("c").is_some());
        assert_eq!(f.store.stats().total_bytes, 8);
    }

    #[tokio::test]
    async fn test_evict_older_than() {
        let f = fixture(u64::MAX).await;
        let a = asset("a", None);
        put(&f.store, &a, b"aaaa").await;
        age(&f.store, &[("a", 120)]);
        assert_eq!(f.store.evict_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(f.store.evict_older_than(Duration::from_secs(60)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reopen_reloads_index_and_clears_staging() {
        let f = fixture(u64::MAX).await;
        let a = asset("a", None);
        let b = asset("b", None);
        put(&f.store, &a, b"aaaa").await;
        let b_path = put(&f.store, &b, b"bbbb").await;
        tokio::fs::remove_file(&b_path).await.unwrap();

        let stray = f.store.staging_path(&asset("c", None));
        tokio::fs::write(&stray, b"partial").await.unwrap();

        let repo = Arc::new(SqlxCacheIndexRepository::new(f.pool.clone()));
        let reopened = CacheStore::open(f.config.clone(), repo).await.unwrap();
        assert!(reopened.is_cache_valid(&a).await);
        assert!(reopened.entry("b").is_none());
        assert!(!stray.exists());
        assert_eq!(reopened.stats().entries, 1);
    }
}
