//! Engine configuration.
//!
//! Every field has a default; `EngineConfig::from_env` overrides them from `SIGNAGE_*`
//! environment variables (a `.env` file is loaded by the binary before this runs).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which notification strategy the channel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMode {
    /// Long-lived server-sent-event connection.
    Streaming,
    /// Periodic poll with server-recommended cadence.
    #[default]
    Polling,
}

impl NotificationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Polling => "polling",
        }
    }
}

impl FromStr for NotificationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streaming" | "stream" | "sse" => Ok(Self::Streaming),
            "polling" | "poll" => Ok(Self::Polling),
            other => Err(Error::config(format!("unknown notification mode: {other}"))),
        }
    }
}

impl std::fmt::Display for NotificationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadQueueConfig {
    /// Number of concurrent download workers.
    pub workers: usize,
    /// Maximum wait for the next body chunk.
    pub chunk_timeout: Duration,
    /// Minimum spacing between progress events for one task.
    pub progress_interval: Duration,
    /// Capacity of the download event broadcast channel.
    pub event_capacity: usize,
}

impl Default for DownloadQueueConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            chunk_timeout: Duration::from_secs(60),
            progress_interval: Duration::from_millis(500),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Entries not accessed for this long are swept.
    pub max_age: Duration,
    /// Total size cap; least recently accessed entries go first.
    pub max_size_bytes: u64,
    /// Accepted relative difference between declared and downloaded size.
    pub size_tolerance: f64,
    /// Discard downloads whose size differs by more than `size_tolerance`.
    pub reject_size_mismatch: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/media"),
            max_age: Duration::from_secs(30 * 24 * 3600),
            max_size_bytes: 1024 * 1024 * 1024,
            size_tolerance: 0.5,
            reject_size_mismatch: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub mode: NotificationMode,
    /// First reconnect delay of the streaming strategy.
    pub stream_backoff_base: Duration,
    pub stream_backoff_max: Duration,
    /// Reconnect attempts before the stream reports degraded.
    pub stream_max_attempts: u32,
    /// Poll interval used until the server recommends one.
    pub poll_interval: Duration,
    /// Finest poll cadence; also used in emergency mode.
    pub poll_min_interval: Duration,
    /// Coarsest poll cadence.
    pub poll_max_interval: Duration,
    pub poll_error_base: Duration,
    pub poll_error_ceiling: Duration,
    /// Per-listener queue depth.
    pub listener_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            mode: NotificationMode::Polling,
            stream_backoff_base: Duration::from_secs(1),
            stream_backoff_max: Duration::from_secs(60),
            stream_max_attempts: 10,
            poll_interval: Duration::from_secs(60),
            poll_min_interval: Duration::from_secs(5),
            poll_max_interval: Duration::from_secs(3600),
            poll_error_base: Duration::from_secs(30),
            poll_error_ceiling: Duration::from_secs(600),
            listener_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub interval: Duration,
    pub error_base: Duration,
    pub error_ceiling: Duration,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            error_base: Duration::from_secs(30),
            error_ceiling: Duration::from_secs(1800),
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Pause between two items.
    pub transition_delay: Duration,
    /// Added to a video's duration before the timeout fallback advances.
    pub video_grace: Duration,
    /// Timeout for videos of unknown duration.
    pub video_fallback: Duration,
    /// Extra attempts for a failing remote embed before skipping it.
    pub embed_retries: u32,
    pub event_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            transition_delay: Duration::from_millis(500),
            video_grace: Duration::from_secs(5),
            video_fallback: Duration::from_secs(300),
            embed_retries: 1,
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Rolling window for error and crash counting.
    pub window: Duration,
    /// Critical errors within the window that trigger a restart.
    pub critical_threshold: usize,
    /// Consecutive crashes within the window that trigger a restart.
    pub crash_threshold: usize,
    /// Component errors within the window that raise an alert.
    pub transient_alert_threshold: usize,
    pub restart_delay: Duration,
    pub health_interval: Duration,
    /// Used/total memory ratio that triggers memory recovery.
    pub memory_threshold: f64,
    /// Restarts allowed within `restart_window` before the guard suppresses them.
    pub max_restarts_per_window: usize,
    pub restart_window: Duration,
    /// Crash records kept in the journal.
    pub crash_journal_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            critical_threshold: 5,
            crash_threshold: 3,
            transient_alert_threshold: 10,
            restart_delay: Duration::from_secs(10),
            health_interval: Duration::from_secs(30),
            memory_threshold: 0.9,
            max_restarts_per_window: 3,
            restart_window: Duration::from_secs(3600),
            crash_journal_capacity: 50,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Holds the database, logs and crash journal.
    pub data_dir: PathBuf,
    pub api_base_url: String,
    /// Seeds the persisted device identity on first start.
    pub device_token: Option<String>,
    pub device_id: Option<String>,
    pub screen_id: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub download: DownloadQueueConfig,
    pub cache: CacheConfig,
    pub notification: NotificationConfig,
    pub sync: SyncConfig,
    pub playback: PlaybackConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_data_dir("data")
    }
}

impl EngineConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            cache: CacheConfig {
                dir: data_dir.join("media"),
                ..CacheConfig::default()
            },
            data_dir,
            api_base_url: "http://localhost:3000".to_string(),
            device_token: None,
            device_id: None,
            screen_id: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            download: DownloadQueueConfig::default(),
            notification: NotificationConfig::default(),
            sync: SyncConfig::default(),
            playback: PlaybackConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("signage.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn crash_journal_path(&self) -> PathBuf {
        self.data_dir.join("crashes.json")
    }

    /// Load from `SIGNAGE_*` environment variables.
    ///
    /// Environment variables:
    /// - `SIGNAGE_DATA_DIR`: state directory (default: `data`)
    /// - `SIGNAGE_API_BASE_URL`: backend base URL
    /// - `SIGNAGE_DEVICE_TOKEN`, `SIGNAGE_DEVICE_ID`, `SIGNAGE_SCREEN_ID`: identity seed
    /// - `SIGNAGE_CACHE_DIR`: media cache directory (default: `<data>/media`)
    /// - `SIGNAGE_CACHE_MAX_BYTES`, `SIGNAGE_CACHE_MAX_AGE_DAYS`
    /// - `SIGNAGE_SIZE_TOLERANCE`, `SIGNAGE_REJECT_SIZE_MISMATCH`
    /// - `SIGNAGE_DOWNLOAD_WORKERS`
    /// - `SIGNAGE_NOTIFICATION_MODE`: `polling` or `streaming`
    /// - `SIGNAGE_POLL_INTERVAL_SECS`, `SIGNAGE_SYNC_INTERVAL_SECS`
    /// - `SIGNAGE_RESTART_DELAY_SECS`, `SIGNAGE_HEALTH_INTERVAL_SECS`
    pub fn from_env() -> Result<Self> {
        let data_dir = env_string("SIGNAGE_DATA_DIR").unwrap_or_else(|| "data".to_string());
        let mut config = Self::with_data_dir(data_dir);

        if let Some(url) = env_string("SIGNAGE_API_BASE_URL") {
            config.api_base_url = url;
        }
        config.device_token = env_string("SIGNAGE_DEVICE_TOKEN");
        config.device_id = env_string("SIGNAGE_DEVICE_ID");
        config.screen_id = env_string("SIGNAGE_SCREEN_ID");

        if let Some(dir) = env_string("SIGNAGE_CACHE_DIR") {
            config.cache.dir = PathBuf::from(dir);
        }
        if let Some(bytes) = env_parse("SIGNAGE_CACHE_MAX_BYTES") {
            config.cache.max_size_bytes = bytes;
        }
        if let Some(days) = env_parse::<u64>("SIGNAGE_CACHE_MAX_AGE_DAYS") {
            config.cache.max_age = Duration::from_secs(days * 24 * 3600);
        }
        if let Some(tolerance) = env_parse("SIGNAGE_SIZE_TOLERANCE") {
            config.cache.size_tolerance = tolerance;
        }
        if let Some(reject) = env_bool("SIGNAGE_REJECT_SIZE_MISMATCH") {
            config.cache.reject_size_mismatch = reject;
        }
        if let Some(workers) = env_parse("SIGNAGE_DOWNLOAD_WORKERS") {
            config.download.workers = workers;
        }
        if let Some(mode) = env_string("SIGNAGE_NOTIFICATION_MODE") {
            config.notification.mode = mode.parse()?;
        }
        if let Some(secs) = env_secs("SIGNAGE_POLL_INTERVAL_SECS") {
            config.notification.poll_interval = secs;
        }
        if let Some(secs) = env_secs("SIGNAGE_SYNC_INTERVAL_SECS") {
            config.sync.interval = secs;
        }
        if let Some(secs) = env_secs("SIGNAGE_RESTART_DELAY_SECS") {
            config.supervisor.restart_delay = secs;
        }
        if let Some(secs) = env_secs("SIGNAGE_HEALTH_INTERVAL_SECS") {
            config.supervisor.health_interval = secs;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api_base_url)
            .map_err(|e| Error::config(format!("invalid api base url: {e}")))?;
        if self.download.workers == 0 {
            return Err(Error::config("download workers must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.cache.size_tolerance) {
            return Err(Error::config("size tolerance must be within 0.0..=1.0"));
        }
        if self.notification.poll_min_interval > self.notification.poll_max_interval {
            return Err(Error::config("poll min interval exceeds max interval"));
        }
        if self.sync.interval.is_zero() {
            return Err(Error::config("sync interval must be non-zero"));
        }
        Ok(())
    }

    /// Move the data and cache directories under `root`. Used by tests.
    pub fn rebase(mut self, root: &Path) -> Self {
        self.data_dir = root.to_path_buf();
        self.cache.dir = root.join("media");
        self
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment value");
            None
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.download.workers, 3);
        assert_eq!(config.cache.max_size_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.sync.interval, Duration::from_secs(300));
        assert_eq!(config.cache.dir, PathBuf::from("data").join("media"));
    }

    #[test]
    fn test_notification_mode_parse() {
        assert_eq!("SSE".parse::<NotificationMode>().unwrap(), NotificationMode::Streaming);
        assert_eq!("poll".parse::<NotificationMode>().unwrap(), NotificationMode::Polling);
        assert!("carrier-pigeon".parse::<NotificationMode>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.cache.size_tolerance = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.api_base_url = "not a url".into();
        assert!(config.validate().is_err());
    }
}
