//! Sync orchestrator.
//!
//! Each cycle fetches the sync metadata, skips the rest when nothing changed, enqueues
//! every reachable asset that is not cached and publishes the current content snapshot.
//! Failures back off exponentially; an unpaired terminal drops its credentials and
//! cache and waits in `Onboarding` for a forced sync.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{SyncEvent, SyncState};
use crate::Result;
use crate::config::SyncConfig;
use crate::database::repositories::device_state::{
    DeviceStateRepository, get_json, keys, set_json,
};
use crate::domain::{CurrentContentSnapshot, Priority, SyncResponse, resolve_active};
use crate::downloader::{DownloadQueue, EnqueueOutcome};
use crate::supervisor::{ErrorReport, ErrorSink, ErrorSource};
use crate::transport::BackendApi;
use crate::utils::backoff::exponential_backoff;

/// A loop is considered hung when its last cycle is older than this many waits.
const STALL_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Nothing changed since the last full cycle. No downloads are queued.
    Unchanged,
    Updated {
        enqueued: usize,
        snapshot_changed: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub consecutive_failures: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Wait before the next cycle; `None` while onboarding.
    pub next_sync_in: Option<Duration>,
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    api: Arc<dyn BackendApi>,
    queue: Arc<DownloadQueue>,
    device_state: Arc<dyn DeviceStateRepository>,
    errors: Option<Arc<dyn ErrorSink>>,
    snapshot: watch::Sender<Arc<CurrentContentSnapshot>>,
    events: broadcast::Sender<SyncEvent>,
    status: RwLock<SyncStatus>,
    last_fingerprint: Mutex<Option<String>>,
    force_full: AtomicBool,
    wake: Notify,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        api: Arc<dyn BackendApi>,
        queue: Arc<DownloadQueue>,
        device_state: Arc<dyn DeviceStateRepository>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (snapshot, _) = watch::channel(Arc::new(CurrentContentSnapshot::empty()));
        Self {
            config,
            api,
            queue,
            device_state,
            errors: None,
            snapshot,
            events,
            status: RwLock::new(SyncStatus {
                state: SyncState::Idle,
                consecutive_failures: 0,
                last_attempt_at: None,
                last_success_at: None,
                last_error: None,
                next_sync_in: None,
            }),
            last_fingerprint: Mutex::new(None),
            force_full: AtomicBool::new(false),
            wake: Notify::new(),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.errors = Some(sink);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Arc<CurrentContentSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Arc<CurrentContentSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> SyncState {
        self.status.read().state
    }

    /// Publish the snapshot persisted by a previous run, if any.
    pub async fn restore_snapshot(&self) -> Result<bool> {
        let Some(snapshot) =
            get_json::<CurrentContentSnapshot>(self.device_state.as_ref(), keys::LAST_SNAPSHOT)
                .await?
        else {
            return Ok(false);
        };
        info!(
            schedule_id = ?snapshot.schedule.as_ref().map(|s| &s.id),
            "Restored last known content"
        );
        self.queue
            .cache()
            .set_protected(snapshot.assets().into_iter().map(|a| a.id));
        self.snapshot.send_replace(Arc::new(snapshot));
        Ok(true)
    }

    /// Run a full cycle now, bypassing the wait and the unchanged-content skip.
    pub fn force_sync(&self) {
        debug!("Forced sync requested");
        self.force_full.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Whether the loop should have completed a cycle by now but has not.
    pub fn is_stalled(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let status = self.status.read();
        let Some(wait) = status.next_sync_in else {
            return false;
        };
        let Some(last) = status.last_attempt_at else {
            return false;
        };
        let allowed = wait.max(self.config.interval).saturating_mul(STALL_FACTOR);
        let age = (Utc::now() - last).to_std().unwrap_or_default();
        age > allowed
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        info!(interval_secs = self.config.interval.as_secs(), "Starting sync orchestrator");
        *task = Some(tokio::spawn(Arc::clone(self).run_loop(token)));
    }

    pub async fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && e.is_panic()
        {
            error!("Sync loop panicked: {}", e);
        }
    }

    /// Restart the loop and sync immediately.
    pub async fn restart(self: &Arc<Self>) {
        info!("Restarting sync orchestrator");
        self.stop().await;
        self.force_full.store(true, Ordering::SeqCst);
        self.start();
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let wait = tokio::select! {
                _ = cancel.cancelled() => break,
                wait = self.sync_once() => wait,
            };

            match wait {
                Some(wait) => {
                    debug!(wait_secs = wait.as_secs(), "Next sync scheduled");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }
        debug!("Sync loop stopped");
    }

    /// Run one cycle with state bookkeeping. Returns the wait before the next one, or
    /// `None` when only a forced sync should wake the loop.
    pub async fn sync_once(&self) -> Option<Duration> {
        let onboarding = self.state() == SyncState::Onboarding;
        if !onboarding {
            self.set_state(SyncState::Syncing);
        }

        let result = self.run_cycle().await;
        let now = Utc::now();

        match result {
            Ok(outcome) => {
                debug!(?outcome, "Sync cycle finished");
                {
                    let mut status = self.status.write();
                    status.consecutive_failures = 0;
                    status.last_attempt_at = Some(now);
                    status.last_success_at = Some(now);
                    status.last_error = None;
                    status.next_sync_in = Some(self.config.interval);
                }
                if let Err(e) = set_json(self.device_state.as_ref(), keys::LAST_SYNC, &now).await {
                    warn!(error = %e, "Failed to persist last sync time");
                }
                self.set_state(SyncState::Idle);
                Some(self.config.interval)
            }
            Err(e) if e.is_unpaired() => {
                self.handle_unpaired().await;
                let mut status = self.status.write();
                status.last_attempt_at = Some(now);
                status.next_sync_in = None;
                None
            }
            Err(e) => {
                let (failures, wait) = {
                    let mut status = self.status.write();
                    status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                    let wait = exponential_backoff(
                        self.config.error_base,
                        status.consecutive_failures,
                        self.config.error_ceiling,
                    );
                    status.last_attempt_at = Some(now);
                    status.last_error = Some(e.to_string());
                    status.next_sync_in = Some(wait);
                    (status.consecutive_failures, wait)
                };
                warn!(
                    error = %e,
                    failures,
                    retry_in_secs = wait.as_secs(),
                    "Sync cycle failed"
                );
                if let Some(errors) = &self.errors {
                    errors.report(ErrorReport::new(ErrorSource::Sync, &e));
                }
                self.publish(SyncEvent::SyncError {
                    error: e.to_string(),
                    consecutive_failures: failures,
                    network: e.is_network(),
                });
                if !onboarding {
                    self.set_state(SyncState::ErrorBackoff);
                }
                Some(wait)
            }
        }
    }

    /// One sync cycle without state bookkeeping.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let forced = self.force_full.swap(false, Ordering::SeqCst);
        let sync = self.api.fetch_sync().await?;
        let fingerprint = sync.fingerprint();

        let unchanged = !forced
            && !sync.schedule_changed
            && !sync.media_changed
            && self.last_fingerprint.lock().as_deref() == Some(fingerprint.as_str());
        if unchanged {
            debug!("Schedules and media unchanged");
            return Ok(CycleOutcome::Unchanged);
        }

        if self.state() == SyncState::Onboarding {
            info!("Backend accepted this terminal again");
        }

        let enqueued = self.enqueue_reachable(&sync).await;
        info!(
            schedules = sync.schedules.len(),
            enqueued, "Synced schedules"
        );

        let snapshot = match self.api.fetch_current_content().await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_unpaired() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Current content unavailable, resolving locally");
                sync.resolve_snapshot(Local::now().naive_local())
            }
        };

        for asset in snapshot.assets() {
            self.queue.enqueue(&asset, Priority::High).await;
        }
        let snapshot_changed = self.publish_snapshot(snapshot).await;
        *self.last_fingerprint.lock() = Some(fingerprint);

        Ok(CycleOutcome::Updated {
            enqueued,
            snapshot_changed,
        })
    }

    /// Enqueue every reachable asset. The schedule active now gets high priority,
    /// schedules active today normal, the rest low. Returns the number newly queued.
    async fn enqueue_reachable(&self, sync: &SyncResponse) -> usize {
        let now = Local::now().naive_local();
        let active_id = resolve_active(&sync.schedules, now).map(|s| s.id.clone());

        let mut priorities: HashMap<String, Priority> = HashMap::new();
        for schedule in &sync.schedules {
            let Some(playlist) = sync.playlist_for(schedule) else {
                continue;
            };
            let priority = if active_id.as_deref() == Some(schedule.id.as_str()) {
                Priority::High
            } else if schedule.is_active_on(now.date()) {
                Priority::Normal
            } else {
                Priority::Low
            };
            for asset in playlist.assets(&sync.media_assets) {
                let entry = priorities.entry(asset.id).or_insert(priority);
                *entry = (*entry).max(priority);
            }
        }

        let mut queued = 0;
        for (_, asset) in sync.reachable_assets() {
            let priority = priorities.get(&asset.id).copied().unwrap_or_default();
            if self.queue.enqueue(&asset, priority).await == EnqueueOutcome::Queued {
                queued += 1;
            }
        }
        queued
    }

    /// Publish and persist `snapshot` unless it matches the current one.
    async fn publish_snapshot(&self, snapshot: CurrentContentSnapshot) -> bool {
        let unchanged = self.snapshot.borrow().same_content(&snapshot);
        if unchanged {
            return false;
        }

        self.queue
            .cache()
            .set_protected(snapshot.assets().into_iter().map(|a| a.id));
        if let Err(e) = set_json(self.device_state.as_ref(), keys::LAST_SNAPSHOT, &snapshot).await
        {
            warn!(error = %e, "Failed to persist content snapshot");
        }

        let event = SyncEvent::ContentAvailable {
            schedule_id: snapshot.schedule.as_ref().map(|s| s.id.clone()),
            items: snapshot.playlist_items().len(),
        };
        info!(
            schedule_id = ?snapshot.schedule.as_ref().map(|s| &s.id),
            items = snapshot.playlist_items().len(),
            "Publishing new content"
        );
        self.snapshot.send_replace(Arc::new(snapshot));
        self.publish(event);
        true
    }

    async fn handle_unpaired(&self) {
        if self.state() == SyncState::Onboarding {
            debug!("Still unpaired");
            return;
        }

        warn!("Backend reports this terminal as unpaired, clearing credentials and cache");
        self.api.forget_credentials();
        let mut cleared: Vec<&str> = keys::CREDENTIALS.to_vec();
        cleared.push(keys::LAST_SNAPSHOT);
        if let Err(e) = self.device_state.delete_many(&cleared).await {
            warn!(error = %e, "Failed to clear stored credentials");
        }

        let cache = self.queue.cache();
        cache.set_protected(std::iter::empty::<String>());
        match cache.wipe_all().await {
            Ok(removed) => info!(removed, "Cleared media cache"),
            Err(e) => warn!(error = %e, "Failed to clear media cache"),
        }

        *self.last_fingerprint.lock() = None;
        self.snapshot
            .send_replace(Arc::new(CurrentContentSnapshot::empty()));
        self.set_state(SyncState::Onboarding);
        self.publish(SyncEvent::Unpaired);
    }

    fn set_state(&self, state: SyncState) {
        let changed = {
            let mut status = self.status.write();
            let changed = status.state != state;
            status.state = state;
            changed
        };
        if changed {
            self.publish(SyncEvent::StatusChanged { state });
        }
    }

    fn publish(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::cache::CacheStore;
    use crate::config::{CacheConfig, DownloadQueueConfig};
    use crate::database::test_support::setup_test_db;
    use crate::database::{SqlxCacheIndexRepository, SqlxDeviceStateRepository};
    use crate::domain::MediaAsset;
    use crate::downloader::DownloadEvent;
    use crate::transport::test_support::FakeBackend;
    use crate::transport::{MediaBody, MediaSource};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoSource;

    #[async_trait]
    impl MediaSource for NoSource {
        async fn open(&self, _asset: &MediaAsset) -> Result<MediaBody> {
            Err(Error::Timeout("offline".into()))
        }
    }

    struct Fixture {
        api: Arc<FakeBackend>,
        queue: Arc<DownloadQueue>,
        device_state: Arc<SqlxDeviceStateRepository>,
        orchestrator: Arc<SyncOrchestrator>,
        _db_dir: tempfile::TempDir,
        cache_dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let (pool, db_dir) = setup_test_db().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(
            CacheConfig {
                dir: cache_dir.path().to_path_buf(),
                ..CacheConfig::default()
            },
            Arc::new(SqlxCacheIndexRepository::new(pool.clone())),
        )
        .await
        .unwrap();
        let queue = Arc::new(DownloadQueue::new(
            DownloadQueueConfig::default(),
            Arc::new(cache),
            Arc::new(NoSource),
        ));
        let api = Arc::new(FakeBackend::default());
        let device_state = Arc::new(SqlxDeviceStateRepository::new(pool));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            SyncConfig::default(),
            api.clone(),
            queue.clone(),
            device_state.clone(),
        ));
        Fixture {
            api,
            queue,
            device_state,
            orchestrator,
            _db_dir: db_dir,
            cache_dir,
        }
    }

    fn sync_response(changed: bool) -> SyncResponse {
        serde_json::from_value(json!({
            "schedules": [{
                "id": "s1", "startTime": "00:00", "endTime": "23:59:59",
                "priority": 1, "playlistId": "p1"
            }],
            "playlists": [{"id": "p1", "items": [
                {"id": "i1", "displayOrder": 0, "displayDurationSeconds": 5, "mediaAssetId": "m1"},
                {"id": "i2", "displayOrder": 1, "displayDurationSeconds": 5, "mediaAssetId": "m2"}
            ]}],
            "mediaAssets": [
                {"id": "m1", "url": "https://cdn.example.com/1.png", "mimeType": "image/png"},
                {"id": "m2", "url": "https://cdn.example.com/2.mp4", "mimeType": "video/mp4"}
            ],
            "scheduleChanged": changed,
            "mediaChanged": changed
        }))
        .unwrap()
    }

    fn current_content() -> CurrentContentSnapshot {
        sync_response(false).resolve_snapshot(Local::now().naive_local())
    }

    #[tokio::test]
    async fn test_unchanged_cycle_issues_no_new_enqueues() {
        let f = fixture().await;
        f.api.sync.set_steady(sync_response(false));
        f.api.content.set_steady(current_content());

        let first = f.orchestrator.run_cycle().await.unwrap();
        assert_eq!(
            first,
            CycleOutcome::Updated {
                enqueued: 2,
                snapshot_changed: true
            }
        );
        let second = f.orchestrator.run_cycle().await.unwrap();
        assert_eq!(second, CycleOutcome::Unchanged);
        assert_eq!(f.api.content.calls(), 1);
        assert_eq!(f.queue.stats().queued, 2);

        // Both downloads fail, leaving nothing cached or queued.
        let mut downloads = f.queue.subscribe();
        f.queue.start();
        loop {
            if let DownloadEvent::AllCompleted { failed, .. } = downloads.recv().await.unwrap() {
                assert_eq!(failed, 2);
                break;
            }
        }

        let third = f.orchestrator.run_cycle().await.unwrap();
        assert_eq!(third, CycleOutcome::Unchanged);
        assert_eq!(f.queue.stats().queued, 0);
        assert_eq!(f.queue.stats().downloading, 0);
        assert!(downloads.try_recv().is_err());
        f.queue.stop().await;
    }

    #[tokio::test]
    async fn test_change_flags_and_force_run_full_cycle() {
        let f = fixture().await;
        f.api.content.set_steady(current_content());
        f.api.sync.push(Ok(sync_response(false)));
        f.api.sync.push(Ok(sync_response(true)));
        f.api.sync.set_steady(sync_response(false));

        f.orchestrator.run_cycle().await.unwrap();
        assert!(matches!(
            f.orchestrator.run_cycle().await.unwrap(),
            CycleOutcome::Updated {
                enqueued: 0,
                snapshot_changed: false
            }
        ));

        f.orchestrator.force_sync();
        assert!(matches!(
            f.orchestrator.run_cycle().await.unwrap(),
            CycleOutcome::Updated { .. }
        ));
        assert!(matches!(
            f.orchestrator.run_cycle().await.unwrap(),
            CycleOutcome::Unchanged { .. }
        ));
        assert_eq!(f.api.content.calls(), 3);
    }

    #[tokio::test]
    async fn test_current_content_failure_resolves_locally() {
        let f = fixture().await;
        let mut events = f.orchestrator.subscribe();
        f.api.sync.set_steady(sync_response(true));
        f.api.content.push(Err(Error::Timeout("offline".into())));

        f.orchestrator.run_cycle().await.unwrap();
        let snapshot = f.orchestrator.snapshot();
        assert_eq!(snapshot.schedule.as_ref().map(|s| s.id.as_str()), Some("s1"));
        assert_eq!(snapshot.playlist_items().len(), 2);
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::ContentAvailable {
                schedule_id: Some("s1".into()),
                items: 2
            }
        );
    }

    #[tokio::test]
    async fn test_failures_back_off_and_success_resets() {
        let f = fixture().await;
        f.api.sync.push(Err(Error::Timeout("offline".into())));
        f.api.sync.push(Err(Error::Timeout("offline".into())));
        f.api.sync.set_steady(sync_response(false));
        f.api.content.set_steady(current_content());

        assert_eq!(f.orchestrator.sync_once().await, Some(Duration::from_secs(30)));
        assert_eq!(f.orchestrator.state(), SyncState::ErrorBackoff);
        assert_eq!(f.orchestrator.sync_once().await, Some(Duration::from_secs(60)));
        assert_eq!(f.orchestrator.status().consecutive_failures, 2);

        assert_eq!(f.orchestrator.sync_once().await, Some(Duration::from_secs(300)));
        let status = f.orchestrator.status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_unpaired_clears_credentials_and_cache() {
        let f = fixture().await;
        f.device_state.set(keys::DEVICE_TOKEN, "secret").await.unwrap();
        f.device_state.set(keys::SCREEN_ID, "screen-1").await.unwrap();

        let asset = MediaAsset {
            id: "m1".into(),
            name: "one".into(),
            url: "https://cdn.example.com/1.png".into(),
            mime_type: "image/png".into(),
            file_size: None,
            duration: None,
        };
        let staging = f.cache_dir.path().join("m1.part");
        tokio::fs::write(&staging, b"png").await.unwrap();
        f.queue.cache().promote(&asset, &staging, 3).await.unwrap();
        assert_eq!(f.queue.cache().stats().entries, 1);

        let mut events = f.orchestrator.subscribe();
        f.api.sync.set_steady(sync_response(false));
        f.api.content.set_steady(current_content());
        f.orchestrator.run_cycle().await.unwrap();
        f.api.sync.push(Err(Error::Unpaired));

        assert_eq!(f.orchestrator.sync_once().await, None);
        assert_eq!(f.orchestrator.state(), SyncState::Onboarding);
        assert!(f.api.forgot_credentials.load(Ordering::SeqCst));
        assert_eq!(f.device_state.get(keys::DEVICE_TOKEN).await.unwrap(), None);
        assert_eq!(f.device_state.get(keys::LAST_SNAPSHOT).await.unwrap(), None);
        assert_eq!(f.queue.cache().stats().entries, 0);
        assert!(!f.orchestrator.snapshot().has_content());
        assert_eq!(f.orchestrator.status().consecutive_failures, 0);

        let mut saw_unpaired = false;
        while let Ok(event) = events.try_recv() {
            saw_unpaired |= event == SyncEvent::Unpaired;
        }
        assert!(saw_unpaired);
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let f = fixture().await;
        f.api.sync.set_steady(sync_response(false));
        f.api.content.set_steady(current_content());
        f.orchestrator.run_cycle().await.unwrap();

        let rebooted = SyncOrchestrator::new(
            SyncConfig::default(),
            f.api.clone(),
            f.queue.clone(),
            f.device_state.clone(),
        );
        assert!(!rebooted.snapshot().has_content());
        assert!(rebooted.restore_snapshot().await.unwrap());
        assert!(rebooted.snapshot().same_content(&f.orchestrator.snapshot()));
    }

    #[tokio::test]
    async fn test_force_sync_wakes_the_loop() {
        let f = fixture().await;
        f.api.sync.set_steady(sync_response(false));
        f.api.content.set_steady(current_content());

        f.orchestrator.start();
        let wait_for_calls = |n: usize| {
            let api = f.api.clone();
            async move {
                tokio::time::timeout(Duration::from_secs(5), async {
                    while api.sync.calls() < n {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })
                .await
                .unwrap()
            }
        };
        wait_for_calls(1).await;
        f.orchestrator.force_sync();
        wait_for_calls(2).await;
        assert!(!f.orchestrator.is_stalled());

        f.orchestrator.stop().await;
        assert!(!f.orchestrator.is_running());
    }
}
