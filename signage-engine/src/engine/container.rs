//! Engine wiring, startup order and graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::EngineListener;
use super::identity::{load_identity, store_identity};
use crate::cache::{CacheStats, CacheStore};
use crate::config::EngineConfig;
use crate::database::{
    self, DbPool, DeviceStateRepository, SqlxCacheIndexRepository, SqlxDeviceStateRepository,
};
use crate::domain::{CurrentContentSnapshot, MediaAsset, PlaylistItem};
use crate::downloader::{DownloadEvent, DownloadQueue, QueueStats};
use crate::notification::{ChannelStatus, NotificationChannel};
use crate::playback::{
    PlaybackController, PlaybackEvent, PlaybackHandle, PlaybackStatus, Renderer,
};
use crate::supervisor::{
    ComponentSnapshot, CrashJournal, ErrorReport, ErrorSink, ErrorSource, ProcessRestarter,
    RecoveryAction, Supervised, Supervisor, SupervisorEvent, SupervisorHandle, SupervisorStatus,
};
use crate::sync::{SyncEvent, SyncOrchestrator, SyncState, SyncStatus};
use crate::transport::{ApiClient, DeviceIdentity};
use crate::utils::fs::ensure_dir_all;
use crate::{Error, Result};

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval of the cache age/size sweep.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Exit code asking the service manager to start the process again.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Last known state of every component.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub paired: bool,
    pub uptime_secs: u64,
    pub sync: SyncStatus,
    pub notifications: ChannelStatus,
    pub playback: PlaybackStatus,
    pub downloads: QueueStats,
    pub cache: CacheStats,
    pub supervisor: SupervisorStatus,
}

/// The signage engine: every component, wired together.
pub struct SignageEngine {
    inner: Arc<EngineInner>,
}

pub(super) struct EngineInner {
    pub(super) config: EngineConfig,
    pub(super) pool: DbPool,
    pub(super) device_state: Arc<dyn DeviceStateRepository>,
    pub(super) api: Arc<ApiClient>,
    pub(super) cache: Arc<CacheStore>,
    pub(super) queue: Arc<DownloadQueue>,
    pub(super) sync: Arc<SyncOrchestrator>,
    pub(super) notifications: NotificationChannel,
    pub(super) playback: PlaybackHandle,
    pub(super) supervisor: Supervisor,
    pub(super) cancellation_token: CancellationToken,
    restart: watch::Sender<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    started_at: Instant,
}

impl SignageEngine {
    /// Open the database under `config.data_dir` and build every component.
    /// Nothing runs until [`start`](Self::start).
    pub async fn open(config: EngineConfig, renderer: Arc<dyn Renderer>) -> Result<Self> {
        config.validate()?;
        ensure_dir_all(&config.data_dir).await?;

        let pool = database::init_pool(&database::database_url(&config.database_path())).await?;
        database::run_migrations(&pool).await?;
        Self::with_pool(config, pool, renderer).await
    }

    /// Build the engine on an already migrated pool.
    pub async fn with_pool(
        config: EngineConfig,
        pool: DbPool,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self> {
        let device_state: Arc<dyn DeviceStateRepository> =
            Arc::new(SqlxDeviceStateRepository::new(pool.clone()));
        let identity = load_identity(&config, device_state.as_ref()).await?;
        info!(
            paired = identity.is_paired(),
            api = %identity.api_base_url,
            "Device identity loaded"
        );

        let api = Arc::new(ApiClient::new(
            identity,
            config.connect_timeout,
            config.request_timeout,
        )?);

        let journal = Arc::new(CrashJournal::new(
            config.crash_journal_path(),
            config.supervisor.crash_journal_capacity,
        ));
        let supervisor = Supervisor::new(
            config.supervisor.clone(),
            api.clone(),
            device_state.clone(),
            journal,
        );
        let errors: Arc<dyn ErrorSink> = Arc::new(supervisor.handle());

        let cache = Arc::new(
            CacheStore::open(
                config.cache.clone(),
                Arc::new(SqlxCacheIndexRepository::new(pool.clone())),
            )
            .await?,
        );
        let queue = Arc::new(
            DownloadQueue::new(config.download.clone(), cache.clone(), api.clone())
                .with_error_sink(errors.clone()),
        );
        let sync = Arc::new(
            SyncOrchestrator::new(
                config.sync.clone(),
                api.clone(),
                queue.clone(),
                device_state.clone(),
            )
            .with_error_sink(errors.clone()),
        );
        let notifications =
            NotificationChannel::new(config.notification.clone(), api.clone(), api.clone());

        let cancellation_token = CancellationToken::new();
        let (playback, playback_task) = PlaybackController::spawn(
            config.playback.clone(),
            renderer,
            cache.clone(),
            Some(errors),
            cancellation_token.child_token(),
        );

        let (restart, _) = watch::channel(None);
        let inner = Arc::new(EngineInner {
            config,
            pool,
            device_state,
            api,
            cache,
            queue,
            sync,
            notifications,
            playback,
            supervisor,
            cancellation_token,
            restart,
            tasks: Mutex::new(vec![playback_task]),
            started: AtomicBool::new(false),
            started_at: Instant::now(),
        });
        inner
            .notifications
            .add_listener("engine", Arc::new(EngineListener::new(Arc::downgrade(&inner))));

        Ok(Self { inner })
    }

    /// Start every loop. Startup order: snapshot restore, downloads, sync,
    /// notifications, then supervision.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Other("engine already started".to_string()));
        }
        info!("Starting signage engine");

        inner.spawn_snapshot_forwarder();
        match inner.sync.restore_snapshot().await {
            Ok(true) => info!("Restored last content snapshot"),
            Ok(false) => debug!("No stored content snapshot"),
            Err(e) => warn!(error = %e, "Failed to restore content snapshot"),
        }

        inner.queue.start();
        inner.sync.start();
        inner.notifications.start();
        inner.spawn_unpair_watcher();
        inner.spawn_cache_sweep();

        let target: Arc<dyn Supervised> = inner.clone();
        let restarter: Arc<dyn ProcessRestarter> = inner.clone();
        inner.supervisor.start(target, restarter)?;

        info!(
            mode = %inner.config.notification.mode,
            workers = inner.config.download.workers,
            "Signage engine started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop everything: pending restarts are cancelled, downloads halt without touching
    /// promoted files and playback flushes to `Stopped`.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        info!("Shutting down signage engine (timeout: {:?})", timeout);

        let shutdown = tokio::time::timeout(timeout, async {
            inner.supervisor.stop().await;
            if let Err(e) = inner.playback.stop_playback().await {
                debug!(error = %e, "Playback already stopped");
            }
            inner.cancellation_token.cancel();
            inner.notifications.stop().await;
            inner.sync.stop().await;
            inner.queue.stop().await;

            let tasks = std::mem::take(&mut *inner.tasks.lock());
            for task in tasks {
                if let Err(e) = task.await
                    && e.is_panic()
                {
                    warn!(error = %e, "Background task panicked");
                }
            }
        })
        .await;

        if shutdown.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
            inner.cancellation_token.cancel();
        }

        info!("Closing database pool...");
        inner.pool.close().await;
        info!("Signage engine shut down");
        Ok(())
    }

    /// Resolves with the reason once a full restart was requested.
    pub async fn restart_requested(&self) -> String {
        let mut rx = self.inner.restart.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.status()
    }

    pub fn playback(&self) -> &PlaybackHandle {
        &self.inner.playback
    }

    pub fn start_playlist(&self, items: Vec<PlaylistItem>) -> Result<()> {
        self.inner.playback.start_playlist(items)
    }

    pub fn update_playlist(&self, snapshot: &CurrentContentSnapshot) -> Result<()> {
        self.inner.playback.update_playlist(snapshot)
    }

    pub async fn stop_playback(&self) -> Result<()> {
        self.inner.playback.stop_playback().await
    }

    pub async fn cached_path(&self, asset: &MediaAsset) -> Option<PathBuf> {
        self.inner.cache.cached_path(asset).await
    }

    pub fn current_snapshot(&self) -> Arc<CurrentContentSnapshot> {
        self.inner.sync.snapshot()
    }

    pub fn force_sync(&self) {
        self.inner.sync.force_sync();
    }

    /// Wipe the media cache and sync again.
    pub async fn clear_cache(&self) -> Result<()> {
        self.inner.clear_cache().await
    }

    /// Adopt credentials from pairing and sync right away.
    pub async fn pair(&self, identity: DeviceIdentity) -> Result<()> {
        if !identity.is_paired() {
            return Err(Error::validation("pairing requires a device token and screen id"));
        }
        store_identity(self.inner.device_state.as_ref(), &identity).await?;
        self.inner.api.set_identity(identity);
        info!("Device paired, syncing");
        if self.inner.started.load(Ordering::SeqCst) {
            self.inner.notifications.restart().await;
        }
        self.inner.sync.force_sync();
        Ok(())
    }

    pub fn subscribe_playback(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.inner.playback.subscribe()
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.sync.subscribe()
    }

    pub fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.queue.subscribe()
    }

    pub fn subscribe_supervisor(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.supervisor.subscribe()
    }

    /// Reporting handle for collaborators (renderers, the panic hook).
    pub fn supervisor_handle(&self) -> SupervisorHandle {
        self.inner.supervisor.handle()
    }

    pub fn crash_journal(&self) -> &Arc<CrashJournal> {
        self.inner.supervisor.journal()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation_token.clone()
    }
}

impl EngineInner {
    pub(super) async fn clear_cache(&self) -> Result<()> {
        let removed = self.cache.wipe_all().await?;
        info!(removed, "Media cache cleared");
        self.sync.force_sync();
        Ok(())
    }

    pub(super) fn request_restart(&self, reason: &str) {
        info!(reason, "Full restart requested");
        self.restart.send_replace(Some(reason.to_string()));
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            paired: self.api.identity().is_paired(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            sync: self.sync.status(),
            notifications: self.notifications.status(),
            playback: self.playback.status(),
            downloads: self.queue.stats(),
            cache: self.cache.stats(),
            supervisor: self.supervisor.status(),
        }
    }

    /// Feed every published snapshot to playback.
    fn spawn_snapshot_forwarder(&self) {
        let mut snapshots = self.sync.watch_snapshot();
        let playback = self.playback.clone();
        let cancel = self.cancellation_token.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        if let Err(e) = playback.update_playlist(&snapshot) {
                            debug!(error = %e, "Snapshot not forwarded");
                            break;
                        }
                    }
                }
            }
            debug!("Snapshot forwarder stopped");
        });
        self.tasks.lock().push(task);
    }

    /// Take notifications and downloads down with sync when the screen is unpaired.
    fn spawn_unpair_watcher(self: &Arc<Self>) {
        let mut events = self.sync.subscribe();
        let inner = Arc::downgrade(self);
        let cancel = self.cancellation_token.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                match event {
                    Ok(SyncEvent::Unpaired) => inner.enter_onboarding().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Sync events lagged");
                        if inner.sync.state() == SyncState::Onboarding
                            && inner.notifications.is_running()
                        {
                            inner.enter_onboarding().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Unpair watcher stopped");
        });
        self.tasks.lock().push(task);
    }

    async fn enter_onboarding(&self) {
        warn!("Screen unpaired, pausing notifications and downloads until paired again");
        self.notifications.stop().await;
        // Drop work queued for the wiped cache; workers come back idle.
        self.queue.stop().await;
        self.queue.start();
    }

    fn spawn_cache_sweep(&self) {
        let cache = self.cache.clone();
        let max_age = self.config.cache.max_age;
        let errors = self.supervisor.handle();
        let cancel = self.cancellation_token.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = sweep_cache(&cache, max_age).await {
                            warn!(error = %e, "Cache sweep failed");
                            errors.report(ErrorReport::new(ErrorSource::Cache, &e));
                        }
                    }
                }
            }
            debug!("Cache sweep stopped");
        });
        self.tasks.lock().push(task);
    }
}

async fn sweep_cache(cache: &CacheStore, max_age: Duration) -> Result<usize> {
    let expired = cache.evict_older_than(max_age).await?;
    let oversize = cache.enforce_size_limit().await?;
    Ok(expired + oversize)
}

#[async_trait]
impl Supervised for EngineInner {
    async fn recover(&self, action: RecoveryAction) -> Result<()> {
        match action {
            RecoveryAction::RestartSync => self.sync.restart().await,
            RecoveryAction::RestartNotifications => self.notifications.restart().await,
            RecoveryAction::ReclaimMemory => {
                let removed = sweep_cache(&self.cache, self.config.cache.max_age).await?;
                debug!(removed, "Cache trimmed for memory recovery");
                if let Err(e) = self.playback.reload() {
                    debug!(error = %e, "Playback not reloaded");
                }
            }
        }
        Ok(())
    }

    fn sync_stalled(&self) -> bool {
        self.sync.is_stalled()
    }

    fn snapshot(&self) -> ComponentSnapshot {
        let cache = self.cache.stats();
        let downloads = self.queue.stats();
        ComponentSnapshot {
            playback_state: self.playback.status().state.to_string(),
            sync_state: self.sync.state().to_string(),
            notification_state: self.notifications.status().state.to_string(),
            cache_entries: cache.entries,
            cache_bytes: cache.total_bytes,
            download_queue_depth: downloads.queued + downloads.downloading,
        }
    }
}

#[async_trait]
impl ProcessRestarter for EngineInner {
    async fn restart(&self, reason: &str) {
        self.request_restart(reason);
    }
}
