//! Priority download queue with a fixed worker pool.
//!
//! Pending and active tasks live under one mutex, so a media id can be claimed by at
//! most one worker. Downloads stream into a staging file that is promoted into the
//! cache only after the body completed and passed validation.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::DownloadEvent;
use super::task::{DownloadStatus, DownloadTask};
use crate::cache::CacheStore;
use crate::config::DownloadQueueConfig;
use crate::domain::{MediaAsset, Priority};
use crate::supervisor::{ErrorReport, ErrorSink, ErrorSource};
use crate::transport::MediaSource;
use crate::utils::fs::{ensure_parent_dir, remove_file_if_exists};
use crate::{Error, Result};

/// Fallback wake-up for idle workers in case a notification was missed.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of [`DownloadQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new task was queued.
    Queued,
    /// A task for this media id is already queued or downloading.
    AlreadyActive,
    /// The cached copy is valid.
    AlreadyCached,
    /// Remote embeds and unsupported media are never downloaded.
    NotDownloadable,
}

/// Queue depth for the status surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub downloading: usize,
}

struct PendingEntry {
    priority: Priority,
    seq: u64,
    media_id: String,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    // Max-heap: higher priority first, then lower sequence number (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    /// May hold stale entries (superseded priority, removed task); `tasks` is the truth.
    pending: BinaryHeap<PendingEntry>,
    /// Queued and downloading tasks.
    tasks: HashMap<String, DownloadTask>,
    next_seq: u64,
    batch_completed: usize,
    batch_failed: usize,
}

pub struct DownloadQueue {
    config: DownloadQueueConfig,
    cache: Arc<CacheStore>,
    source: Arc<dyn MediaSource>,
    errors: Option<Arc<dyn ErrorSink>>,
    state: Mutex<QueueState>,
    notify: Notify,
    events: broadcast::Sender<DownloadEvent>,
    cancel: Mutex<CancellationToken>,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl DownloadQueue {
    pub fn new(
        config: DownloadQueueConfig,
        cache: Arc<CacheStore>,
        source: Arc<dyn MediaSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            cache,
            source,
            errors: None,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            events,
            cancel: Mutex::new(CancellationToken::new()),
            workers: Mutex::new(None),
        }
    }

    /// Report download and cache failures to `sink`.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.errors = Some(sink);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Queue `asset` unless it is cached, already active or not downloadable.
    ///
    /// Re-enqueueing a queued asset with a higher priority moves it up.
    pub async fn enqueue(&self, asset: &MediaAsset, priority: Priority) -> EnqueueOutcome {
        if !asset.needs_download() {
            return EnqueueOutcome::NotDownloadable;
        }
        if self.is_active(&asset.id) {
            return self.bump_priority(&asset.id, priority);
        }
        if self.cache.is_cache_valid(asset).await {
            return EnqueueOutcome::AlreadyCached;
        }

        {
            let mut state = self.state.lock();
            if state.tasks.contains_key(&asset.id) {
                drop(state);
                return self.bump_priority(&asset.id, priority);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.tasks.insert(
                asset.id.clone(),
                DownloadTask::new(asset.clone(), priority, seq),
            );
            state.pending.push(PendingEntry {
                priority,
                seq,
                media_id: asset.id.clone(),
            });
        }

        debug!(media_id = %asset.id, %priority, "Queued download");
        self.notify.notify_one();
        EnqueueOutcome::Queued
    }

    fn bump_priority(&self, media_id: &str, priority: Priority) -> EnqueueOutcome {
        let mut state = self.state.lock();
        let bumped = match state.tasks.get_mut(media_id) {
            Some(task) if task.status == DownloadStatus::Queued && priority > task.priority => {
                task.priority = priority;
                Some(task.seq)
            }
            _ => None,
        };
        if let Some(seq) = bumped {
            state.pending.push(PendingEntry {
                priority,
                seq,
                media_id: media_id.to_string(),
            });
        }
        EnqueueOutcome::AlreadyActive
    }

    pub fn is_active(&self, media_id: &str) -> bool {
        self.state.lock().tasks.contains_key(media_id)
    }

    pub fn task(&self, media_id: &str) -> Option<DownloadTask> {
        self.state.lock().tasks.get(media_id).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let downloading = state
            .tasks
            .values()
            .filter(|t| t.status == DownloadStatus::Downloading)
            .count();
        QueueStats {
            queued: state.tasks.len() - downloading,
            downloading,
        }
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Spawn the worker pool. A no-op while already running.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        info!("Starting download queue with {} workers", self.config.workers);
        let mut join_set = JoinSet::new();
        for worker in 0..self.config.workers {
            join_set.spawn(Arc::clone(self).worker_loop(worker, token.clone()));
        }
        *workers = Some(join_set);
    }

    /// Cancel all workers and queued tasks.
    ///
    /// In-flight downloads are abandoned and their staging files removed; promoted files
    /// are never touched.
    pub async fn stop(&self) {
        info!("Stopping download queue");
        self.cancel.lock().cancel();

        let join_set = self.workers.lock().take();
        if let Some(mut join_set) = join_set {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result
                    && e.is_panic()
                {
                    error!("Download worker panicked: {}", e);
                }
            }
        }

        let cancelled: Vec<String> = {
            let mut state = self.state.lock();
            state.pending.clear();
            let ids: Vec<String> = state.tasks.keys().cloned().collect();
            for id in &ids {
                if let Some(mut task) = state.tasks.remove(id)
                    && let Err(e) = task.transition_to(DownloadStatus::Cancelled)
                {
                    warn!(media_id = %id, error = %e, "Unexpected task state at shutdown");
                }
            }
            state.batch_completed = 0;
            state.batch_failed = 0;
            ids
        };
        for media_id in cancelled {
            self.publish(DownloadEvent::Cancelled { media_id });
        }
        info!("Download queue stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!("Download worker {} started", worker);
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let Some(task) = self.claim_next() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                }
                continue;
            };

            self.run_task(task, &cancel).await;
        }
        debug!("Download worker {} shutting down", worker);
    }

    /// Pop the best queued task and mark it downloading.
    fn claim_next(&self) -> Option<DownloadTask> {
        let mut state = self.state.lock();
        while let Some(entry) = state.pending.pop() {
            let Some(task) = state.tasks.get_mut(&entry.media_id) else {
                continue;
            };
            if task.seq != entry.seq || task.priority != entry.priority {
                continue;
            }
            if task.transition_to(DownloadStatus::Downloading).is_err() {
                continue;
            }
            return Some(task.clone());
        }
        None
    }

    async fn run_task(&self, task: DownloadTask, cancel: &CancellationToken) {
        let media_id = task.media_id.clone();
        let asset = task.asset;
        let staging = self.cache.staging_path(&asset);

        info!(media_id = %media_id, priority = %task.priority, "Downloading {}", asset.name);
        self.publish(DownloadEvent::Started {
            media_id: media_id.clone(),
            total_bytes: task.total_bytes,
        });

        let fetched = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.fetch_to_staging(&asset, &staging) => result,
        };
        let result = match fetched {
            Ok(bytes) => match self.cache.validate_download(&asset, bytes) {
                Ok(()) => self
                    .cache
                    .promote(&asset, &staging, bytes)
                    .await
                    .map(|path| (path, bytes)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let (status, event) = match result {
            Ok((path, bytes)) => {
                info!(media_id = %media_id, bytes, "Download completed");
                (
                    DownloadStatus::Completed,
                    DownloadEvent::Completed {
                        media_id: media_id.clone(),
                        path,
                        bytes,
                    },
                )
            }
            Err(Error::Cancelled) => {
                discard_staging(&staging).await;
                debug!(media_id = %media_id, "Download cancelled");
                (
                    DownloadStatus::Cancelled,
                    DownloadEvent::Cancelled {
                        media_id: media_id.clone(),
                    },
                )
            }
            Err(e) => {
                discard_staging(&staging).await;
                warn!(media_id = %media_id, error = %e, "Download failed");
                self.report(ErrorReport::new(ErrorSource::Download, &e).with_media(media_id.as_str()));
                (
                    DownloadStatus::Failed,
                    DownloadEvent::Failed {
                        media_id: media_id.clone(),
                        error: e.to_string(),
                        network: e.is_network(),
                    },
                )
            }
        };

        self.publish(event);
        if let Some(drained) = self.finish(&media_id, status) {
            if let DownloadEvent::AllCompleted { completed, .. } = drained
                && completed > 0
                && let Err(e) = self.cache.enforce_size_limit().await
            {
                warn!(error = %e, "Cache size enforcement failed");
                self.report(ErrorReport::new(ErrorSource::Cache, &e));
            }
            self.publish(drained);
        }
    }

    fn report(&self, report: ErrorReport) {
        if let Some(errors) = &self.errors {
            errors.report(report);
        }
    }

    async fn fetch_to_staging(&self, asset: &MediaAsset, staging: &Path) -> Result<u64> {
        ensure_parent_dir(staging).await?;
        let body = self.source.open(asset).await?;
        let total = body.content_length.or(asset.file_size);
        self.update_task(&asset.id, |t| t.total_bytes = total);

        let mut file = tokio::fs::File::create(staging)
            .await
            .map_err(|e| Error::io_path("creating staging file", staging, e))?;
        let mut chunks = body.chunks;
        let mut written: u64 = 0;
        let mut last_progress = Instant::now();

        loop {
            let next = tokio::time::timeout(self.config.chunk_timeout, chunks.next())
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "no data for {:?} while downloading {}",
                        self.config.chunk_timeout, asset.id
                    ))
                })?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io_path("writing staging file", staging, e))?;
            written += chunk.len() as u64;

            if last_progress.elapsed() >= self.config.progress_interval {
                last_progress = Instant::now();
                self.update_task(&asset.id, |t| t.bytes_downloaded = written);
                self.publish(DownloadEvent::Progress {
                    media_id: asset.id.clone(),
                    bytes_downloaded: written,
                    total_bytes: total,
                });
            }
        }

        file.flush()
            .await
            .map_err(|e| Error::io_path("flushing staging file", staging, e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io_path("syncing staging file", staging, e))?;
        self.update_task(&asset.id, |t| t.bytes_downloaded = written);
        Ok(written)
    }

    fn update_task(&self, media_id: &str, f: impl FnOnce(&mut DownloadTask)) {
        if let Some(task) = self.state.lock().tasks.get_mut(media_id) {
            f(task);
        }
    }

    /// Move a task to its terminal state and drop it from the active set. Returns the
    /// drain event when this was the last task.
    fn finish(&self, media_id: &str, status: DownloadStatus) -> Option<DownloadEvent> {
        let mut state = self.state.lock();
        if let Some(mut task) = state.tasks.remove(media_id)
            && let Err(e) = task.transition_to(status)
        {
            warn!(media_id, error = %e, "Unexpected task transition");
        }
        match status {
            DownloadStatus::Completed => state.batch_completed += 1,
            DownloadStatus::Failed => state.batch_failed += 1,
            _ => {}
        }

        if !state.tasks.is_empty() {
            return None;
        }
        state.pending.clear();
        let drained = DownloadEvent::AllCompleted {
            completed: state.batch_completed,
            failed: state.batch_failed,
        };
        state.batch_completed = 0;
        state.batch_failed = 0;
        Some(drained)
    }

    fn publish(&self, event: DownloadEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn discard_staging(staging: &Path) {
    if let Err(e) = remove_file_if_exists(staging).await {
        warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::database::SqlxCacheIndexRepository;
    use crate::database::test_support::setup_test_db;
    use crate::transport::MediaBody;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[derive(Default)]
    struct FakeSource {
        files: HashMap<String, Vec<u8>>,
        failing: HashSet<String>,
        /// Media ids whose body sends one chunk and then hangs.
        hanging: HashSet<String>,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl MediaSource for FakeSource {
        async fn open(&self, asset: &MediaAsset) -> Result<MediaBody> {
            self.opened.fetch_add(1, AtomicOrdering::SeqCst);
            if self.failing.contains(&asset.id) {
                return Err(Error::HttpStatus {
                    status: 500,
                    url: asset.url.clone(),
                });
            }
            if self.hanging.contains(&asset.id) {
                let chunks = futures::stream::once(async { Ok(Bytes::from_static(b"part")) })
                    .chain(futures::stream::pending())
                    .boxed();
                return Ok(MediaBody {
                    content_length: None,
                    chunks,
                });
            }
            let data = self.files.get(&asset.id).cloned().unwrap_or_default();
            let chunks = futures::stream::iter(
                data.chunks(3)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect::<Vec<_>>(),
            )
            .boxed();
            Ok(MediaBody {
                content_length: Some(data.len() as u64),
                chunks,
            })
        }
    }

    fn asset(id: &str) -> MediaAsset {
        MediaAsset {
            id: id.into(),
            name: id.into(),
            url: format!("https://cdn.example.com/{id}.png"),
            mime_type: "image/png".into(),
            file_size: None,
            duration: None,
        }
    }

    struct Fixture {
        queue: Arc<DownloadQueue>,
        source: Arc<FakeSource>,
        _db_dir: tempfile::TempDir,
        _cache_dir: tempfile::TempDir,
    }

    async fn fixture(source: FakeSource, config: DownloadQueueConfig) -> Fixture {
        let (pool, db_dir) = setup_test_db().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let cache_config = CacheConfig {
            dir: cache_dir.path().to_path_buf(),
            ..CacheConfig::default()
        };
        let cache = CacheStore::open(cache_config, Arc::new(SqlxCacheIndexRepository::new(pool)))
            .await
            .unwrap();
        let source = Arc::new(source);
        let queue = Arc::new(DownloadQueue::new(
            config,
            Arc::new(cache),
            source.clone(),
        ));
        Fixture {
            queue,
            source,
            _db_dir: db_dir,
            _cache_dir: cache_dir,
        }
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<DownloadEvent>,
        pred: impl Fn(&DownloadEvent) -> bool,
    ) -> DownloadEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_twice_yields_one_task() {
        let f = fixture(FakeSource::default(), DownloadQueueConfig::default()).await;
        let a = asset("a");

        assert_eq!(f.queue.enqueue(&a, Priority::Normal).await, EnqueueOutcome::Queued);
        assert_eq!(f.queue.enqueue(&a, Priority::Normal).await, EnqueueOutcome::AlreadyActive);
        assert_eq!(f.queue.stats().queued, 1);

        let mut embed = asset("yt");
        embed.url = "https://youtu.be/abc".into();
        embed.mime_type = "video/mp4".into();
        assert_eq!(
            f.queue.enqueue(&embed, Priority::High).await,
            EnqueueOutcome::NotDownloadable
        );
    }

    #[tokio::test]
    async fn test_claim_order_priority_then_fifo() {
        let f = fixture(FakeSource::default(), DownloadQueueConfig::default()).await;
        f.queue.enqueue(&asset("low"), Priority::Low).await;
        f.queue.enqueue(&asset("n1"), Priority::Normal).await;
        f.queue.enqueue(&asset("h1"), Priority::High).await;
        f.queue.enqueue(&asset("n2"), Priority::Normal).await;
        f.queue.enqueue(&asset("h2"), Priority::High).await;
        // Upgrading a queued task moves it ahead of its old peers.
        f.queue.enqueue(&asset("low"), Priority::High).await;

        let order: Vec<String> = std::iter::from_fn(|| f.queue.claim_next())
            .map(|t| t.media_id)
            .collect();
        assert_eq!(order, vec!["h1", "h2", "low", "n1", "n2"]);
        assert!(f.queue.claim_next().is_none());
        assert_eq!(f.queue.stats().downloading, 5);
    }

    #[tokio::test]
    async fn test_download_round_trip_then_wipe() {
        let mut source = FakeSource::default();
        source.files.insert("a".into(), b"0123456789".to_vec());
        let f = fixture(source, DownloadQueueConfig::default()).await;
        let mut rx = f.queue.subscribe();
        f.queue.start();

        let a = asset("a");
        assert_eq!(f.queue.enqueue(&a, Priority::High).await, EnqueueOutcome::Queued);
        let drained = wait_for(&mut rx, |e| matches!(e, DownloadEvent::AllCompleted { .. })).await;
        assert_eq!(
            drained,
            DownloadEvent::AllCompleted {
                completed: 1,
                failed: 0
            }
        );

        let path = f.queue.cache().cached_path(&a).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"0123456789");
        assert!(!f.queue.is_active("a"));
        assert_eq!(f.queue.enqueue(&a, Priority::High).await, EnqueueOutcome::AlreadyCached);

        f.queue.cache().wipe_all().await.unwrap();
        assert_eq!(f.queue.cache().cached_path(&a).await, None);
        f.queue.stop().await;
    }

    #[tokio::test]
    async fn test_failure_marks_failed_and_allows_retry() {
        let mut source = FakeSource::default();
        source.failing.insert("bad".into());
        source.files.insert("empty".into(), Vec::new());
        let f = fixture(source, DownloadQueueConfig::default()).await;
        let mut rx = f.queue.subscribe();
        f.queue.start();

        f.queue.enqueue(&asset("bad"), Priority::Normal).await;
        f.queue.enqueue(&asset("empty"), Priority::Normal).await;
        let drained = wait_for(&mut rx, |e| matches!(e, DownloadEvent::AllCompleted { .. })).await;
        assert_eq!(
            drained,
            DownloadEvent::AllCompleted {
                completed: 0,
                failed: 2
            }
        );

        let bad = asset("bad");
        assert!(!f.queue.cache().is_cache_valid(&bad).await);
        assert!(!f.queue.cache().staging_path(&bad).exists());
        // No self-retry, but the next diff may enqueue again.
        assert_eq!(f.queue.enqueue(&bad, Priority::Normal).await, EnqueueOutcome::Queued);
        f.queue.stop().await;
        assert!(f.source.opened.load(AtomicOrdering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let mut source = FakeSource::default();
        source.hanging.insert("slow".into());
        let config = DownloadQueueConfig {
            chunk_timeout: Duration::from_millis(200),
            ..DownloadQueueConfig::default()
        };
        let f = fixture(source, config).await;
        let mut rx = f.queue.subscribe();
        f.queue.start();

        f.queue.enqueue(&asset("slow"), Priority::Normal).await;
        let failed = wait_for(&mut rx, |e| matches!(e, DownloadEvent::Failed { .. })).await;
        let DownloadEvent::Failed { network, .. } = failed else {
            unreachable!()
        };
        assert!(network);
        f.queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_and_removes_staging() {
        let mut source = FakeSource::default();
        source.hanging.insert("slow".into());
        let config = DownloadQueueConfig {
            chunk_timeout: Duration::from_secs(3600),
            progress_interval: Duration::ZERO,
            ..DownloadQueueConfig::default()
        };
        let f = fixture(source, config).await;
        let mut rx = f.queue.subscribe();
        f.queue.start();

        let slow = asset("slow");
        f.queue.enqueue(&slow, Priority::Normal).await;
        wait_for(&mut rx, |e| matches!(e, DownloadEvent::Progress { .. })).await;
        let staging = f.queue.cache().staging_path(&slow);
        assert!(staging.exists());

        f.queue.stop().await;
        wait_for(&mut rx, |e| matches!(e, DownloadEvent::Cancelled { .. })).await;
        assert!(!staging.exists());
        assert!(!f.queue.cache().final_path(&slow).exists());
        assert!(!f.queue.is_running());
        assert_eq!(f.queue.stats(), QueueStats::default());
    }
}
