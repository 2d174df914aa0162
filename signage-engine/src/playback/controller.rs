//! Playback controller actor.
//!
//! The actor owns the playlist and the current position. Commands arrive through a
//! [`PlaybackHandle`]; renderer reports and timers are tagged with the generation of
//! the render attempt they belong to, so anything from a superseded attempt is ignored.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::PlaybackEvent;
use super::renderer::{
    LocalMedia, RenderReporter, RenderRequest, RenderSource, RenderStrategy, Renderer,
    playable_items, same_playlist,
};
use crate::config::PlaybackConfig;
use crate::domain::{CurrentContentSnapshot, PlaylistItem};
use crate::panic_hook;
use crate::supervisor::{ErrorReport, ErrorSink, ErrorSource};
use crate::{Error, Result};

/// Pause after a full pass in which no item could be shown.
const IDLE_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub(super) enum Command {
    StartPlaylist(Vec<PlaylistItem>),
    UpdatePlaylist(Vec<PlaylistItem>),
    /// Replay the current playlist from the first item.
    Restart,
    /// Release the renderer, then replay from the first item.
    Reload,
    Stop(oneshot::Sender<()>),
    RenderCompleted { generation: u64 },
    RenderFailed { generation: u64, error: Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Stopped,
    Playing,
    /// Between two items.
    Transitioning,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Playing => "playing",
            Self::Transitioning => "transitioning",
        }
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub index: Option<usize>,
    pub item_id: Option<String>,
    pub media_id: Option<String>,
    pub items: usize,
    /// A changed playlist waits for the current item to finish.
    pub pending_update: bool,
    pub generation: u64,
}

impl PlaybackStatus {
    fn stopped() -> Self {
        Self {
            state: PlaybackState::Stopped,
            index: None,
            item_id: None,
            media_id: None,
            items: 0,
            pending_update: false,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Next {
    Advance,
    Retry(u32),
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Stopped,
    Playing(RenderStrategy),
    Transition(Next),
}

/// Cloneable handle to the playback actor.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<PlaybackEvent>,
    status: watch::Receiver<PlaybackStatus>,
}

impl PlaybackHandle {
    /// Play `items` from the first one, replacing whatever is playing.
    pub fn start_playlist(&self, items: Vec<PlaylistItem>) -> Result<()> {
        self.send(Command::StartPlaylist(items))
    }

    /// Replace the playlist. Identical content is a no-op; changed content takes effect
    /// from the first item once the current item finishes.
    pub fn update_items(&self, items: Vec<PlaylistItem>) -> Result<()> {
        self.send(Command::UpdatePlaylist(items))
    }

    pub fn update_playlist(&self, snapshot: &CurrentContentSnapshot) -> Result<()> {
        self.update_items(snapshot.playlist_items())
    }

    pub fn restart(&self) -> Result<()> {
        self.send(Command::Restart)
    }

    /// Drop everything the renderer holds and start the playlist over.
    pub fn reload(&self) -> Result<()> {
        self.send(Command::Reload)
    }

    /// Flush to `Stopped` and release the renderer.
    pub async fn stop_playback(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Stop(done))?;
        wait.await.map_err(|_| not_running())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| not_running())
    }
}

fn not_running() -> Error {
    Error::Other("playback controller is not running".to_string())
}

pub struct PlaybackController {
    config: PlaybackConfig,
    renderer: Arc<dyn Renderer>,
    media: Arc<dyn LocalMedia>,
    errors: Option<Arc<dyn ErrorSink>>,
    mailbox: mpsc::UnboundedReceiver<Command>,
    /// Cloned into render reporters.
    reporter_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<PlaybackEvent>,
    status: watch::Sender<PlaybackStatus>,
    cancellation_token: CancellationToken,
    items: Vec<PlaylistItem>,
    pending: Option<Vec<PlaylistItem>>,
    index: usize,
    phase: Phase,
    generation: u64,
    deadline: Option<Instant>,
    consecutive_failures: usize,
}

impl PlaybackController {
    /// Spawn the actor. It runs until `cancellation_token` fires, then releases the
    /// renderer.
    pub fn spawn(
        config: PlaybackConfig,
        renderer: Arc<dyn Renderer>,
        media: Arc<dyn LocalMedia>,
        errors: Option<Arc<dyn ErrorSink>>,
        cancellation_token: CancellationToken,
    ) -> (PlaybackHandle, JoinHandle<()>) {
        let (tx, mailbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (status, status_rx) = watch::channel(PlaybackStatus::stopped());

        let handle = PlaybackHandle {
            tx: tx.clone(),
            events: events.clone(),
            status: status_rx,
        };
        let actor = Self {
            config,
            renderer,
            media,
            errors,
            mailbox,
            reporter_tx: tx,
            events,
            status,
            cancellation_token,
            items: Vec::new(),
            pending: None,
            index: 0,
            phase: Phase::Stopped,
            generation: 0,
            deadline: None,
            consecutive_failures: 0,
        };
        (handle, tokio::spawn(actor.run()))
    }

    async fn run(mut self) {
        debug!("Playback controller started");
        loop {
            let timer = Self::timer(self.deadline);
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => break,

                Some(command) = self.mailbox.recv() => {
                    if panic_hook::contain(self.handle(command)).await.is_err() {
                        self.recover_from_panic().await;
                    }
                }

                _ = timer => {
                    self.deadline = None;
                    if panic_hook::contain(self.on_timer()).await.is_err() {
                        self.recover_from_panic().await;
                    }
                }
            }
        }
        self.halt().await;
        debug!("Playback controller stopped");
    }

    async fn timer(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::StartPlaylist(items) => {
                self.pending = None;
                self.begin(playable_items(items)).await;
            }
            Command::UpdatePlaylist(items) => self.replace(playable_items(items)).await,
            Command::Restart => {
                if matches!(self.phase, Phase::Stopped) && self.items.is_empty() {
                    debug!("Nothing to restart");
                    return;
                }
                info!("Restarting playlist from the first item");
                let items = self.pending.take().unwrap_or_else(|| self.items.clone());
                self.begin(items).await;
            }
            Command::Reload => {
                let items = self.pending.take().unwrap_or_else(|| self.items.clone());
                info!(items = items.len(), "Releasing renderer for reload");
                self.halt().await;
                if !items.is_empty() {
                    self.begin(items).await;
                }
            }
            Command::Stop(done) => {
                self.halt().await;
                let _ = done.send(());
            }
            Command::RenderCompleted { generation } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Ignoring stale completion");
                    return;
                }
                match self.phase {
                    Phase::Playing(strategy) if strategy.advances_on_completion() => {
                        self.finish_item();
                    }
                    _ => debug!("Ignoring completion for a timed item"),
                }
            }
            Command::RenderFailed { generation, error } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Ignoring stale render error");
                    return;
                }
                if let Phase::Playing(strategy) = self.phase {
                    self.fail_item(strategy, error);
                }
            }
        }
    }

    async fn replace(&mut self, items: Vec<PlaylistItem>) {
        if let Some(pending) = &self.pending
            && same_playlist(pending, &items)
        {
            return;
        }
        if same_playlist(&self.items, &items) {
            if self.pending.take().is_some() {
                debug!("Playlist update reverted before taking effect");
                self.publish_status();
            } else {
                debug!("Playlist unchanged");
            }
            return;
        }

        match self.phase {
            Phase::Stopped => self.begin(items).await,
            _ => {
                info!(items = items.len(), "Playlist changed, switching after the current item");
                self.pending = Some(items);
                self.publish_status();
            }
        }
    }

    async fn begin(&mut self, items: Vec<PlaylistItem>) {
        self.consecutive_failures = 0;
        if items.is_empty() {
            info!("Playlist is empty, stopping playback");
            self.halt().await;
            self.emit(PlaybackEvent::PlaylistCompleted { items: 0 });
            return;
        }
        info!(items = items.len(), "Starting playlist");
        self.items = items;
        self.play(0, None).await;
    }

    async fn play(&mut self, index: usize, retries: Option<u32>) {
        self.generation += 1;
        self.index = index;
        self.deadline = None;

        let item = self.items[index].clone();
        let Some(asset) = item.media_asset.clone() else {
            return self.skip_invalid(format!("item {} has no media", item.id));
        };
        let Some(mut strategy) = RenderStrategy::for_item(&item, &asset, &self.config) else {
            return self.skip_invalid(format!("media {} is not playable", asset.id));
        };
        if let Some(retries) = retries {
            strategy = strategy.with_retries(retries);
        }
        self.phase = Phase::Playing(strategy);

        let kind = asset.kind();
        let source = if kind.is_local() {
            match self.media.cached_path(&asset).await {
                Some(path) => RenderSource::File(path),
                None => {
                    let error = Error::render(format!("media {} is not cached", asset.id));
                    return self.fail_item(strategy, error);
                }
            }
        } else {
            RenderSource::Remote(asset.url.clone())
        };

        let request = RenderRequest {
            index,
            item,
            asset,
            kind,
            source,
            timeout: strategy.timeout(),
        };
        let reporter = RenderReporter {
            tx: self.reporter_tx.clone(),
            generation: self.generation,
        };

        match self.renderer.play(&request, reporter).await {
            Ok(()) => {
                self.deadline = Some(Instant::now() + strategy.timeout());
                self.publish_status();
                self.emit(PlaybackEvent::Started {
                    index,
                    item_id: request.item.id,
                    media_id: request.asset.id,
                    kind,
                });
            }
            Err(e) => self.fail_item(strategy, e),
        }
    }

    async fn on_timer(&mut self) {
        match self.phase {
            Phase::Playing(_) => self.finish_item(),
            Phase::Transition(Next::Advance) => self.advance().await,
            Phase::Transition(Next::Retry(retries)) => self.play(self.index, Some(retries)).await,
            Phase::Stopped => {}
        }
    }

    /// The current item ended on its own.
    fn finish_item(&mut self) {
        self.consecutive_failures = 0;
        if let Some(item) = self.items.get(self.index) {
            self.emit(PlaybackEvent::Completed {
                index: self.index,
                item_id: item.id.clone(),
            });
        }
        self.schedule(Next::Advance, self.config.transition_delay);
    }

    /// Report a render failure and move on. Embeds are retried first; out-of-memory
    /// failures never are.
    fn fail_item(&mut self, strategy: RenderStrategy, error: Error) {
        let Some(item) = self.items.get(self.index) else {
            return;
        };
        let media_id = item.media_asset.as_ref().map(|a| a.id.clone());
        let out_of_memory = error.is_out_of_memory();
        warn!(
            index = self.index,
            item_id = %item.id,
            media_id = ?media_id,
            out_of_memory,
            error = %error,
            "Render failed"
        );

        self.emit(PlaybackEvent::Error {
            index: self.index,
            item_id: item.id.clone(),
            media_id: media_id.clone(),
            error: error.to_string(),
            out_of_memory,
        });
        if let Some(errors) = &self.errors {
            let mut report = ErrorReport::new(ErrorSource::Playback, &error);
            if let Some(media_id) = media_id {
                report = report.with_media(media_id);
            }
            errors.report(report);
        }

        match strategy.retry() {
            Some(retries) if !out_of_memory => {
                debug!(retries_left = retries, "Retrying embed");
                self.schedule(Next::Retry(retries), self.config.transition_delay);
            }
            _ => {
                self.consecutive_failures += 1;
                let delay = if self.consecutive_failures >= self.items.len() {
                    // A whole pass failed; back off before trying again.
                    self.consecutive_failures = 0;
                    IDLE_RETRY_DELAY.max(self.config.transition_delay)
                } else {
                    self.config.transition_delay
                };
                self.schedule(Next::Advance, delay);
            }
        }
    }

    /// A step panicked part-way; skip the current item so the loop keeps going.
    async fn recover_from_panic(&mut self) {
        error!(index = self.index, generation = self.generation, "Playback step panicked");
        if self.items.get(self.index).is_none() {
            self.halt().await;
            return;
        }
        self.skip_invalid("playback step panicked".to_string());
    }

    fn skip_invalid(&mut self, message: String) {
        let strategy = RenderStrategy::Image {
            duration: Duration::ZERO,
        };
        self.fail_item(strategy, Error::render(message));
    }

    fn schedule(&mut self, next: Next, delay: Duration) {
        // Late reports from the finished attempt must not act on the next one.
        self.generation += 1;
        self.phase = Phase::Transition(next);
        self.deadline = Some(Instant::now() + delay);
        self.publish_status();
    }

    async fn advance(&mut self) {
        if let Some(items) = self.pending.take() {
            info!("Applying updated playlist");
            return self.begin(items).await;
        }
        let next = self.index + 1;
        if next >= self.items.len() {
            self.emit(PlaybackEvent::PlaylistCompleted {
                items: self.items.len(),
            });
            self.play(0, None).await;
        } else {
            self.play(next, None).await;
        }
    }

    async fn halt(&mut self) {
        let was_active = !matches!(self.phase, Phase::Stopped);
        self.generation += 1;
        self.phase = Phase::Stopped;
        self.deadline = None;
        self.items.clear();
        self.pending = None;
        self.index = 0;
        self.publish_status();
        if was_active {
            info!("Playback stopped");
        }
        self.renderer.release().await;
    }

    fn publish_status(&self) {
        let current = self.items.get(self.index);
        let state = match self.phase {
            Phase::Stopped => PlaybackState::Stopped,
            Phase::Playing(_) => PlaybackState::Playing,
            Phase::Transition(_) => PlaybackState::Transitioning,
        };
        let stopped = state == PlaybackState::Stopped;
        self.status.send_replace(PlaybackStatus {
            state,
            index: (!stopped).then_some(self.index),
            item_id: current.filter(|_| !stopped).map(|i| i.id.clone()),
            media_id: current
                .filter(|_| !stopped)
                .and_then(|i| i.media_asset.as_ref())
                .map(|a| a.id.clone()),
            items: self.items.len(),
            pending_update: self.pending.is_some(),
            generation: self.generation,
        });
    }

    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MediaAsset;
    use crate::supervisor::ErrorCategory;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;

    #[derive(Default)]
    struct FakeRenderer {
        plays: Mutex<Vec<String>>,
        reporters: Mutex<Vec<RenderReporter>>,
        /// Media id to the number of upcoming `play` calls that fail.
        failures: Mutex<HashMap<String, (usize, fn() -> Error)>>,
        /// Media ids whose next `play` call panics.
        panics: Mutex<HashSet<String>>,
        releases: Mutex<usize>,
    }

    impl FakeRenderer {
        fn fail(&self, media_id: &str, times: usize, error: fn() -> Error) {
            self.failures.lock().insert(media_id.into(), (times, error));
        }

        fn panic_on(&self, media_id: &str) {
            self.panics.lock().insert(media_id.into());
        }

        fn plays(&self) -> Vec<String> {
            self.plays.lock().clone()
        }

        fn last_reporter(&self) -> RenderReporter {
            self.reporters.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn play(&self, request: &RenderRequest, reporter: RenderReporter) -> Result<()> {
            self.plays.lock().push(request.asset.id.clone());
            if self.panics.lock().remove(&request.asset.id) {
                panic!("renderer blew up on {}", request.asset.id);
            }
            if let Some((times, error)) = self.failures.lock().get_mut(&request.asset.id)
                && *times > 0
            {
                *times -= 1;
                return Err(error());
            }
            self.reporters.lock().push(reporter);
            Ok(())
        }

        async fn release(&self) {
            *self.releases.lock() += 1;
        }
    }

    #[derive(Default)]
    struct FakeMedia {
        missing: HashSet<String>,
    }

    #[async_trait]
    impl LocalMedia for FakeMedia {
        async fn cached_path(&self, asset: &MediaAsset) -> Option<PathBuf> {
            (!self.missing.contains(&asset.id)).then(|| PathBuf::from("/media").join(&asset.id))
        }
    }

    #[derive(Default)]
    struct Reports(Mutex<Vec<ErrorReport>>);

    impl ErrorSink for Reports {
        fn report(&self, report: ErrorReport) {
            self.0.lock().push(report);
        }
    }

    fn item(id: &str, mime: &str, url: &str, secs: u32) -> PlaylistItem {
        PlaylistItem {
            id: id.into(),
            display_order: 0,
            display_duration_seconds: secs,
            media_asset_id: None,
            media_asset: Some(MediaAsset {
                id: id.into(),
                name: id.into(),
                url: url.into(),
                mime_type: mime.into(),
                file_size: None,
                duration: None,
            }),
        }
    }

    fn image(id: &str, secs: u32) -> PlaylistItem {
        item(id, "image/png", &format!("https://cdn.example.com/{id}.png"), secs)
    }

    fn video(id: &str, secs: u32) -> PlaylistItem {
        item(id, "video/mp4", &format!("https://cdn.example.com/{id}.mp4"), secs)
    }

    struct Harness {
        handle: PlaybackHandle,
        renderer: Arc<FakeRenderer>,
        reports: Arc<Reports>,
        events: broadcast::Receiver<PlaybackEvent>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    fn harness(media: FakeMedia) -> Harness {
        let renderer = Arc::new(FakeRenderer::default());
        let reports = Arc::new(Reports::default());
        let cancel = CancellationToken::new();
        let (handle, task) = PlaybackController::spawn(
            PlaybackConfig::default(),
            renderer.clone(),
            Arc::new(media),
            Some(reports.clone()),
            cancel.clone(),
        );
        let events = handle.subscribe();
        Harness {
            handle,
            renderer,
            reports,
            events,
            cancel,
            task,
        }
    }

    fn drain(events: &mut broadcast::Receiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_then_video_then_wrap() {
        let mut h = harness(FakeMedia::default());
        h.handle
            .start_playlist(vec![image("a", 5), video("b", 5)])
            .unwrap();
        settle().await;
        assert_eq!(h.renderer.plays(), vec!["a"]);
        assert_eq!(h.handle.status().index, Some(0));

        tokio::time::sleep(Duration::from_millis(5600)).await;
        assert_eq!(h.renderer.plays(), vec!["a", "b"]);
        assert_eq!(h.handle.status().state, PlaybackState::Playing);

        h.renderer.last_reporter().completed();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.renderer.plays(), vec!["a", "b", "a"]);

        let events = drain(&mut h.events);
        let completed = events
            .iter()
            .filter(|e| matches!(e, PlaybackEvent::PlaylistCompleted { .. }))
            .count();
        assert_eq!(completed, 1);
        assert!(events.contains(&PlaybackEvent::Completed {
            index: 1,
            item_id: "b".into()
        }));
        assert!(h.reports.0.lock().is_empty());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_playlist_follows_display_order() {
        let h = harness(FakeMedia::default());
        let mut b = image("b", 5);
        b.display_order = 2;
        let mut a = image("a", 5);
        a.display_order = 1;
        h.handle.start_playlist(vec![b, a]).unwrap();
        settle().await;
        assert_eq!(h.renderer.plays(), vec!["a"]);

        tokio::time::sleep(Duration::from_millis(5600)).await;
        assert_eq!(h.renderer.plays(), vec!["a", "b"]);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_video_duration_uses_fallback() {
        let h = harness(FakeMedia::default());
        let mut huge = video("v", 5);
        huge.media_asset.as_mut().unwrap().duration = Some(1e20);
        h.handle.start_playlist(vec![huge, image("b", 5)]).unwrap();
        settle().await;
        assert_eq!(h.renderer.plays(), vec!["v"]);
        assert_eq!(h.handle.status().state, PlaybackState::Playing);

        // Default fallback is 300s.
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(h.renderer.plays(), vec!["v", "b"]);
        assert!(h.reports.0.lock().is_empty());
        assert!(!h.task.is_finished());
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_render_skips_item_and_keeps_running() {
        let mut h = harness(FakeMedia::default());
        h.renderer.panic_on("a");
        h.handle
            .start_playlist(vec![image("a", 5), image("b", 5)])
            .unwrap();
        settle().await;
        assert_eq!(h.renderer.plays(), vec!["a"]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.renderer.plays(), vec!["a", "b"]);
        assert_eq!(h.handle.status().item_id.as_deref(), Some("b"));
        assert_eq!(h.reports.0.lock().len(), 1);
        assert!(drain(&mut h.events).iter().any(|e| matches!(
            e,
            PlaybackEvent::Error { item_id, .. } if item_id == "a"
        )));

        // The actor is still alive and accepts new work.
        h.handle.start_playlist(vec![image("c", 5)]).unwrap();
        settle().await;
        assert_eq!(h.renderer.plays(), vec!["a", "b", "c"]);
        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_releases_renderer_and_replays() {
        let h = harness(FakeMedia::default());
        h.handle
            .start_playlist(vec![image("a", 5), image("b", 5)])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5600)).await;
        assert_eq!(h.renderer.plays(), vec!["a", "b"]);
        let releases = *h.renderer.releases.lock();

        h.handle.reload().unwrap();
        settle().await;
        assert_eq!(*h.renderer.releases.lock(), releases + 1);
        assert_eq!(h.renderer.plays(), vec!["a", "b", "a"]);
        let status = h.handle.status();
        assert_eq!(status.index, Some(0));
        assert_eq!(status.state, PlaybackState::Playing);

        // Reports from the released attempt are stale.
        let stale = h.renderer.reporters.lock()[1].clone();
        stale.failed(Error::render("decoder gone"));
        settle().await;
        assert!(h.reports.0.lock().is_empty());
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_update_is_noop() {
        let h = harness(FakeMedia::default());
        let playlist = vec![image("a", 5), video("b", 5)];
        h.handle.start_playlist(playlist.clone()).unwrap();
        settle().await;
        let before = h.handle.status();

        let mut same = playlist.clone();
        same[0].display_order = 10;
        same[1].display_order = 20;
        h.handle.update_items(same).unwrap();
        settle().await;

        assert_eq!(h.handle.status(), before);
        assert_eq!(h.renderer.plays(), vec!["a"]);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_update_waits_for_current_item() {
        let h = harness(FakeMedia::default());
        h.handle
            .start_playlist(vec![image("a", 5), image("b", 5)])
            .unwrap();
        settle().await;

        h.handle
            .update_items(vec![image("x", 5), image("y", 5)])
            .unwrap();
        settle().await;
        assert!(h.handle.status().pending_update);
        assert_eq!(h.renderer.plays(), vec!["a"]);

        tokio::time::sleep(Duration::from_millis(5600)).await;
        assert_eq!(h.renderer.plays(), vec!["a", "x"]);
        let status = h.handle.status();
        assert_eq!(status.index, Some(0));
        assert!(!status.pending_update);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_while_stopped_starts_immediately() {
        let h = harness(FakeMedia::default());
        h.handle.update_items(vec![image("a", 5)]).unwrap();
        settle().await;
        assert_eq!(h.renderer.plays(), vec!["a"]);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_memory_skips_item() {
        let mut h = harness(FakeMedia::default());
        h.renderer
            .fail("x", 1, || Error::OutOfMemory("texture upload".into()));
        h.handle
            .start_playlist(vec![image("w", 5), image("x", 5), image("y", 5)])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(6100)).await;

        assert_eq!(h.renderer.plays(), vec!["w", "x", "y"]);
        assert_eq!(h.handle.status().item_id.as_deref(), Some("y"));
        let reports = h.reports.0.lock().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].category, ErrorCategory::OutOfMemory);
        assert_eq!(reports[0].media_id.as_deref(), Some("x"));
        assert!(drain(&mut h.events).iter().any(|e| matches!(
            e,
            PlaybackEvent::Error {
                out_of_memory: true,
                ..
            }
        )));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncached_item_is_skipped() {
        let media = FakeMedia {
            missing: HashSet::from(["b".to_string()]),
        };
        let h = harness(media);
        h.handle
            .start_playlist(vec![image("a", 5), image("b", 5), image("c", 5)])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(6100)).await;

        // `b` never reaches the renderer.
        assert_eq!(h.renderer.plays(), vec!["a", "c"]);
        assert_eq!(h.reports.0.lock()[0].category, ErrorCategory::Component);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_embed_retried_once_then_skipped() {
        let h = harness(FakeMedia::default());
        h.renderer
            .fail("yt", 5, || Error::render("player failed to load"));
        h.handle
            .start_playlist(vec![
                item("yt", "video/mp4", "https://www.youtube.com/watch?v=1", 10),
                image("z", 5),
            ])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(h.renderer.plays(), vec!["yt", "yt", "z"]);
        assert_eq!(h.reports.0.lock().len(), 2);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_completion_is_ignored() {
        let h = harness(FakeMedia::default());
        h.handle
            .start_playlist(vec![video("v1", 5), video("v2", 5)])
            .unwrap();
        settle().await;
        let first = h.renderer.last_reporter();
        first.completed();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.renderer.plays(), vec!["v1", "v2"]);

        // A duplicate report from v1 must not skip v2.
        first.completed();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.renderer.plays(), vec!["v1", "v2"]);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_playlist_and_stop() {
        let mut h = harness(FakeMedia::default());
        h.handle.start_playlist(Vec::new()).unwrap();
        settle().await;
        assert_eq!(
            drain(&mut h.events),
            vec![PlaybackEvent::PlaylistCompleted { items: 0 }]
        );
        assert_eq!(h.handle.status().state, PlaybackState::Stopped);

        h.handle.start_playlist(vec![image("a", 5)]).unwrap();
        settle().await;
        let releases = *h.renderer.releases.lock();
        h.handle.stop_playback().await.unwrap();
        let status = h.handle.status();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(status.index, None);
        assert_eq!(*h.renderer.releases.lock(), releases + 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.renderer.plays(), vec!["a"]);
        h.cancel.cancel();
    }
}
