//! Resilience supervisor.
//!
//! Components report errors through a [`SupervisorHandle`]. A single task owns the
//! counters, runs the periodic health probe and arms at most one delayed restart.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classify::{ErrorCategory, ErrorReport, ErrorSink, ErrorSource};
use super::crash::{CrashJournal, CrashRecord, MemorySnapshot};
use super::policy::{ErrorCounters, RestartHistory, Verdict};
use crate::config::SupervisorConfig;
use crate::error::mentions_out_of_memory;
use crate::database::repositories::device_state::{
    DeviceStateRepository, get_json, keys, set_json,
};
use crate::transport::{AlertLevel, AlertReport, BackendApi, HealthReport};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RestartSync,
    RestartNotifications,
    /// Trim the media cache, then release the renderer and replay from the first item.
    ReclaimMemory,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RestartSync => "restart_sync",
            Self::RestartNotifications => "restart_notifications",
            Self::ReclaimMemory => "reclaim_memory",
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    ErrorRecorded {
        source: ErrorSource,
        category: ErrorCategory,
        message: String,
    },
    AlertRaised {
        kind: String,
        message: String,
    },
    RecoveryAttempted {
        action: RecoveryAction,
        success: bool,
    },
    /// A full restart will happen at `at` unless the supervisor is stopped first.
    RestartScheduled {
        reason: String,
        at: DateTime<Utc>,
    },
    RestartCancelled,
    /// The crash-loop guard refused a restart.
    RestartSuppressed {
        reason: String,
        restarts_in_window: usize,
    },
    Restarting {
        reason: String,
    },
}

/// Component figures included in the heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComponentSnapshot {
    pub playback_state: String,
    pub sync_state: String,
    pub notification_state: String,
    pub cache_entries: usize,
    pub cache_bytes: u64,
    pub download_queue_depth: usize,
}

/// The engine as seen by the supervisor.
#[async_trait]
pub trait Supervised: Send + Sync {
    async fn recover(&self, action: RecoveryAction) -> Result<()>;

    /// Whether the sync loop stopped making progress.
    fn sync_stalled(&self) -> bool;

    fn snapshot(&self) -> ComponentSnapshot;
}

/// Performs the clean full restart once the delay has elapsed.
#[async_trait]
pub trait ProcessRestarter: Send + Sync {
    async fn restart(&self, reason: &str);
}

pub type MemoryProbe = Arc<dyn Fn() -> MemorySnapshot + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub critical_errors: usize,
    pub component_errors: usize,
    pub consecutive_crashes: usize,
    pub restart_pending_at: Option<DateTime<Utc>>,
    pub restarts_in_window: usize,
    /// The crash-loop guard is holding restarts back.
    pub restarts_suppressed: bool,
    pub memory_used_percent: Option<f64>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

/// Cheap, cloneable reporting side of the supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<ErrorReport>,
    journal: Arc<CrashJournal>,
}

impl SupervisorHandle {
    /// Journal a top-level fault, then report it as a crash.
    pub fn record_crash(&self, message: impl Into<String>, location: Option<String>) {
        let record = CrashRecord::capture(message, location);
        if let Err(e) = self.journal.append(&record) {
            error!(error = %e, "Failed to journal crash");
        }
        self.report_crash(&record);
    }

    /// Report a crash that was already journaled.
    pub fn report_crash(&self, record: &CrashRecord) {
        let mut report = ErrorReport::crash(record.message.clone());
        report.timestamp = record.timestamp;
        self.report(report);
    }
}

impl ErrorSink for SupervisorHandle {
    fn report(&self, report: ErrorReport) {
        let _ = self.tx.send(report);
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    api: Arc<dyn BackendApi>,
    device_state: Arc<dyn DeviceStateRepository>,
    journal: Arc<CrashJournal>,
    memory: MemoryProbe,
    tx: mpsc::UnboundedSender<ErrorReport>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ErrorReport>>>,
    events: broadcast::Sender<SupervisorEvent>,
    status: watch::Sender<SupervisorStatus>,
    probe_request: Arc<Notify>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        api: Arc<dyn BackendApi>,
        device_state: Arc<dyn DeviceStateRepository>,
        journal: Arc<CrashJournal>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (status, _) = watch::channel(SupervisorStatus::default());
        Self {
            config,
            api,
            device_state,
            journal,
            memory: Arc::new(MemorySnapshot::capture),
            tx,
            rx: Mutex::new(Some(rx)),
            events,
            status,
            probe_request: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_memory_probe(mut self, probe: MemoryProbe) -> Self {
        self.memory = probe;
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.tx.clone(),
            journal: self.journal.clone(),
        }
    }

    pub fn journal(&self) -> &Arc<CrashJournal> {
        &self.journal
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    /// Run the health probe now instead of waiting for the next interval.
    pub fn request_probe(&self) {
        self.probe_request.notify_one();
    }

    /// Start the supervision task. Reports sent before this are kept and processed.
    pub fn start(
        &self,
        target: Arc<dyn Supervised>,
        restarter: Arc<dyn ProcessRestarter>,
    ) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::Other("supervisor already started".to_string()))?;

        let worker = Worker {
            config: self.config.clone(),
            api: self.api.clone(),
            device_state: self.device_state.clone(),
            journal: self.journal.clone(),
            memory: self.memory.clone(),
            events: self.events.clone(),
            status: self.status.clone(),
            target,
            restarter,
            counters: ErrorCounters::default(),
            history: RestartHistory::default(),
            pending: None,
            suppressed: false,
            started: Instant::now(),
            memory_used_percent: None,
            last_probe_at: None,
        };
        let cancel = self.cancel.clone();
        let probe_request = self.probe_request.clone();
        *self.task.lock() = Some(tokio::spawn(worker.run(rx, probe_request, cancel)));
        info!("Supervisor started");
        Ok(())
    }

    /// Stop supervising. A pending restart is cancelled.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Supervisor task ended abnormally");
        }
    }
}

struct PendingRestart {
    at: Instant,
    reason: String,
}

struct Worker {
    config: SupervisorConfig,
    api: Arc<dyn BackendApi>,
    device_state: Arc<dyn DeviceStateRepository>,
    journal: Arc<CrashJournal>,
    memory: MemoryProbe,
    events: broadcast::Sender<SupervisorEvent>,
    status: watch::Sender<SupervisorStatus>,
    target: Arc<dyn Supervised>,
    restarter: Arc<dyn ProcessRestarter>,
    counters: ErrorCounters,
    history: RestartHistory,
    pending: Option<PendingRestart>,
    suppressed: bool,
    started: Instant,
    memory_used_percent: Option<f64>,
    last_probe_at: Option<DateTime<Utc>>,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ErrorReport>,
        probe_request: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        self.load().await;

        let mut probe = tokio::time::interval_at(
            Instant::now() + self.config.health_interval,
            self.config.health_interval,
        );
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let restart_at = self.pending.as_ref().map(|p| p.at);
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(report) = rx.recv() => self.on_report(report).await,

                _ = Self::restart_timer(restart_at) => self.execute_restart().await,

                _ = probe.tick() => self.probe().await,

                _ = probe_request.notified() => {
                    self.probe().await;
                    probe.reset();
                }
            }
        }

        if self.pending.take().is_some() {
            info!("Pending restart cancelled");
            self.emit(SupervisorEvent::RestartCancelled);
            self.publish_status();
        }
        self.persist().await;
        debug!("Supervisor stopped");
    }

    async fn restart_timer(at: Option<Instant>) {
        match at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    async fn load(&mut self) {
        let state = self.device_state.as_ref();
        match get_json::<ErrorCounters>(state, keys::ERROR_COUNTERS).await {
            Ok(Some(counters)) => self.counters = counters,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load error counters"),
        }
        match get_json::<RestartHistory>(state, keys::RESTART_HISTORY).await {
            Ok(Some(history)) => self.history = history,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load restart history"),
        }

        let seeded = self
            .journal
            .load()
            .into_iter()
            .filter(|record| !mentions_out_of_memory(&record.message))
            .filter(|record| self.counters.record_crash(record.timestamp))
            .count();
        let now = Utc::now();
        self.counters.prune(now, self.config.window);
        if seeded > 0 {
            info!(seeded, crashes = self.counters.crashes.len(), "Loaded crash history");
        }
        self.publish_status();

        if let Verdict::Restart { reason } = self.counters.restart_verdict(&self.config) {
            self.arm_restart(reason).await;
        }
    }

    async fn on_report(&mut self, report: ErrorReport) {
        match report.category {
            ErrorCategory::Network => {
                debug!(source = %report.source, message = %report.message, "Network error")
            }
            ErrorCategory::Component => {
                warn!(source = %report.source, message = %report.message, "Component error")
            }
            ErrorCategory::OutOfMemory => warn!(
                source = %report.source,
                media_id = ?report.media_id,
                message = %report.message,
                "Out of memory"
            ),
            ErrorCategory::Critical => {
                error!(source = %report.source, message = %report.message, "Critical error")
            }
        }
        self.emit(SupervisorEvent::ErrorRecorded {
            source: report.source,
            category: report.category,
            message: report.message.clone(),
        });

        let verdict =
            self.counters
                .record(report.source, report.category, report.timestamp, &self.config);
        if matches!(
            report.category,
            ErrorCategory::Component | ErrorCategory::Critical
        ) {
            self.persist().await;
        }
        self.publish_status();

        match report.category {
            ErrorCategory::OutOfMemory => self.recover(RecoveryAction::ReclaimMemory).await,
            ErrorCategory::Critical => {
                self.alert(
                    AlertLevel::Critical,
                    "critical_error",
                    format!("{}: {}", report.source, report.message),
                )
                .await;
                match report.source {
                    ErrorSource::Sync => self.recover(RecoveryAction::RestartSync).await,
                    ErrorSource::Notification => {
                        self.recover(RecoveryAction::RestartNotifications).await
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        match verdict {
            Verdict::Ignore => {}
            Verdict::Alert { count } => {
                self.alert(
                    AlertLevel::Warning,
                    "component_errors",
                    format!("{count} component errors within the window"),
                )
                .await;
            }
            Verdict::Restart { reason } => self.arm_restart(reason).await,
        }
    }

    /// Try every component recovery, then schedule one delayed restart.
    async fn arm_restart(&mut self, reason: String) {
        if self.pending.is_some() {
            debug!(%reason, "Restart already scheduled");
            return;
        }

        for action in [
            RecoveryAction::RestartSync,
            RecoveryAction::RestartNotifications,
            RecoveryAction::ReclaimMemory,
        ] {
            self.recover(action).await;
        }

        let now = Utc::now();
        let restarts_in_window = self.history.recent(now, self.config.restart_window);
        if restarts_in_window >= self.config.max_restarts_per_window {
            self.counters.clear_for_restart(now);
            self.persist().await;
            if !self.suppressed {
                self.suppressed = true;
                error!(%reason, restarts_in_window, "Crash loop detected, restart suppressed");
                self.alert(
                    AlertLevel::Critical,
                    "crash_loop",
                    format!("{restarts_in_window} restarts within the guard window; running degraded"),
                )
                .await;
            }
            self.emit(SupervisorEvent::RestartSuppressed {
                reason,
                restarts_in_window,
            });
            self.publish_status();
            return;
        }

        let delay = self.config.restart_delay;
        let at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        warn!(%reason, delay_secs = delay.as_secs_f64(), "Restart scheduled");
        self.pending = Some(PendingRestart {
            at: Instant::now() + delay,
            reason: reason.clone(),
        });
        self.emit(SupervisorEvent::RestartScheduled { reason, at });
        self.publish_status();
    }

    async fn execute_restart(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let now = Utc::now();
        self.history.record(now, self.config.restart_window);
        self.counters.clear_for_restart(now);
        self.persist().await;

        self.alert(AlertLevel::Critical, "restart", pending.reason.clone())
            .await;
        error!(reason = %pending.reason, "Restarting");
        self.emit(SupervisorEvent::Restarting {
            reason: pending.reason.clone(),
        });
        self.publish_status();
        self.restarter.restart(&pending.reason).await;
    }

    async fn probe(&mut self) {
        let now = Utc::now();
        self.last_probe_at = Some(now);

        let memory = (self.memory)();
        let ratio = memory.used_ratio();
        self.memory_used_percent = Some(ratio * 100.0);
        if ratio > self.config.memory_threshold {
            warn!(used_percent = ratio * 100.0, "Memory pressure");
            self.recover(RecoveryAction::ReclaimMemory).await;
        }

        if self.target.sync_stalled() {
            warn!("Sync loop is stalled");
            self.recover(RecoveryAction::RestartSync).await;
        }

        self.counters.prune(now, self.config.window);
        if self.suppressed
            && self.history.allows(
                now,
                self.config.max_restarts_per_window,
                self.config.restart_window,
            )
        {
            info!("Crash-loop guard released");
            self.suppressed = false;
        }
        self.publish_status();

        let snapshot = self.target.snapshot();
        let report = HealthReport {
            status: self.health_status().to_string(),
            timestamp: now,
            uptime_secs: self.started.elapsed().as_secs(),
            memory_used_percent: ratio * 100.0,
            cache_entries: snapshot.cache_entries,
            cache_bytes: snapshot.cache_bytes,
            download_queue_depth: snapshot.download_queue_depth,
            playback_state: snapshot.playback_state,
            sync_state: snapshot.sync_state,
            notification_state: snapshot.notification_state,
            critical_errors: self.counters.critical.len(),
            crash_count: self.counters.crashes.len(),
        };
        if let Err(e) = self.api.post_health(&report).await {
            debug!(error = %e, "Heartbeat not delivered");
        }
    }

    fn health_status(&self) -> &'static str {
        if self.pending.is_some() || self.suppressed {
            "degraded"
        } else if self.counters.critical.is_empty() && self.counters.crashes.is_empty() {
            "healthy"
        } else {
            "warning"
        }
    }

    async fn recover(&self, action: RecoveryAction) {
        let success = match self.target.recover(action).await {
            Ok(()) => {
                info!(%action, "Recovery succeeded");
                true
            }
            Err(e) => {
                warn!(%action, error = %e, "Recovery failed");
                false
            }
        };
        self.emit(SupervisorEvent::RecoveryAttempted { action, success });
    }

    /// Best effort; delivery failures are only logged.
    async fn alert(&self, level: AlertLevel, kind: &str, message: String) {
        self.emit(SupervisorEvent::AlertRaised {
            kind: kind.to_string(),
            message: message.clone(),
        });
        let alert = AlertReport::new(level, kind, message);
        if let Err(e) = self.api.post_alert(&alert).await {
            debug!(kind, error = %e, "Alert not delivered");
        }
    }

    async fn persist(&self) {
        let state = self.device_state.as_ref();
        if let Err(e) = set_json(state, keys::ERROR_COUNTERS, &self.counters).await {
            warn!(error = %e, "Failed to persist error counters");
        }
        if let Err(e) = set_json(state, keys::RESTART_HISTORY, &self.history).await {
            warn!(error = %e, "Failed to persist restart history");
        }
    }

    fn publish_status(&self) {
        let now = Utc::now();
        let restart_pending_at = self.pending.as_ref().map(|p| {
            let remaining = p.at.saturating_duration_since(Instant::now());
            now + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero())
        });
        self.status.send_replace(SupervisorStatus {
            critical_errors: self.counters.critical.len(),
            component_errors: self.counters.component.len(),
            consecutive_crashes: self.counters.crashes.len(),
            restart_pending_at,
            restarts_in_window: self.history.recent(now, self.config.restart_window),
            restarts_suppressed: self.suppressed,
            memory_used_percent: self.memory_used_percent,
            last_probe_at: self.last_probe_at,
        });
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }
}
