//! Notification channel lifecycle and status surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::dispatcher::{ListenerSet, NotificationListener};
use super::{polling, streaming};
use crate::config::{NotificationConfig, NotificationMode};
use crate::domain::NotificationEvent;
use crate::transport::{BackendApi, EventStreamConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Stopped,
    Connecting,
    Connected,
    Backoff,
    /// Reconnect attempts exhausted; only `restart()` resumes.
    Degraded,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub mode: NotificationMode,
    pub state: ChannelState,
    /// Consecutive failed connects (streaming) or polls (polling).
    pub attempts: u32,
    /// Wait currently applied before the next poll or reconnect.
    pub current_interval: Option<Duration>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// State shared between the channel handle and its I/O loop.
pub(super) struct ChannelShared {
    pub(super) config: NotificationConfig,
    pub(super) api: Arc<dyn BackendApi>,
    pub(super) connector: Arc<dyn EventStreamConnector>,
    listeners: ListenerSet,
    status: RwLock<ChannelStatus>,
}

impl ChannelShared {
    pub(super) fn set_state(
        &self,
        state: ChannelState,
        attempts: u32,
        current_interval: Option<Duration>,
    ) {
        let mut status = self.status.write();
        if status.state != state {
            debug!(from = %status.state, to = %state, "Notification channel state changed");
        }
        status.state = state;
        status.attempts = attempts;
        status.current_interval = current_interval;
    }

    /// Forward content updates and device commands; everything else is only recorded.
    pub(super) fn deliver(&self, event: NotificationEvent) {
        self.status.write().last_event_at = Some(Utc::now());
        if !event.change_type.is_forwarded() {
            debug!(change_type = ?event.change_type, "Ignoring notification");
            return;
        }
        let delivered = self.listeners.dispatch(&event);
        debug!(change_type = ?event.change_type, delivered, "Dispatched notification");
    }
}

/// Change notification channel running one of the two strategies.
pub struct NotificationChannel {
    shared: Arc<ChannelShared>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationChannel {
    pub fn new(
        config: NotificationConfig,
        api: Arc<dyn BackendApi>,
        connector: Arc<dyn EventStreamConnector>,
    ) -> Self {
        let status = ChannelStatus {
            mode: config.mode,
            state: ChannelState::Stopped,
            attempts: 0,
            current_interval: None,
            last_event_at: None,
        };
        Self {
            shared: Arc::new(ChannelShared {
                listeners: ListenerSet::new(config.listener_capacity),
                config,
                api,
                connector,
                status: RwLock::new(status),
            }),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> NotificationMode {
        self.shared.config.mode
    }

    pub fn add_listener(&self, name: impl Into<String>, listener: Arc<dyn NotificationListener>) {
        self.shared.listeners.add(name, listener);
    }

    pub fn status(&self) -> ChannelStatus {
        self.shared.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the I/O loop. A no-op while it is running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());

        let shared = Arc::clone(&self.shared);
        info!(mode = %shared.config.mode, "Starting notification channel");
        *task = Some(match shared.config.mode {
            NotificationMode::Streaming => tokio::spawn(streaming::run(shared, token)),
            NotificationMode::Polling => tokio::spawn(polling::run(shared, token)),
        });
    }

    /// Cancel the loop and any pending backoff timer.
    pub async fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && e.is_panic()
        {
            error!("Notification loop panicked: {}", e);
        }
        self.shared.set_state(ChannelState::Stopped, 0, None);
    }

    /// Stop and start again with fresh attempt counters.
    pub async fn restart(&self) {
        info!("Restarting notification channel");
        self.stop().await;
        self.start();
    }
}
