//! Seams between the engine and the backend.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::domain::{CurrentContentSnapshot, MediaAsset, PollResponse, SyncResponse};

/// Screen-scoped backend calls.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// `GET sync`: schedules, playlists and change flags.
    async fn fetch_sync(&self) -> Result<SyncResponse>;

    /// `GET current-content`: the server-resolved snapshot.
    async fn fetch_current_content(&self) -> Result<CurrentContentSnapshot>;

    /// `GET notifications/poll`.
    async fn poll_notifications(&self) -> Result<PollResponse>;

    /// `POST health`, fire-and-forget telemetry.
    async fn post_health(&self, report: &HealthReport) -> Result<()>;

    /// `POST alerts`, fire-and-forget telemetry.
    async fn post_alert(&self, alert: &AlertReport) -> Result<()>;

    /// Drop in-memory credentials after the backend unpaired this terminal.
    fn forget_credentials(&self) {}
}

/// An opened media download.
pub struct MediaBody {
    /// `Content-Length` when the server sent one.
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for MediaBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Source of media file bytes.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(&self, asset: &MediaAsset) -> Result<MediaBody>;
}

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name; `message` when the server sent none.
    pub event: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Open,
    Frame(SseFrame),
}

/// Opens the `notifications/stream` event stream.
///
/// The returned stream ends (or yields an error) when the connection is lost; the
/// caller owns reconnection.
#[async_trait]
pub trait EventStreamConnector: Send + Sync {
    async fn connect(&self) -> Result<BoxStream<'static, Result<StreamSignal>>>;
}

/// Periodic heartbeat posted by the health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub memory_used_percent: f64,
    pub cache_entries: usize,
    pub cache_bytes: u64,
    pub download_queue_depth: usize,
    pub playback_state: String,
    pub sync_state: String,
    pub notification_state: String,
    pub critical_errors: usize,
    pub crash_count: usize,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertReport {
    pub level: AlertLevel,
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AlertReport {
    pub fn new(level: AlertLevel, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            kind: kind.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
