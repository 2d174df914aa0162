//! Download task and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MediaAsset, Priority};
use crate::{Error, Result};

/// Lifecycle of a download task. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, target: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, target),
            (Queued, Downloading)
                | (Queued, Cancelled)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
        )
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One media download.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub media_id: String,
    pub asset: MediaAsset,
    pub priority: Priority,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    /// Enqueue order, FIFO tiebreak among equal priorities.
    pub(crate) seq: u64,
}

impl DownloadTask {
    pub(crate) fn new(asset: MediaAsset, priority: Priority, seq: u64) -> Self {
        Self {
            media_id: asset.id.clone(),
            total_bytes: asset.file_size,
            asset,
            priority,
            status: DownloadStatus::Queued,
            bytes_downloaded: 0,
            created_at: Utc::now(),
            seq,
        }
    }

    pub fn transition_to(&mut self, target: DownloadStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// Fraction downloaded, when the total is known.
    pub fn progress(&self) -> Option<f64> {
        self.total_bytes
            .filter(|t| *t > 0)
            .map(|t| (self.bytes_downloaded as f64 / t as f64).min(1.0))
    }
}
