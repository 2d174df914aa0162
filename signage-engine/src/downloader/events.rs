//! Download queue events.

use std::path::PathBuf;

use serde::Serialize;

/// Events published by the download queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        media_id: String,
        total_bytes: Option<u64>,
    },
    /// Throttled progress update.
    Progress {
        media_id: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },
    Completed {
        media_id: String,
        path: PathBuf,
        bytes: u64,
    },
    Failed {
        media_id: String,
        error: String,
        /// Connectivity failure rather than a bad file or server error.
        network: bool,
    },
    Cancelled {
        media_id: String,
    },
    /// Queue drained: no task pending or running.
    AllCompleted {
        completed: usize,
        failed: usize,
    },
}

impl DownloadEvent {
    pub fn media_id(&self) -> Option<&str> {
        match self {
            Self::Started { media_id, .. }
            | Self::Progress { media_id, .. }
            | Self::Completed { media_id, .. }
            | Self::Failed { media_id, .. }
            | Self::Cancelled { media_id } => Some(media_id),
            Self::AllCompleted { .. } => None,
        }
    }
}
