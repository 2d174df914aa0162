//! Sync orchestrator events.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    ErrorBackoff,
    /// The backend no longer knows this terminal; waiting to be paired again.
    Onboarding,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::ErrorBackoff => "error_backoff",
            Self::Onboarding => "onboarding",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    StatusChanged {
        state: SyncState,
    },
    /// A new snapshot was published; read it from the snapshot watch.
    ContentAvailable {
        schedule_id: Option<String>,
        items: usize,
    },
    SyncError {
        error: String,
        consecutive_failures: u32,
        network: bool,
    },
    Unpaired,
}
