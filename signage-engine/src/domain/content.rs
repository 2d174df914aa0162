//! Backend payloads: sync metadata, resolved current content, poll results.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::NotificationEvent;
use super::media::MediaAsset;
use super::playlist::{Playlist, PlaylistItem};
use super::schedule::{Schedule, resolve_active};

/// Response of `GET sync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    #[serde(default)]
    pub playlists: Vec<Playlist>,
    #[serde(alias = "media_assets", alias = "media", default)]
    pub media_assets: Vec<MediaAsset>,
    #[serde(alias = "schedule_changed", default)]
    pub schedule_changed: bool,
    #[serde(alias = "media_changed", default)]
    pub media_changed: bool,
}

impl SyncResponse {
    /// Playlist a schedule points at, embedded or looked up by id.
    pub fn playlist_for<'a>(&'a self, schedule: &'a Schedule) -> Option<&'a Playlist> {
        if let Some(playlist) = schedule.playlist.as_ref() {
            return Some(playlist);
        }
        let id = schedule.playlist_id.as_deref()?;
        self.playlists.iter().find(|p| p.id == id)
    }

    /// Every asset reachable from any schedule's playlist, each paired with the first
    /// schedule that reaches it. Duplicates are removed.
    pub fn reachable_assets(&self) -> Vec<(&Schedule, MediaAsset)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for schedule in &self.schedules {
            let Some(playlist) = self.playlist_for(schedule) else {
                continue;
            };
            for asset in playlist.assets(&self.media_assets) {
                if seen.insert(asset.id.clone()) {
                    out.push((schedule, asset));
                }
            }
        }
        out
    }

    /// Order-insensitive fingerprint of schedule ids/windows and asset ids/urls, used to
    /// detect changes the backend flags did not report.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut parts: Vec<String> = self
            .schedules
            .iter()
            .map(|s| {
                format!(
                    "s:{}:{}:{}:{:?}:{}:{:?}",
                    s.id, s.start_time, s.end_time, s.days_of_week, s.priority, s.playlist_id
                )
            })
            .collect();
        parts.extend(
            self.reachable_assets()
                .into_iter()
                .map(|(_, a)| format!("m:{}:{}", a.id, a.url)),
        );
        parts.sort();

        let mut hasher = Sha256::new();
        for part in &parts {
            hasher.update(part.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Resolve the current content locally from the synced schedules, for when the
    /// server-resolved snapshot is unavailable.
    pub fn resolve_snapshot(&self, now: NaiveDateTime) -> CurrentContentSnapshot {
        let Some(schedule) = resolve_active(&self.schedules, now) else {
            return CurrentContentSnapshot::empty();
        };
        let playlist = self.playlist_for(schedule).cloned();
        let media_assets = playlist
            .as_ref()
            .map(|p| p.assets(&self.media_assets))
            .unwrap_or_default();
        CurrentContentSnapshot {
            schedule: Some(schedule.clone()),
            playlist,
            media_assets,
            resolved_at: Utc::now(),
        }
    }
}

/// The server-resolved "what should play right now" for this terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentContentSnapshot {
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub playlist: Option<Playlist>,
    #[serde(alias = "media_assets", alias = "media", default)]
    pub media_assets: Vec<MediaAsset>,
    #[serde(alias = "resolved_at", default = "Utc::now")]
    pub resolved_at: DateTime<Utc>,
}

impl Default for CurrentContentSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl CurrentContentSnapshot {
    pub fn empty() -> Self {
        Self {
            schedule: None,
            playlist: None,
            media_assets: Vec::new(),
            resolved_at: Utc::now(),
        }
    }

    /// Ordered items with resolvable assets.
    pub fn playlist_items(&self) -> Vec<PlaylistItem> {
        let playlist = self
            .playlist
            .as_ref()
            .or_else(|| self.schedule.as_ref().and_then(|s| s.playlist.as_ref()));
        match playlist {
            Some(p) => p.resolved_items(&self.media_assets),
            None => Vec::new(),
        }
    }

    /// Assets needed to play this snapshot.
    pub fn assets(&self) -> Vec<MediaAsset> {
        let mut seen = HashSet::new();
        self.playlist_items()
            .into_iter()
            .filter_map(|item| item.media_asset)
            .chain(self.media_assets.iter().cloned())
            .filter(|a| seen.insert(a.id.clone()))
            .collect()
    }

    pub fn has_content(&self) -> bool {
        !self.playlist_items().is_empty()
    }

    /// Equality ignoring `resolved_at`.
    pub fn same_content(&self, other: &Self) -> bool {
        self.schedule == other.schedule
            && self.playlist == other.playlist
            && self.media_assets == other.media_assets
    }
}

/// Response of `GET notifications/poll`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    #[serde(default)]
    pub notifications: Vec<NotificationEvent>,
    #[serde(alias = "has_updates", default)]
    pub has_updates: bool,
    #[serde(alias = "recommended_interval_seconds", default)]
    pub recommended_interval_seconds: Option<u64>,
    /// Emergency override forcing the finest polling cadence.
    #[serde(alias = "emergency_mode", default)]
    pub emergency: bool,
}
