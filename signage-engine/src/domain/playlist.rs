//! Playlists and playlist items.

use serde::{Deserialize, Serialize};

use super::media::MediaAsset;

/// Display duration used when the backend sends zero or nothing.
pub const DEFAULT_DISPLAY_DURATION_SECS: u32 = 10;

/// One entry of a playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    pub id: String,
    #[serde(alias = "display_order", default)]
    pub display_order: i32,
    #[serde(alias = "display_duration_seconds", alias = "duration", default)]
    pub display_duration_seconds: u32,
    /// Reference to an asset in the response's media list, when not embedded.
    #[serde(alias = "media_asset_id", default)]
    pub media_asset_id: Option<String>,
    #[serde(alias = "media_asset", alias = "media", default)]
    pub media_asset: Option<MediaAsset>,
}

impl PlaylistItem {
    /// Effective display duration in seconds (never zero).
    pub fn duration_secs(&self) -> u32 {
        if self.display_duration_seconds == 0 {
            DEFAULT_DISPLAY_DURATION_SECS
        } else {
            self.display_duration_seconds
        }
    }
}

/// An ordered list of items referencing media assets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "playlist_items")]
    pub items: Vec<PlaylistItem>,
}

impl Playlist {
    /// Items with a resolvable asset, sorted by `display_order`.
    ///
    /// Items carrying only an asset id are resolved against `assets`; items that resolve
    /// to nothing are dropped.
    pub fn resolved_items(&self, assets: &[MediaAsset]) -> Vec<PlaylistItem> {
        let mut items: Vec<PlaylistItem> = self
            .items
            .iter()
            .filter_map(|item| {
                if item.media_asset.is_some() {
                    return Some(item.clone());
                }
                let asset_id = item.media_asset_id.as_deref()?;
                let asset = assets.iter().find(|a| a.id == asset_id)?;
                let mut resolved = item.clone();
                resolved.media_asset = Some(asset.clone());
                Some(resolved)
            })
            .collect();
        // Stable sort keeps backend order among equal display orders.
        items.sort_by_key(|item| item.display_order);
        items
    }

    /// Every asset referenced by this playlist.
    pub fn assets(&self, assets: &[MediaAsset]) -> Vec<MediaAsset> {
        self.resolved_items(assets)
            .into_iter()
            .filter_map(|item| item.media_asset)
            .collect()
    }
}
