//! Renderer seam and per-item render strategies.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::controller::Command;
use crate::cache::CacheStore;
use crate::config::PlaybackConfig;
use crate::domain::{MediaAsset, MediaKind, PlaylistItem};
use crate::{Error, Result};

/// Where the renderer reads the media from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "location", rename_all = "snake_case")]
pub enum RenderSource {
    File(PathBuf),
    Remote(String),
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub index: usize,
    pub item: PlaylistItem,
    pub asset: MediaAsset,
    pub kind: MediaKind,
    pub source: RenderSource,
    /// Time after which the controller advances on its own.
    pub timeout: Duration,
}

/// Reports native completion or asynchronous failure of one render attempt.
///
/// Reports from an attempt the controller has moved past are ignored.
#[derive(Debug, Clone)]
pub struct RenderReporter {
    pub(super) tx: mpsc::UnboundedSender<Command>,
    pub(super) generation: u64,
}

impl RenderReporter {
    pub fn completed(&self) {
        let _ = self.tx.send(Command::RenderCompleted {
            generation: self.generation,
        });
    }

    pub fn failed(&self, error: Error) {
        let _ = self.tx.send(Command::RenderFailed {
            generation: self.generation,
            error,
        });
    }
}

/// Display surface.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Start showing `request`. An `Err` fails the item immediately.
    async fn play(&self, request: &RenderRequest, reporter: RenderReporter) -> Result<()>;

    /// Tear down whatever is on screen.
    async fn release(&self);
}

/// Resolves local files for cached media.
#[async_trait]
pub trait LocalMedia: Send + Sync {
    async fn cached_path(&self, asset: &MediaAsset) -> Option<PathBuf>;
}

#[async_trait]
impl LocalMedia for CacheStore {
    async fn cached_path(&self, asset: &MediaAsset) -> Option<PathBuf> {
        CacheStore::cached_path(self, asset).await
    }
}

/// Headless renderer that only logs; items advance on their timeouts.
#[derive(Debug, Default)]
pub struct LoggingRenderer;

#[async_trait]
impl Renderer for LoggingRenderer {
    async fn play(&self, request: &RenderRequest, _reporter: RenderReporter) -> Result<()> {
        info!(
            index = request.index,
            item_id = %request.item.id,
            media_id = %request.asset.id,
            kind = %request.kind,
            timeout_secs = request.timeout.as_secs_f64(),
            "Rendering {}",
            request.asset.name
        );
        Ok(())
    }

    async fn release(&self) {
        debug!("Renderer released");
    }
}

/// How one item is played, resolved once per render attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStrategy {
    /// Advances when the display duration elapses.
    Image { duration: Duration },
    /// Advances on native completion, or on the timeout as a fallback.
    LocalVideo { timeout: Duration },
    /// Advances when the display duration elapses; failures are retried.
    RemoteEmbed {
        duration: Duration,
        retries_left: u32,
    },
}

impl RenderStrategy {
    pub fn for_item(item: &PlaylistItem, asset: &MediaAsset, config: &PlaybackConfig) -> Option<Self> {
        let display = Duration::from_secs(u64::from(item.duration_secs()));
        match asset.kind() {
            MediaKind::Image => Some(Self::Image { duration: display }),
            MediaKind::LocalVideo => {
                let timeout = asset
                    .duration
                    .filter(|d| *d > 0.0)
                    .and_then(|d| Duration::try_from_secs_f64(d).ok())
                    .and_then(|d| d.checked_add(config.video_grace))
                    .unwrap_or(config.video_fallback);
                Some(Self::LocalVideo { timeout })
            }
            MediaKind::RemoteEmbed => Some(Self::RemoteEmbed {
                duration: display,
                retries_left: config.embed_retries,
            }),
            MediaKind::Unsupported => None,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Self::Image { duration } | Self::RemoteEmbed { duration, .. } => *duration,
            Self::LocalVideo { timeout } => *timeout,
        }
    }

    pub fn advances_on_completion(&self) -> bool {
        matches!(self, Self::LocalVideo { .. })
    }

    /// Retries left after a failure, if the strategy retries at all.
    pub fn retry(&self) -> Option<u32> {
        match self {
            Self::RemoteEmbed { retries_left, .. } if *retries_left > 0 => Some(retries_left - 1),
            _ => None,
        }
    }

    pub fn with_retries(self, retries: u32) -> Self {
        match self {
            Self::RemoteEmbed { duration, .. } => Self::RemoteEmbed {
                duration,
                retries_left: retries,
            },
            other => other,
        }
    }
}

/// Drop items without an asset or with media this terminal cannot play, then order
/// the rest by `display_order`.
pub fn playable_items(items: Vec<PlaylistItem>) -> Vec<PlaylistItem> {
    let mut items: Vec<PlaylistItem> = items
        .into_iter()
        .filter(|item| {
            item.media_asset
                .as_ref()
                .is_some_and(|asset| asset.kind().is_supported())
        })
        .collect();
    items.sort_by_key(|item| item.display_order);
    items
}

/// Element-wise equality on ids, durations, asset ids/urls and order.
pub fn same_playlist(a: &[PlaylistItem], b: &[PlaylistItem]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            let asset_key = |item: &PlaylistItem| {
                item.media_asset
                    .as_ref()
                    .map(|asset| (asset.id.clone(), asset.url.clone()))
            };
            x.id == y.id && x.duration_secs() == y.duration_secs() && asset_key(x) == asset_key(y)
        })
}
