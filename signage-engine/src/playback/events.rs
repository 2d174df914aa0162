//! Playback events.

use serde::Serialize;

use crate::domain::MediaKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaybackEvent {
    Started {
        index: usize,
        item_id: String,
        media_id: String,
        kind: MediaKind,
    },
    /// The item finished on its own (timeout or native completion).
    Completed {
        index: usize,
        item_id: String,
    },
    /// The last item finished and playback wrapped, or the playlist is empty.
    PlaylistCompleted {
        items: usize,
    },
    Error {
        index: usize,
        item_id: String,
        media_id: Option<String>,
        error: String,
        out_of_memory: bool,
    },
}
