//! Playlist playback.
//!
//! A single actor owns the playlist position. Timers and renderer reports are tagged
//! with the render attempt they belong to; anything from a superseded attempt is dropped.

mod controller;
mod events;
mod renderer;

pub use controller::{PlaybackController, PlaybackHandle, PlaybackState, PlaybackStatus};
pub use events::PlaybackEvent;
pub use renderer::{
    LocalMedia, LoggingRenderer, RenderReporter, RenderRequest, RenderSource, RenderStrategy,
    Renderer, playable_items, same_playlist,
};
