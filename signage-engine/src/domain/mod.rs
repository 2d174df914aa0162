//! Domain layer for the signage engine.
//!
//! Entities pulled from the backend and the value objects derived from them.

pub mod content;
pub mod event;
pub mod media;
pub mod playlist;
pub mod priority;
pub mod schedule;

pub use content::{CurrentContentSnapshot, PollResponse, SyncResponse};
pub use event::{ChangeType, DeviceCommand, NotificationEvent};
pub use media::{MediaAsset, MediaKind};
pub use playlist::{DEFAULT_DISPLAY_DURATION_SECS, Playlist, PlaylistItem};
pub use priority::Priority;
pub use schedule::{Schedule, resolve_active};
