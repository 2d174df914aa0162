//! Media download queue.
//!
//! - Priority ordering with FIFO among equals
//! - Idempotent enqueue (cached, queued and downloading assets are skipped)
//! - Fixed worker pool writing to staging files promoted into the cache
//! - Broadcast progress and completion events

mod events;
mod queue;
mod task;

pub use events::DownloadEvent;
pub use queue::{DownloadQueue, EnqueueOutcome, QueueStats};
pub use task::{DownloadStatus, DownloadTask};
