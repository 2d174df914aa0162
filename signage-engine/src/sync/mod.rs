//! Periodic content synchronisation.

mod events;
mod orchestrator;

pub use events::{SyncEvent, SyncState};
pub use orchestrator::{CycleOutcome, SyncOrchestrator, SyncStatus};
