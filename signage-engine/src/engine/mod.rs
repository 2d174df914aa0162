//! Engine assembly: builds every component, starts them in order and shuts them down.

mod commands;
mod container;
pub mod identity;

pub use container::{EngineStatus, RESTART_EXIT_CODE, SignageEngine};
pub use identity::{load_identity, store_identity};
