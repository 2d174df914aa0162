//! Repository layer for database access.

pub mod cache_index;
pub mod device_state;

pub use cache_index::*;
pub use device_state::*;
