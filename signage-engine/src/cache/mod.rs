//! Local media cache: promoted files plus their persisted index.

mod entry;
mod store;

pub use entry::{CacheEntry, url_fingerprint};
pub use store::{CacheStats, CacheStore};
