//! signage-engine library crate.
//!
//! Keeps a signage terminal's content in sync with its backend, caches media locally,
//! plays the active playlist and supervises itself. [`engine::SignageEngine`] wires the
//! pieces together; each module can also be used on its own.

pub mod cache;
pub mod config;
pub mod database;
pub mod domain;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod logging;
pub mod notification;
pub mod panic_hook;
pub mod playback;
pub mod supervisor;
pub mod sync;
pub mod transport;
pub mod utils;

pub use engine::SignageEngine;
pub use error::{Error, Result};
