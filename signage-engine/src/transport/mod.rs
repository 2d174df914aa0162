//! Authenticated access to the signage backend.

pub mod api;
pub mod client;
mod sse;

pub use api::{
    AlertLevel, AlertReport, BackendApi, EventStreamConnector, HealthReport, MediaBody, MediaSource,
    SseFrame, StreamSignal,
};
pub use client::{ApiClient, DeviceIdentity, install_rustls_provider};

#[cfg(test)]
pub(crate) mod test_support;
