//! Error taxonomy used for restart accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::error::mentions_out_of_memory;

/// How a reported error is treated by the supervisor. Every error falls into exactly
/// one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connectivity; never counted.
    Network,
    /// Recoverable fault in one component; counted for alerting only.
    Component,
    /// Counts toward a full restart.
    Critical,
    /// Never restarts the process; the offending asset is skipped.
    OutOfMemory,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Component => "component",
            Self::Critical => "critical",
            Self::OutOfMemory => "out_of_memory",
        }
    }

    pub fn counts_toward_restart(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component an error was reported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Sync,
    Notification,
    Download,
    Playback,
    Cache,
    /// Uncaught top-level fault (panic or crashed task).
    Crash,
    Engine,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Notification => "notification",
            Self::Download => "download",
            Self::Playback => "playback",
            Self::Cache => "cache",
            Self::Crash => "crash",
            Self::Engine => "engine",
        }
    }
}

impl std::fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify(source: ErrorSource, error: &Error) -> ErrorCategory {
    if error.is_out_of_memory() {
        return ErrorCategory::OutOfMemory;
    }
    if error.is_network() || error.is_unpaired() {
        return ErrorCategory::Network;
    }
    if source == ErrorSource::Crash {
        return ErrorCategory::Critical;
    }
    match error {
        // A failed download only fails its task; the next diff retries it.
        Error::Io(_) | Error::IoPath { .. }
            if matches!(source, ErrorSource::Download | ErrorSource::Cache) =>
        {
            ErrorCategory::Component
        }
        Error::DatabaseSqlx(_)
        | Error::Migration(_)
        | Error::Io(_)
        | Error::IoPath { .. }
        | Error::Configuration(_)
        | Error::InvalidStateTransition { .. } => ErrorCategory::Critical,
        Error::HttpStatus { status, .. } if *status >= 500 => ErrorCategory::Network,
        _ => ErrorCategory::Component,
    }
}

/// One reported error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub source: ErrorSource,
    pub category: ErrorCategory,
    pub message: String,
    /// Asset being rendered or downloaded, when relevant.
    pub media_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(source: ErrorSource, error: &Error) -> Self {
        Self {
            source,
            category: classify(source, error),
            message: error.to_string(),
            media_id: None,
            timestamp: Utc::now(),
        }
    }

    /// A top-level fault. Allocation failures stay out of restart accounting.
    pub fn crash(message: impl Into<String>) -> Self {
        let message = message.into();
        let category = if mentions_out_of_memory(&message) {
            ErrorCategory::OutOfMemory
        } else {
            ErrorCategory::Critical
        };
        Self {
            source: ErrorSource::Crash,
            category,
            message,
            media_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_media(mut self, media_id: impl Into<String>) -> Self {
        self.media_id = Some(media_id.into());
        self
    }
}

/// Non-blocking error reporting into the supervisor.
pub trait ErrorSink: Send + Sync {
    fn report(&self, report: ErrorReport);
}
