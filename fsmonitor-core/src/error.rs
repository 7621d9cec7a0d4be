//! Error types for the monitoring engine

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the monitoring engine.
///
/// Per-file provider failures during a scan are logged and contained by the
/// scanner rather than returned; processor failures are recorded as failed
/// `ProcessingResult`s rather than raised. Everything else ends up here.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("storage provider error: {0}")]
    Provider(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("invalid filter pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("event queue is closed")]
    QueueClosed,

    #[error("timed out after {0:?} waiting for the event queue to drain")]
    Timeout(Duration),

    #[error("misconfigured location '{location}': {reason}")]
    Misconfigured { location: String, reason: String },

    #[error("unknown location: {0}")]
    UnknownLocation(String),

    #[error("location root does not exist: {0}")]
    RootMissing(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl MonitorError {
    /// Wrap an arbitrary provider-side failure.
    pub fn provider(err: impl Into<anyhow::Error>) -> Self {
        Self::Provider(err.into())
    }

    pub fn misconfigured(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Misconfigured { location: location.into(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
