//! File monitoring engine
//!
//! This module family implements detection, queueing, and processing of
//! file-level changes per monitored location:
//! - change detection against the last recorded event (`detector`)
//! - on-demand scanning with pagination, filtering, and progress (`scanner`)
//! - real-time watching with per-path debouncing (`watcher`, `debouncer`)
//! - a bounded completable event queue (`queue`)
//! - token-bucket rate limiting of the processing side (`rate_limit`)
//! - a behavior-decorated processor chain (`processor`)
//! - the per-location state machine and processing loop (`handler`)
//! - a named-location façade (`service`)

pub mod debouncer;
pub mod detector;
pub mod handler;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod scanner;
pub mod service;
pub mod watcher;

pub use debouncer::Debouncer;
pub use detector::determine_event_type;
pub use handler::{HandlerState, LocationHandler, LocationStatus};
pub use processor::{
    BehaviorDecorator, FileProcessor, ProcessorBehavior, ProcessorChain, ProcessorConfig,
};
pub use queue::EventQueue;
pub use rate_limit::RateLimiter;
pub use scanner::{ProgressFn, ScanObserver, ScanOptions, ScanProgress, Scanner};
pub use service::MonitoringService;
pub use watcher::{BroadcastWatcher, LocalFsWatcher, LocationWatcher};

use crate::error::Result;
use crate::storage::StorageProvider;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Kind of a detected file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Changed,
    Deleted,
    Unchanged,
}

/// One detected change to one file.
///
/// Immutable after creation; persisted once before processing and only ever
/// superseded by a later event for the same path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEvent {
    pub id: Uuid,
    /// Name of the monitored location this event belongs to.
    pub location: String,
    /// Path relative to the location root, forward slashes.
    pub path: String,
    pub event_type: EventType,
    pub detected_at: DateTime<Utc>,
    /// File size in bytes; `None` for deletions.
    pub size: Option<u64>,
    /// Provider-reported last-modified time; `None` for deletions.
    pub modified: Option<DateTime<Utc>>,
    /// SHA-256 hex of the contents; empty when checksumming was skipped or
    /// the file was deleted.
    pub checksum: String,
}

impl FileEvent {
    pub fn new(
        location: impl Into<String>,
        path: impl Into<String>,
        event_type: EventType,
        size: Option<u64>,
        modified: Option<DateTime<Utc>>,
        checksum: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            location: location.into(),
            path: path.into(),
            event_type,
            detected_at: Utc::now(),
            size,
            modified,
            checksum,
        }
    }

    /// Synthesize a deletion event for a path that disappeared.
    pub fn deleted(location: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(location, path, EventType::Deleted, None, None, String::new())
    }
}

/// Outcome of one processor acting on one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub event_id: Uuid,
    pub processor: String,
    pub success: bool,
    /// Success note or the first error message.
    pub message: String,
}

impl ProcessingResult {
    pub fn from_outcome(
        event: &FileEvent,
        processor: &str,
        outcome: &anyhow::Result<()>,
    ) -> Self {
        match outcome {
            Ok(()) => Self {
                event_id: event.id,
                processor: processor.to_string(),
                success: true,
                message: "processed".to_string(),
            },
            Err(err) => Self {
                event_id: event.id,
                processor: processor.to_string(),
                success: false,
                message: err.to_string(),
            },
        }
    }
}

/// Record of one scan invocation, returned to the caller.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub location: String,
    pub scan_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set when the scan was cancelled and `events` is a partial result.
    pub cancelled: bool,
    /// Events produced by this scan, in detection order.
    pub events: Vec<FileEvent>,
}

impl ScanContext {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            scan_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            cancelled: false,
            events: Vec::new(),
        }
    }

    pub fn elapsed(&self) -> Option<chrono::TimeDelta> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// Per-event execution context passed through the processor chain.
///
/// Carries the event, the location's storage provider, and a map of named
/// side-channel values that processors and behaviors may read.
pub struct ProcessingContext {
    event: FileEvent,
    provider: Arc<dyn StorageProvider>,
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ProcessingContext {
    pub fn new(event: FileEvent, provider: Arc<dyn StorageProvider>) -> Self {
        Self { event, provider, values: HashMap::new() }
    }

    pub fn event(&self) -> &FileEvent {
        &self.event
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    /// Attach a named side-channel value for processors and behaviors.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values.get(key).cloned().and_then(|v| v.downcast::<T>().ok())
    }
}

/// Processing-side rate limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitOptions {
    /// Sustained rate; zero or negative disables limiting.
    pub events_per_second: f64,
    pub max_burst: u32,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self { events_per_second: 100.0, max_burst: 25 }
    }
}

/// Configuration of one monitored location.
///
/// Immutable for the lifetime of its handler.
#[derive(Clone)]
pub struct LocationOptions {
    /// Name of the location; keys events and handlers.
    pub location: String,
    /// Glob restricting which files are considered, e.g. `*.csv`.
    pub file_pattern: Option<String>,
    /// Globs of paths to always exclude.
    pub blacklist: Vec<String>,
    /// Suppress the real-time watcher; only explicit scans detect changes.
    pub use_on_demand_only: bool,
    /// Run an initial scan right after `start`.
    pub scan_on_start: bool,
    pub rate_limit: RateLimitOptions,
    /// Skip checksum fetches; change detection falls back to timestamps.
    pub skip_checksum: bool,
    pub max_files_to_scan: Option<usize>,
    /// Detected files per pacing batch during a scan.
    pub batch_size: usize,
    /// Optional sleep applied after every batch.
    pub delay_per_batch: Option<Duration>,
    /// Granularity of progress callbacks, in percent.
    pub progress_interval_percent: u8,
    /// Block scans until the queue drains.
    pub wait_for_processing: bool,
    /// Deadline for the post-scan drain; defaults to five minutes.
    pub processing_timeout: Option<Duration>,
    /// Event types surfaced to the queue and context.
    pub event_filter: Vec<EventType>,
    /// Window for coalescing rapid native notifications per path.
    pub debounce_interval: Duration,
    pub queue_capacity: usize,
    /// Fail a scan immediately when the location root does not exist.
    pub fail_if_root_missing: bool,
    /// Ordered processor chain configuration.
    pub processors: Vec<ProcessorConfig>,
    /// Behaviors applied to every processor, innermost first.
    pub location_behaviors: Vec<Arc<dyn ProcessorBehavior>>,
}

impl LocationOptions {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            file_pattern: None,
            blacklist: Vec::new(),
            use_on_demand_only: false,
            scan_on_start: false,
            rate_limit: RateLimitOptions::default(),
            skip_checksum: false,
            max_files_to_scan: None,
            batch_size: 100,
            delay_per_batch: None,
            progress_interval_percent: 10,
            wait_for_processing: false,
            processing_timeout: None,
            event_filter: vec![EventType::Added, EventType::Changed, EventType::Deleted],
            debounce_interval: Duration::from_millis(500),
            queue_capacity: 10_000,
            fail_if_root_missing: false,
            processors: Vec::new(),
            location_behaviors: Vec::new(),
        }
    }
}

/// Compiled include/exclude filters applied to relative paths.
///
/// Applied both when a native event arrives and again when the debouncer
/// flushes, and to every listed or missing path during a scan.
#[derive(Debug, Clone, Default)]
pub struct PathFilters {
    pattern: Option<GlobSet>,
    blacklist: Option<GlobSet>,
}

impl PathFilters {
    pub fn new(pattern: Option<&str>, blacklist: &[String]) -> Result<Self> {
        let pattern = match pattern {
            Some(glob) => {
                let mut builder = GlobSetBuilder::new();
                builder.add(Glob::new(glob)?);
                Some(builder.build()?)
            }
            None => None,
        };
        let blacklist = if blacklist.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for glob in blacklist {
                builder.add(Glob::new(glob)?);
            }
            Some(builder.build()?)
        };
        Ok(Self { pattern, blacklist })
    }

    pub fn from_options(options: &LocationOptions) -> Result<Self> {
        Self::new(options.file_pattern.as_deref(), &options.blacklist)
    }

    pub fn matches(&self, path: &str) -> bool {
        if let Some(blacklist) = &self.blacklist {
            if blacklist.is_match(path) {
                return false;
            }
        }
        match &self.pattern {
            Some(pattern) => pattern.is_match(path),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_pattern_and_blacklist() {
        let filters =
            PathFilters::new(Some("*.csv"), &["tmp/**".to_string(), "*.bak".to_string()]).unwrap();

        assert!(filters.matches("data.csv"));
        assert!(!filters.matches("notes.txt"));
        assert!(!filters.matches("data.bak"));
        assert!(!filters.matches("tmp/data.csv"));
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let filters = PathFilters::new(None, &[]).unwrap();
        assert!(filters.matches("anything/at/all.bin"));
    }

    #[test]
    fn test_processing_context_side_channel() {
        let provider: Arc<dyn StorageProvider> =
            Arc::new(crate::storage::InMemoryStorageProvider::new());
        let event = FileEvent::new("loc", "a.txt", EventType::Added, Some(1), None, String::new());

        let mut ctx = ProcessingContext::new(event, provider);
        ctx.insert("retries", 3u32);

        assert_eq!(*ctx.get::<u32>("retries").unwrap(), 3);
        assert!(ctx.get::<String>("retries").is_none());
        assert!(ctx.get::<u32>("missing").is_none());
    }

    #[test]
    fn test_deleted_event_has_no_metadata() {
        let event = FileEvent::deleted("loc", "gone.txt");
        assert_eq!(event.event_type, EventType::Deleted);
        assert!(event.size.is_none());
        assert!(event.modified.is_none());
        assert!(event.checksum.is_empty());
    }

    #[test]
    fn test_file_event_json_round_trip() {
        let event = FileEvent::new(
            "loc",
            "a/b.csv",
            EventType::Changed,
            Some(42),
            Some(Utc::now()),
            "deadbeef".to_string(),
        );

        let json = serde_json::to_string(&event).unwrap();
        let back: FileEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
