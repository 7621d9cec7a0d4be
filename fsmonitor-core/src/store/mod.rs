//! Durable event store abstraction
//!
//! The store records every detected file event and every processor outcome,
//! keyed by location and file path, and answers "what files are currently
//! known to exist" queries for the scanner's deletion pass. The in-memory
//! implementation here is the reference store; durable backends implement
//! the same trait.

use crate::error::Result;
use crate::monitor::{EventType, FileEvent, ProcessingResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Paths whose most recent event says the file exists.
    async fn get_present_files(&self, location: &str) -> Result<HashSet<String>>;

    /// Most recent event for a path, if any.
    async fn get_file_event(&self, location: &str, path: &str) -> Result<Option<FileEvent>>;

    async fn store_event(&self, event: &FileEvent, cancel: &CancellationToken) -> Result<()>;

    async fn store_processing_result(
        &self,
        result: &ProcessingResult,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// All events for a path, oldest first.
    async fn get_file_events(&self, location: &str, path: &str) -> Result<Vec<FileEvent>>;

    /// All events for a location, oldest first.
    async fn get_events_for_location(&self, location: &str) -> Result<Vec<FileEvent>>;

    /// All processing results recorded for one event.
    async fn get_processing_results(&self, event_id: Uuid) -> Result<Vec<ProcessingResult>>;
}

/// Event store keeping everything in process memory.
pub struct InMemoryEventStore {
    // Per-location append-only event logs.
    events: DashMap<String, Vec<FileEvent>>,
    results: Mutex<Vec<ProcessingResult>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self { events: DashMap::new(), results: Mutex::new(Vec::new()) }
    }

    pub fn event_count(&self, location: &str) -> usize {
        self.events.get(location).map(|log| log.len()).unwrap_or(0)
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn get_present_files(&self, location: &str) -> Result<HashSet<String>> {
        let mut latest: std::collections::HashMap<String, EventType> =
            std::collections::HashMap::new();
        if let Some(log) = self.events.get(location) {
            for event in log.iter() {
                latest.insert(event.path.clone(), event.event_type);
            }
        }
        Ok(latest
            .into_iter()
            .filter(|(_, event_type)| *event_type != EventType::Deleted)
            .map(|(path, _)| path)
            .collect())
    }

    async fn get_file_event(&self, location: &str, path: &str) -> Result<Option<FileEvent>> {
        Ok(self
            .events
            .get(location)
            .and_then(|log| log.iter().rev().find(|e| e.path == path).cloned()))
    }

    async fn store_event(&self, event: &FileEvent, _cancel: &CancellationToken) -> Result<()> {
        self.events.entry(event.location.clone()).or_default().push(event.clone());
        Ok(())
    }

    async fn store_processing_result(
        &self,
        result: &ProcessingResult,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }

    async fn get_file_events(&self, location: &str, path: &str) -> Result<Vec<FileEvent>> {
        Ok(self
            .events
            .get(location)
            .map(|log| log.iter().filter(|e| e.path == path).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_events_for_location(&self, location: &str) -> Result<Vec<FileEvent>> {
        Ok(self.events.get(location).map(|log| log.clone()).unwrap_or_default())
    }

    async fn get_processing_results(&self, event_id: Uuid) -> Result<Vec<ProcessingResult>> {
        Ok(self
            .results
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect())
    }
}
